//! Build-time files.
//!
//! Files are declared during startup and written only by the build persona.
//! Two declarations resolving to the same path are rejected immediately.

use crate::epoch::EpochHandle;
use crate::error::{PersonaError, PersonaResult};
use persona_identity::Id;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Produces a file's bytes during the build phase.
pub type Producer = Arc<dyn Fn() -> PersonaResult<Vec<u8>> + Send + Sync>;

/// Handle to a declared build-time file.
#[derive(Clone)]
pub struct BuildFile {
    id: Id,
    path: PathBuf,
    producer: Option<Producer>,
    epoch: EpochHandle,
    dir_ready: Arc<OnceLock<()>>,
}

impl BuildFile {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_producer(&self) -> bool {
        self.producer.is_some()
    }

    /// Current contents, `None` if the file does not exist yet.
    pub fn read(&self) -> PersonaResult<Option<Vec<u8>>> {
        self.epoch.assert_build_time("BuildFile::read")?;
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file contents.
    pub fn write(&self, bytes: &[u8]) -> PersonaResult<()> {
        self.epoch.assert_build_time("BuildFile::write")?;
        self.ensure_parent_dir()?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Run the producer, if any, and write its output.
    pub fn emit(&self) -> PersonaResult<bool> {
        let Some(producer) = &self.producer else {
            return Ok(false);
        };
        let bytes = producer()?;
        self.write(&bytes)?;
        Ok(true)
    }

    fn ensure_parent_dir(&self) -> PersonaResult<()> {
        if self.dir_ready.get().is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let _ = self.dir_ready.set(());
        Ok(())
    }
}

impl fmt::Debug for BuildFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("producer", &self.producer.is_some())
            .finish()
    }
}

/// Every build file declared in one application context, keyed by path.
#[derive(Debug, Default)]
pub struct FileRegistry {
    by_path: BTreeMap<PathBuf, BuildFile>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn declare(
        &mut self,
        id: Id,
        path: PathBuf,
        producer: Option<Producer>,
        epoch: EpochHandle,
    ) -> PersonaResult<BuildFile> {
        if self.by_path.contains_key(&path) {
            return Err(PersonaError::DuplicateFile(path));
        }
        let file = BuildFile {
            id,
            path: path.clone(),
            producer,
            epoch,
            dir_ready: Arc::new(OnceLock::new()),
        };
        self.by_path.insert(path, file.clone());
        Ok(file)
    }

    pub fn files(&self) -> impl Iterator<Item = &BuildFile> {
        self.by_path.values()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

//! Build-time persistent key/value store.
//!
//! Values survive across separate build invocations: the map is hydrated from
//! its JSON file on first access and the whole file is rewritten after every
//! mutation. There is no file locking; one build process at a time.

use crate::epoch::EpochHandle;
use crate::error::{PersonaError, PersonaResult};
use crate::files::BuildFile;
use persona_identity::Id;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

type Map = BTreeMap<String, Value>;

pub(crate) struct StoreState {
    path: PathBuf,
    data: Mutex<Option<Map>>,
}

impl StoreState {
    pub(crate) fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            data: Mutex::new(None),
        })
    }

    fn lock(&self) -> PersonaResult<MutexGuard<'_, Option<Map>>> {
        self.data
            .lock()
            .map_err(|_| PersonaError::Backend("persistent store lock poisoned".to_string()))
    }

    /// Serialized map, used as the backing file's producer.
    pub(crate) fn snapshot_bytes(&self) -> PersonaResult<Vec<u8>> {
        let mut guard = self.lock()?;
        let map = hydrate(&mut guard, &self.path)?;
        Ok(serde_json::to_vec_pretty(map)?)
    }
}

fn hydrate<'a>(slot: &'a mut Option<Map>, path: &Path) -> PersonaResult<&'a mut Map> {
    if slot.is_none() {
        *slot = Some(read_map(path)?);
    }
    slot.as_mut()
        .ok_or_else(|| PersonaError::Unreachable("store hydrated without data".to_string()))
}

fn read_map(path: &Path) -> PersonaResult<Map> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Map::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(e.into()),
    }
}

/// Identity-keyed JSON store persisted in the build directory.
#[derive(Clone)]
pub struct PersistentStore {
    id: Id,
    file: BuildFile,
    state: Arc<StoreState>,
    epoch: EpochHandle,
}

impl PersistentStore {
    pub(crate) fn new(id: Id, file: BuildFile, state: Arc<StoreState>, epoch: EpochHandle) -> Self {
        Self {
            id,
            file,
            state,
            epoch,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn get(&self, key: &Id) -> PersonaResult<Option<Value>> {
        self.epoch.assert_build_time("PersistentStore::get")?;
        let mut guard = self.state.lock()?;
        let map = hydrate(&mut guard, &self.state.path)?;
        Ok(map.get(key.value()).cloned())
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &Id) -> PersonaResult<Option<T>> {
        self.get(key)?
            .map(|v| serde_json::from_value(v).map_err(PersonaError::from))
            .transpose()
    }

    /// Store a value (copied through JSON) and flush the file.
    pub fn set<T: Serialize>(&self, key: &Id, value: &T) -> PersonaResult<()> {
        self.epoch.assert_build_time("PersistentStore::set")?;
        let value = serde_json::to_value(value)?;
        let mut guard = self.state.lock()?;
        let map = hydrate(&mut guard, &self.state.path)?;
        map.insert(key.value().to_string(), value);
        self.flush(map)
    }

    /// Remove a key and flush. Returns whether the key was present.
    pub fn delete(&self, key: &Id) -> PersonaResult<bool> {
        self.epoch.assert_build_time("PersistentStore::delete")?;
        let mut guard = self.state.lock()?;
        let map = hydrate(&mut guard, &self.state.path)?;
        let existed = map.remove(key.value()).is_some();
        if existed {
            self.flush(map)?;
        }
        Ok(existed)
    }

    /// Existing value for `key`, or a freshly computed and persisted default.
    ///
    /// The default is computed without holding the store lock, so it may read
    /// this same store.
    pub fn get_or_insert<T, F>(&self, key: &Id, default: F) -> PersonaResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> PersonaResult<T>,
    {
        if let Some(existing) = self.get_as::<T>(key)? {
            return Ok(existing);
        }

        let fresh = serde_json::to_value(default()?)?;
        let mut guard = self.state.lock()?;
        let map = hydrate(&mut guard, &self.state.path)?;
        let stored = match map.get(key.value()) {
            Some(existing) => existing.clone(),
            None => {
                map.insert(key.value().to_string(), fresh.clone());
                self.flush(map)?;
                fresh
            }
        };
        Ok(serde_json::from_value(stored)?)
    }

    /// Copy of every stored entry, keyed by encoded id.
    pub fn entries(&self) -> PersonaResult<BTreeMap<String, Value>> {
        self.epoch.assert_build_time("PersistentStore::entries")?;
        let mut guard = self.state.lock()?;
        Ok(hydrate(&mut guard, &self.state.path)?.clone())
    }

    fn flush(&self, map: &Map) -> PersonaResult<()> {
        let bytes = serde_json::to_vec_pretty(map)?;
        self.file.write(&bytes)
    }
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("id", &self.id)
            .field("path", &self.file.path())
            .finish()
    }
}

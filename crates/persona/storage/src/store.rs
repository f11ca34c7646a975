//! Key/value store handles.
//!
//! A [`KvStore`] is declared during startup and used at runtime. The backend
//! is opened on first use: in memory when the application runs in one
//! process, on the application's database when distributed.

use crate::database::Database;
use crate::index::{IndexDef, IndexEntry, IndexHit, IndexQuery};
use crate::memory::MemoryBackend;
use crate::traits::{KvBackend, Modifier};
use crate::{StorageError, StorageResult};
use futures::stream::{self, BoxStream, StreamExt};
use persona_core::{EpochHandle, ExecutionMode};
use persona_identity::Id;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::debug;

/// Default page size for [`KvStore::all_keys`].
pub const DEFAULT_KEY_BATCH: usize = 100;

#[derive(Clone)]
pub(crate) enum Source {
    Memory,
    Database(Database),
}

/// Table names claimed on one database, by stores and indexes alike.
#[derive(Debug, Clone, Default)]
pub(crate) struct TableNames(Arc<Mutex<BTreeSet<String>>>);

impl TableNames {
    fn holding(table: String) -> Self {
        Self(Arc::new(Mutex::new(BTreeSet::from([table]))))
    }

    /// Returns `false` when `table` was already claimed.
    pub(crate) fn claim(&self, table: &str) -> StorageResult<bool> {
        let mut names = self
            .0
            .lock()
            .map_err(|_| StorageError::Backend("table name lock poisoned".to_string()))?;
        Ok(names.insert(table.to_string()))
    }
}

/// Handle to a declared index, used for lookups.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    store: KvStore,
    table: String,
}

impl IndexHandle {
    /// Storage name of the index.
    pub fn name(&self) -> &str {
        &self.table
    }

    pub async fn lookup(&self, index_key: &str, query: IndexQuery) -> StorageResult<Vec<IndexHit>> {
        self.store.guard("IndexHandle::lookup")?;
        let backend = self.store.backend().await?;
        backend.lookup(&self.table, index_key, query).await
    }

    /// Keys whose value is indexed under `index_key`.
    pub async fn keys(&self, index_key: &str) -> StorageResult<Vec<String>> {
        let hits = self.lookup(index_key, IndexQuery::KEYS).await?;
        Ok(hits.into_iter().map(|hit| hit.key).collect())
    }
}

/// Key/value table with secondary indexes.
#[derive(Clone)]
pub struct KvStore {
    id: Id,
    table: String,
    epoch: EpochHandle,
    source: Source,
    tables: TableNames,
    indexes: Arc<RwLock<Vec<IndexDef>>>,
    backend: Arc<OnceCell<Arc<dyn KvBackend>>>,
}

impl KvStore {
    /// In-memory store, whatever the execution mode.
    pub fn in_memory(id: Id, epoch: EpochHandle) -> Self {
        let tables = TableNames::holding(id.to_safe_name());
        Self::with_source(id, epoch, Source::Memory, tables)
    }

    /// The caller has already claimed the store's table in `tables`.
    pub(crate) fn with_source(
        id: Id,
        epoch: EpochHandle,
        source: Source,
        tables: TableNames,
    ) -> Self {
        let table = id.to_safe_name();
        debug!(store = %id, %table, "declared key/value store");
        Self {
            id,
            table,
            epoch,
            source,
            tables,
            indexes: Arc::new(RwLock::new(Vec::new())),
            backend: Arc::new(OnceCell::new()),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Storage name of the primary table.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.source {
            Source::Memory => ExecutionMode::InProcess,
            Source::Database(_) => ExecutionMode::Distributed,
        }
    }

    /// Declare a secondary index. Only legal during startup, and the index
    /// name must be free across the whole database.
    pub fn define_index<F>(&self, id: Id, indexer: F) -> StorageResult<IndexHandle>
    where
        F: Fn(&Value) -> Vec<IndexEntry> + Send + Sync + 'static,
    {
        self.epoch.assert_startup_time("KvStore::define_index")?;
        let def = IndexDef::new(id, indexer);
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| StorageError::Backend("index list lock poisoned".to_string()))?;
        if !self.tables.claim(&def.table)? {
            return Err(StorageError::DuplicateIndex(def.id.to_string()));
        }
        debug!(store = %self.id, index = %def.id, "declared index");
        let handle = IndexHandle {
            store: self.clone(),
            table: def.table.clone(),
        };
        indexes.push(def);
        Ok(handle)
    }

    fn guard(&self, operation: &str) -> StorageResult<()> {
        self.epoch.assert_runtime(operation)?;
        Ok(())
    }

    async fn backend(&self) -> StorageResult<Arc<dyn KvBackend>> {
        self.backend
            .get_or_try_init(|| self.open_backend())
            .await
            .map(Arc::clone)
    }

    async fn open_backend(&self) -> StorageResult<Arc<dyn KvBackend>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| StorageError::Backend("index list lock poisoned".to_string()))?
            .clone();
        match &self.source {
            Source::Memory => Ok(Arc::new(MemoryBackend::new(indexes))),
            Source::Database(database) => database.open_table(&self.table, indexes).await,
        }
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.guard("KvStore::get")?;
        self.backend().await?.get(key).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn has(&self, key: &str) -> StorageResult<bool> {
        self.guard("KvStore::has")?;
        self.backend().await?.has(key).await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        self.guard("KvStore::set")?;
        let value = serde_json::to_value(value)?;
        self.backend().await?.set(key, value).await
    }

    pub async fn del(&self, key: &str) -> StorageResult<bool> {
        self.guard("KvStore::del")?;
        self.backend().await?.del(key).await
    }

    /// Atomic read-modify-write. `f` sees the current value (if any) and
    /// returns the replacement, or `None` to delete the key.
    pub async fn modify<F>(&self, key: &str, f: F) -> StorageResult<Option<Value>>
    where
        F: FnOnce(Option<Value>) -> Option<Value> + Send + 'static,
    {
        self.guard("KvStore::modify")?;
        let modifier: Modifier = Box::new(f);
        self.backend().await?.modify(key, modifier).await
    }

    /// Every key, in batches of at most `batch` keys.
    ///
    /// The in-memory backend lists the keys present when iteration starts;
    /// the database backend pages through the table in key order.
    pub fn all_keys(&self, batch: usize) -> BoxStream<'static, StorageResult<Vec<String>>> {
        let batch = batch.max(1);
        stream::try_unfold(KeyCursor::Start(self.clone()), move |cursor| {
            next_key_page(cursor, batch)
        })
        .boxed()
    }
}

enum KeyCursor {
    Start(KvStore),
    Snapshot(std::vec::IntoIter<String>),
    Paging {
        backend: Arc<dyn KvBackend>,
        after: Option<String>,
    },
    Done,
}

async fn next_key_page(
    cursor: KeyCursor,
    batch: usize,
) -> StorageResult<Option<(Vec<String>, KeyCursor)>> {
    let cursor = match cursor {
        KeyCursor::Start(store) => {
            store.guard("KvStore::all_keys")?;
            let backend = store.backend().await?;
            match backend.snapshot_keys()? {
                Some(keys) => KeyCursor::Snapshot(keys.into_iter()),
                None => KeyCursor::Paging {
                    backend,
                    after: None,
                },
            }
        }
        other => other,
    };

    match cursor {
        KeyCursor::Snapshot(mut keys) => {
            let page: Vec<String> = keys.by_ref().take(batch).collect();
            if page.is_empty() {
                Ok(None)
            } else {
                Ok(Some((page, KeyCursor::Snapshot(keys))))
            }
        }
        KeyCursor::Paging { backend, after } => {
            let page = backend.key_batch(after.as_deref(), batch).await?;
            let Some(last) = page.last().cloned() else {
                return Ok(None);
            };
            let next = if page.len() < batch {
                KeyCursor::Done
            } else {
                KeyCursor::Paging {
                    backend,
                    after: Some(last),
                }
            };
            Ok(Some((page, next)))
        }
        KeyCursor::Start(_) | KeyCursor::Done => Ok(None),
    }
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("mode", &self.mode())
            .field("open", &self.backend.initialized())
            .finish()
    }
}

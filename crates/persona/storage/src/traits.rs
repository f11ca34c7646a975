use crate::index::{IndexHit, IndexQuery};
use crate::StorageResult;
use async_trait::async_trait;
use serde_json::Value;

/// Read-modify-write step applied atomically by [`KvBackend::modify`].
/// Returning `None` deletes the key.
pub type Modifier = Box<dyn FnOnce(Option<Value>) -> Option<Value> + Send>;

/// Storage interface for one key/value table and its indexes.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn has(&self, key: &str) -> StorageResult<bool>;

    /// Insert or replace a value and rewrite its index memberships.
    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Remove a value and its index memberships. Returns whether it existed.
    async fn del(&self, key: &str) -> StorageResult<bool>;

    /// Atomically replace the value with `f(current)`; returns the new value.
    async fn modify(&self, key: &str, f: Modifier) -> StorageResult<Option<Value>>;

    /// Up to `limit` keys strictly after `after`, in key order.
    async fn key_batch(&self, after: Option<&str>, limit: usize) -> StorageResult<Vec<String>>;

    /// Rows whose `index` membership has the given index key, in key order.
    async fn lookup(
        &self,
        index: &str,
        index_key: &str,
        query: IndexQuery,
    ) -> StorageResult<Vec<IndexHit>>;

    /// Every key at this instant, if the backend can take such a snapshot
    /// cheaply. Backends returning `None` are paged with `key_batch`.
    fn snapshot_keys(&self) -> StorageResult<Option<Vec<String>>> {
        Ok(None)
    }
}

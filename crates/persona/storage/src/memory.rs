//! In-memory backend used when the whole application runs in one process.
//!
//! Every operation takes the table lock once and never awaits while holding
//! it, so `modify` is atomic with respect to every other call.

use crate::index::{IndexDef, IndexHit, IndexQuery};
use crate::traits::{KvBackend, Modifier};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Index key -> primary key -> inline data.
type IndexTable = BTreeMap<String, BTreeMap<String, Option<Value>>>;

struct Row {
    value: Value,
    /// `(index position, index key)` for every membership of this row
    memberships: Vec<(usize, String)>,
}

#[derive(Default)]
struct Tables {
    primary: BTreeMap<String, Row>,
    indexes: Vec<IndexTable>,
}

impl Tables {
    fn unlink(&mut self, key: &str, memberships: &[(usize, String)]) {
        for (position, index_key) in memberships {
            let Some(table) = self.indexes.get_mut(*position) else {
                continue;
            };
            if let Some(members) = table.get_mut(index_key) {
                members.remove(key);
                if members.is_empty() {
                    table.remove(index_key);
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<Row> {
        let row = self.primary.remove(key)?;
        self.unlink(key, &row.memberships);
        Some(row)
    }

    fn insert(&mut self, key: &str, value: Value, entries: Vec<BTreeMap<String, Option<Value>>>) {
        if let Some(old) = self.primary.get(key) {
            let memberships = old.memberships.clone();
            self.unlink(key, &memberships);
        }
        let mut memberships = Vec::new();
        for (position, entries) in entries.into_iter().enumerate() {
            let Some(table) = self.indexes.get_mut(position) else {
                continue;
            };
            for (index_key, inline) in entries {
                table
                    .entry(index_key.clone())
                    .or_default()
                    .insert(key.to_string(), inline);
                memberships.push((position, index_key));
            }
        }
        self.primary.insert(key.to_string(), Row { value, memberships });
    }
}

/// In-memory table with secondary indexes.
pub struct MemoryBackend {
    indexes: Vec<IndexDef>,
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new(indexes: Vec<IndexDef>) -> Self {
        let tables = Tables {
            primary: BTreeMap::new(),
            indexes: vec![IndexTable::new(); indexes.len()],
        };
        Self {
            indexes,
            tables: RwLock::new(tables),
        }
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StorageError::Backend("memory table lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StorageError::Backend("memory table lock poisoned".to_string()))
    }

    fn index_entries(&self, value: &Value) -> Vec<BTreeMap<String, Option<Value>>> {
        self.indexes.iter().map(|index| index.entries_for(value)).collect()
    }

    fn position(&self, index: &str) -> StorageResult<usize> {
        self.indexes
            .iter()
            .position(|def| def.table == index)
            .ok_or_else(|| StorageError::UnknownIndex(index.to_string()))
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.read()?.primary.get(key).map(|row| row.value.clone()))
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.read()?.primary.contains_key(key))
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let entries = self.index_entries(&value);
        self.write()?.insert(key, value, entries);
        Ok(())
    }

    async fn del(&self, key: &str) -> StorageResult<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn modify(&self, key: &str, f: Modifier) -> StorageResult<Option<Value>> {
        let mut tables = self.write()?;
        let current = tables.primary.get(key).map(|row| row.value.clone());
        match f(current) {
            Some(value) => {
                let entries = self.index_entries(&value);
                tables.insert(key, value.clone(), entries);
                Ok(Some(value))
            }
            None => {
                tables.remove(key);
                Ok(None)
            }
        }
    }

    async fn key_batch(&self, after: Option<&str>, limit: usize) -> StorageResult<Vec<String>> {
        let tables = self.read()?;
        let lower = match after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        Ok(tables
            .primary
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn lookup(
        &self,
        index: &str,
        index_key: &str,
        query: IndexQuery,
    ) -> StorageResult<Vec<IndexHit>> {
        let position = self.position(index)?;
        let tables = self.read()?;
        let Some(members) = tables.indexes.get(position).and_then(|t| t.get(index_key)) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .map(|(key, inline)| IndexHit {
                key: key.clone(),
                index_key: index_key.to_string(),
                inline: if query.include_inline {
                    inline.clone()
                } else {
                    None
                },
                value: if query.join_primary {
                    tables.primary.get(key).map(|row| row.value.clone())
                } else {
                    None
                },
            })
            .collect())
    }

    fn snapshot_keys(&self) -> StorageResult<Option<Vec<String>>> {
        Ok(Some(self.read()?.primary.keys().cloned().collect()))
    }
}

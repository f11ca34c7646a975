//! Secondary index definitions.
//!
//! An indexer maps a stored value to zero or more index entries. Changing an
//! indexer does not re-index existing rows: bind the new indexer to a new
//! index id (e.g. `by_email.v2`) instead.

use persona_identity::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One index membership produced for a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index_key: String,
    /// Extra data stored alongside the membership, readable without the
    /// primary row.
    pub inline: Option<Value>,
}

impl IndexEntry {
    pub fn key(index_key: impl Into<String>) -> Self {
        Self {
            index_key: index_key.into(),
            inline: None,
        }
    }

    pub fn with_inline(index_key: impl Into<String>, inline: Value) -> Self {
        Self {
            index_key: index_key.into(),
            inline: Some(inline),
        }
    }
}

/// Maps a value to its index entries.
pub type Indexer = Arc<dyn Fn(&Value) -> Vec<IndexEntry> + Send + Sync>;

/// A named secondary index over one table.
#[derive(Clone)]
pub struct IndexDef {
    pub id: Id,
    /// Storage name: the index id's safe name
    pub table: String,
    pub indexer: Indexer,
}

impl IndexDef {
    pub fn new<F>(id: Id, indexer: F) -> Self
    where
        F: Fn(&Value) -> Vec<IndexEntry> + Send + Sync + 'static,
    {
        let table = id.to_safe_name();
        Self {
            id,
            table,
            indexer: Arc::new(indexer),
        }
    }

    /// Index entries for `value`, keyed by index key. Repeated keys collapse
    /// and the last one wins.
    pub fn entries_for(&self, value: &Value) -> BTreeMap<String, Option<Value>> {
        (self.indexer)(value)
            .into_iter()
            .map(|entry| (entry.index_key, entry.inline))
            .collect()
    }
}

impl fmt::Debug for IndexDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDef")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}

/// What an index lookup returns besides the matching keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexQuery {
    pub include_inline: bool,
    pub join_primary: bool,
}

impl IndexQuery {
    /// Matching keys only.
    pub const KEYS: IndexQuery = IndexQuery {
        include_inline: false,
        join_primary: false,
    };

    /// Keys with their inline data, without touching the primary table.
    pub const INLINE: IndexQuery = IndexQuery {
        include_inline: true,
        join_primary: false,
    };

    /// Keys with their full stored values.
    pub const VALUES: IndexQuery = IndexQuery {
        include_inline: false,
        join_primary: true,
    };
}

impl Default for IndexQuery {
    fn default() -> Self {
        Self::VALUES
    }
}

/// One row matched by an index lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub key: String,
    pub index_key: String,
    pub inline: Option<Value>,
    pub value: Option<Value>,
}

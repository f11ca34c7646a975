//! Transfer ledger on top of a persona database.

use persona_core::{AppContext, Startup};
use persona_identity::Id;
use persona_storage::{
    Database, IndexEntry, IndexHandle, IndexQuery, KvStore, StorageError, StorageResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SEQUENCE_KEY: &str = "transfers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: i64,
}

/// Each transfer is indexed under both accounts; the inline value is the
/// signed effect on that account's balance.
fn account_entries(value: &Value) -> Vec<IndexEntry> {
    let Ok(transfer) = serde_json::from_value::<Transfer>(value.clone()) else {
        return Vec::new();
    };
    vec![
        IndexEntry::with_inline(transfer.from, json!(-transfer.amount)),
        IndexEntry::with_inline(transfer.to, json!(transfer.amount)),
    ]
}

#[derive(Debug, Clone)]
pub struct Ledger {
    transfers: KvStore,
    counters: KvStore,
    by_account: IndexHandle,
}

impl Ledger {
    pub fn declare(ctx: &AppContext<Startup>, db: &Database, id: Id) -> StorageResult<Self> {
        let transfers_id = id.child("transfers");
        let transfers = db.store(ctx, transfers_id.clone())?;
        let counters = db.store(ctx, id.child("counters"))?;
        let by_account = transfers.define_index(transfers_id.child("by_account"), account_entries)?;
        Ok(Self {
            transfers,
            counters,
            by_account,
        })
    }

    async fn next_sequence(&self) -> StorageResult<u64> {
        let next = self
            .counters
            .modify(SEQUENCE_KEY, |current| {
                let n = current.and_then(|v| v.as_u64()).unwrap_or(0);
                Some(json!(n + 1))
            })
            .await?;
        next.and_then(|v| v.as_u64())
            .ok_or_else(|| StorageError::Backend("sequence counter vanished".to_string()))
    }

    /// Store a transfer under the next sequence number and return its key.
    pub async fn record(&self, transfer: &Transfer) -> StorageResult<String> {
        let key = format!("{:010}", self.next_sequence().await?);
        self.transfers.set(&key, transfer).await?;
        Ok(key)
    }

    /// Sum of inline effects; never reads the transfer rows.
    pub async fn balance(&self, account: &str) -> StorageResult<i64> {
        let hits = self.by_account.lookup(account, IndexQuery::INLINE).await?;
        Ok(hits
            .iter()
            .filter_map(|hit| hit.inline.as_ref().and_then(Value::as_i64))
            .sum())
    }

    pub async fn history(&self, account: &str) -> StorageResult<Vec<(String, Transfer)>> {
        let hits = self.by_account.lookup(account, IndexQuery::VALUES).await?;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(value) = hit.value {
                out.push((hit.key, serde_json::from_value(value)?));
            }
        }
        Ok(out)
    }

    pub async fn revert(&self, key: &str) -> StorageResult<bool> {
        self.transfers.del(key).await
    }

    pub fn transfers(&self) -> &KvStore {
        &self.transfers
    }
}

//! PostgreSQL backend.
//!
//! One table per store (`key TEXT PRIMARY KEY, value JSONB`) and one table
//! per index whose rows reference the primary row with `ON DELETE CASCADE`.
//! Every write runs in a single transaction; on error the transaction is
//! dropped, which rolls it back. Writers to one key first take a
//! transaction-scoped advisory lock on table and key, so keys that do not
//! exist yet are serialized too.

use crate::index::{IndexDef, IndexHit, IndexQuery};
use crate::traits::{KvBackend, Modifier};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;
use tracing::debug;

/// PostgreSQL-backed table.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    table: String,
    indexes: Vec<IndexDef>,
}

impl PostgresBackend {
    /// Create the tables if needed and return the backend.
    pub async fn open(pool: PgPool, table: &str, indexes: Vec<IndexDef>) -> StorageResult<Self> {
        let backend = Self {
            pool,
            table: table.to_string(),
            indexes,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let mut ddl = vec![format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL
            )"#,
            self.table
        )];
        for index in &self.indexes {
            ddl.push(format!(
                r#"CREATE TABLE IF NOT EXISTS "{}" (
                    index_key TEXT NOT NULL,
                    key TEXT NOT NULL REFERENCES "{}" (key) ON DELETE CASCADE,
                    inline JSONB,
                    PRIMARY KEY (index_key, key)
                )"#,
                index.table, self.table
            ));
            ddl.push(format!(
                r#"CREATE INDEX IF NOT EXISTS "{0}_key" ON "{0}" (key)"#,
                index.table
            ));
        }

        for stmt in &ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        debug!(table = %self.table, indexes = self.indexes.len(), "postgres schema ready");
        Ok(())
    }

    fn index(&self, name: &str) -> StorageResult<&IndexDef> {
        self.indexes
            .iter()
            .find(|def| def.table == name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))
    }

    /// Held until the transaction on `conn` ends.
    async fn lock_key(&self, conn: &mut PgConnection, key: &str) -> StorageResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{key}", self.table))
            .execute(&mut *conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    /// Upsert the row and replace its memberships in every index table.
    async fn write_row(&self, conn: &mut PgConnection, key: &str, value: &Value) -> StorageResult<()> {
        sqlx::query(&format!(
            r#"INSERT INTO "{}" (key, value) VALUES ($1, $2)
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"#,
            self.table
        ))
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await
        .map_err(backend_err)?;

        for index in &self.indexes {
            sqlx::query(&format!(r#"DELETE FROM "{}" WHERE key = $1"#, index.table))
                .bind(key)
                .execute(&mut *conn)
                .await
                .map_err(backend_err)?;
            for (index_key, inline) in index.entries_for(value) {
                sqlx::query(&format!(
                    r#"INSERT INTO "{}" (index_key, key, inline) VALUES ($1, $2, $3)"#,
                    index.table
                ))
                .bind(index_key)
                .bind(key)
                .bind(inline)
                .execute(&mut *conn)
                .await
                .map_err(backend_err)?;
            }
        }
        Ok(())
    }

    async fn delete_row(&self, conn: &mut PgConnection, key: &str) -> StorageResult<bool> {
        let result = sqlx::query(&format!(r#"DELETE FROM "{}" WHERE key = $1"#, self.table))
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl KvBackend for PostgresBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let row = sqlx::query(&format!(r#"SELECT value FROM "{}" WHERE key = $1"#, self.table))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(|row| row.try_get::<Value, _>("value").map_err(backend_err))
            .transpose()
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        let row = sqlx::query(&format!(r#"SELECT 1 FROM "{}" WHERE key = $1"#, self.table))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.is_some())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        self.lock_key(&mut tx, key).await?;
        self.write_row(&mut tx, key, &value).await?;
        tx.commit().await.map_err(backend_err)
    }

    async fn del(&self, key: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        self.lock_key(&mut tx, key).await?;
        let existed = self.delete_row(&mut tx, key).await?;
        tx.commit().await.map_err(backend_err)?;
        Ok(existed)
    }

    async fn modify(&self, key: &str, f: Modifier) -> StorageResult<Option<Value>> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        self.lock_key(&mut tx, key).await?;
        let current = sqlx::query(&format!(
            r#"SELECT value FROM "{}" WHERE key = $1"#,
            self.table
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err)?
        .map(|row| row.try_get::<Value, _>("value").map_err(backend_err))
        .transpose()?;

        let next = f(current);
        match &next {
            Some(value) => self.write_row(&mut tx, key, value).await?,
            None => {
                self.delete_row(&mut tx, key).await?;
            }
        }
        tx.commit().await.map_err(backend_err)?;
        Ok(next)
    }

    async fn key_batch(&self, after: Option<&str>, limit: usize) -> StorageResult<Vec<String>> {
        let limit = i64::try_from(limit)
            .map_err(|_| StorageError::Backend("batch size too large".to_string()))?;
        let rows = match after {
            Some(after) => {
                sqlx::query(&format!(
                    r#"SELECT key FROM "{}" WHERE key > $1 ORDER BY key LIMIT $2"#,
                    self.table
                ))
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(r#"SELECT key FROM "{}" ORDER BY key LIMIT $1"#, self.table))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(backend_err)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(backend_err))
            .collect()
    }

    async fn lookup(
        &self,
        index: &str,
        index_key: &str,
        query: IndexQuery,
    ) -> StorageResult<Vec<IndexHit>> {
        let index = self.index(index)?;
        let sql = if query.join_primary {
            format!(
                r#"SELECT i.key, i.inline, p.value FROM "{}" i
                   JOIN "{}" p ON p.key = i.key
                   WHERE i.index_key = $1 ORDER BY i.key"#,
                index.table, self.table
            )
        } else {
            format!(
                r#"SELECT key, inline, NULL::JSONB AS value FROM "{}"
                   WHERE index_key = $1 ORDER BY key"#,
                index.table
            )
        };
        let rows = sqlx::query(&sql)
            .bind(index_key)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(backend_err)?;
                let inline: Option<Value> = row.try_get("inline").map_err(backend_err)?;
                let value: Option<Value> = row.try_get("value").map_err(backend_err)?;
                Ok(IndexHit {
                    key,
                    index_key: index_key.to_string(),
                    inline: inline.filter(|_| query.include_inline),
                    value,
                })
            })
            .collect()
    }
}

fn backend_err(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

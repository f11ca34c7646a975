//! Database declarations.
//!
//! In-process applications keep every store in memory. Distributed ones get a
//! PostgreSQL service in the deployment model, a build-stable password routed
//! as a secret, and a lazily connected pool shared by every store declared on
//! the database.

use crate::retry::RetryPolicy;
use crate::store::{KvStore, Source, TableNames};
use crate::traits::KvBackend;
use crate::{StorageError, StorageResult};
use persona_core::{AppContext, ExecutionMode, PersonaResult, Secret, ServiceSpec, Startup};
use persona_identity::Id;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "postgres")]
use crate::postgres::PostgresBackend;
#[cfg(feature = "postgres")]
use crate::retry::connect_with_retry;
#[cfg(feature = "postgres")]
use sqlx::postgres::{PgPool, PgPoolOptions};

pub const POSTGRES_IMAGE: &str = "postgres:16";
pub const POSTGRES_PORT: u16 = 5432;
const POSTGRES_USER: &str = "postgres";
const POSTGRES_DATA_DIR: &str = "/var/lib/postgresql/data";

/// Tunables for a database declaration.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub image: String,
    /// Connect here instead of the declared service
    pub url: Option<String>,
    pub retry: RetryPolicy,
    pub max_connections: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            image: POSTGRES_IMAGE.to_string(),
            url: None,
            retry: RetryPolicy::default(),
            max_connections: 10,
        }
    }
}

struct DatabaseInner {
    id: Id,
    service: String,
    mode: ExecutionMode,
    password: Option<Secret<String>>,
    options: DatabaseOptions,
    tables: TableNames,
    #[cfg(feature = "postgres")]
    pool: tokio::sync::OnceCell<PgPool>,
}

/// A declared database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn declare(ctx: &mut AppContext<Startup>, id: Id) -> PersonaResult<Self> {
        Self::declare_with(ctx, id, DatabaseOptions::default())
    }

    pub fn declare_with(
        ctx: &mut AppContext<Startup>,
        id: Id,
        options: DatabaseOptions,
    ) -> PersonaResult<Self> {
        let placeholder = ctx.define_placeholder(id.clone())?;
        let service = placeholder.key;
        let mode = ctx.mode();

        let password = match mode {
            ExecutionMode::InProcess => None,
            ExecutionMode::Distributed => {
                let ledger = ctx.passwords().clone();
                let ledger_id = id.clone();
                let secret: Secret<String> = ctx
                    .declare_secret(id.child("password"), move || ledger.password(&ledger_id))?;

                let volume = format!("{service}_data");
                let spec = ServiceSpec::new(service.clone())
                    .with_image(options.image.clone())
                    .with_env("POSTGRES_USER", POSTGRES_USER)
                    .with_secret_env("POSTGRES_PASSWORD", secret.env_var())
                    .with_volume(volume.clone(), POSTGRES_DATA_DIR);
                ctx.deployment_mut().add_volume(volume);
                ctx.deployment_mut().add_service(spec)?;
                Some(secret)
            }
        };

        let database = Self {
            inner: Arc::new(DatabaseInner {
                id,
                service: service.clone(),
                mode,
                password,
                options,
                tables: TableNames::default(),
                #[cfg(feature = "postgres")]
                pool: tokio::sync::OnceCell::new(),
            }),
        };

        let closing = database.clone();
        ctx.on_teardown(format!("close database {service}"), move || {
            let database = closing.clone();
            async move {
                database.close().await;
                Ok(())
            }
        });
        debug!(database = %database.inner.id, ?mode, "declared database");
        Ok(database)
    }

    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    /// Service name, also the host name other containers connect to.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    /// Declare a key/value store on this database. Store and index names
    /// share one namespace per database.
    pub fn store(&self, ctx: &AppContext<Startup>, id: Id) -> StorageResult<KvStore> {
        if !self.inner.tables.claim(&id.to_safe_name())? {
            return Err(StorageError::DuplicateStore(id.to_string()));
        }
        let source = match self.inner.mode {
            ExecutionMode::InProcess => Source::Memory,
            ExecutionMode::Distributed => Source::Database(self.clone()),
        };
        Ok(KvStore::with_source(
            id,
            ctx.epoch(),
            source,
            self.inner.tables.clone(),
        ))
    }

    /// Connection URL. Only available at runtime, since it embeds the
    /// routed password.
    pub fn url(&self) -> StorageResult<String> {
        if let Some(url) = &self.inner.options.url {
            return Ok(url.clone());
        }
        let password = self
            .inner
            .password
            .as_ref()
            .ok_or_else(|| StorageError::Unsupported("in-process databases have no URL".into()))?
            .get()?;
        Ok(format!(
            "postgres://{POSTGRES_USER}:{password}@{}:{POSTGRES_PORT}/{POSTGRES_USER}",
            self.inner.service
        ))
    }

    #[cfg(feature = "postgres")]
    pub async fn pool(&self) -> StorageResult<PgPool> {
        self.inner
            .pool
            .get_or_try_init(|| async {
                let url = self.url()?;
                let options = &self.inner.options;
                let pool = connect_with_retry(&options.retry, || {
                    PgPoolOptions::new()
                        .max_connections(options.max_connections)
                        .acquire_timeout(std::time::Duration::from_secs(5))
                        .connect(&url)
                })
                .await?;
                tracing::info!(database = %self.inner.id, "connected to postgres");
                Ok::<_, StorageError>(pool)
            })
            .await
            .cloned()
    }

    #[cfg(feature = "postgres")]
    pub(crate) async fn open_table(
        &self,
        table: &str,
        indexes: Vec<crate::index::IndexDef>,
    ) -> StorageResult<Arc<dyn KvBackend>> {
        let pool = self.pool().await?;
        Ok(Arc::new(PostgresBackend::open(pool, table, indexes).await?))
    }

    #[cfg(not(feature = "postgres"))]
    pub(crate) async fn open_table(
        &self,
        table: &str,
        _indexes: Vec<crate::index::IndexDef>,
    ) -> StorageResult<Arc<dyn KvBackend>> {
        Err(StorageError::Unsupported(format!(
            "table `{table}` needs postgres; build with the `postgres` feature"
        )))
    }

    async fn close(&self) {
        #[cfg(feature = "postgres")]
        if let Some(pool) = self.inner.pool.get() {
            pool.close().await;
            tracing::info!(database = %self.inner.id, "closed postgres pool");
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

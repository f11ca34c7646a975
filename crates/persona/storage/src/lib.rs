//! Persona storage.
//!
//! Key/value tables with secondary indexes behind one capability interface:
//! - [`MemoryBackend`] when the application runs in a single process
//! - `PostgresBackend` (feature `postgres`) when it is distributed
//!
//! Stores and indexes are declared during startup on a [`Database`] and used
//! at runtime through [`KvStore`] handles.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod database;
mod error;
mod index;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
mod store;
mod traits;

pub use database::{Database, DatabaseOptions, POSTGRES_IMAGE, POSTGRES_PORT};
pub use error::{StorageError, StorageResult};
pub use index::{IndexDef, IndexEntry, IndexHit, IndexQuery, Indexer};
pub use memory::MemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
pub use retry::{connect_with_retry, RetryPolicy};
pub use store::{IndexHandle, KvStore, DEFAULT_KEY_BATCH};
pub use traits::{KvBackend, Modifier};

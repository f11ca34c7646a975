use persona_core::PersonaError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store `{0}` declared twice on one database")]
    DuplicateStore(String),

    #[error("index `{0}` declared twice")]
    DuplicateIndex(String),

    #[error("unknown index `{0}`")]
    UnknownIndex(String),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

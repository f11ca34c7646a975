use crate::host::HostKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for persona operations.
pub type PersonaResult<T> = Result<T, PersonaError>;

/// Errors raised while declaring, dispatching or running personas.
#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("duplicate persona key `{0}`")]
    DuplicatePersona(String),

    #[error("a terminal persona is already declared as `{existing}`")]
    DuplicateTerminal { existing: String },

    #[error("build file `{}` declared twice", .0.display())]
    DuplicateFile(PathBuf),

    #[error("secret environment variable `{0}` declared twice")]
    DuplicateSecret(String),

    #[error("deployment service `{0}` declared twice")]
    DuplicateService(String),

    #[error("{operation} requires the {expected} epoch")]
    Epoch {
        expected: &'static str,
        operation: String,
    },

    #[error("a persona has already been dispatched in this process")]
    AlreadyDispatched,

    #[error("unknown persona `{selector}` (registered: {})", .available.join(", "))]
    UnknownPersona {
        selector: String,
        available: Vec<String>,
    },

    #[error("persona `{0}` has nothing to run")]
    NotRunnable(String),

    #[error("unknown command `{name}` (available: {})", .available.join(", "))]
    UnknownCommand {
        name: String,
        available: Vec<String>,
    },

    #[error("secret `{id}` is missing: environment variable `{variable}` is not set")]
    MissingSecret { id: String, variable: String },

    #[error("secrets cannot be resolved inside a {host} persona")]
    SecretUnavailable { host: HostKind },

    #[error("persona `{key}` failed: {message}")]
    EntryPoint { key: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("unreachable state: {0}")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

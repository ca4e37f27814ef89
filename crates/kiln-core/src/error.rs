//! Error taxonomy for the Kiln pipeline.

use kiln_state::{AgentId, StorageError};

use crate::archive::ArchiveError;

/// Kiln core errors.
///
/// `Configuration`, `Resolution` and `Execution` carry their message
/// verbatim: those texts end up in build logs and execution records.
/// `Configuration` covers both the environment settings and an artifact's
/// own `kiln.toml`.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    #[error("{0}")]
    Configuration(String),

    #[error("Failed to extract archive: {0}")]
    Archive(#[from] ArchiveError),

    #[error("{0}")]
    Resolution(String),

    #[error("{0}")]
    Execution(String),

    #[error("Execution timeout: exceeded {limit_ms} ms")]
    Timeout { limit_ms: u64 },

    #[error("invalid state: {0}")]
    State(String),

    #[error("no ready version for agent {0}")]
    NoReadyVersion(AgentId),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: i64 },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for KilnError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionNotFound { id } => KilnError::NotFound {
                kind: "agent version",
                id,
            },
            StorageError::ExecutionNotFound { id } => KilnError::NotFound {
                kind: "execution",
                id,
            },
            other => KilnError::Storage(other),
        }
    }
}

/// Result type for Kiln core operations.
pub type Result<T> = std::result::Result<T, KilnError>;

//! Error types for kiln-state

use thiserror::Error;

/// Errors raised while connecting to or initialising a backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits
#[derive(Error, Debug)]
pub enum StorageError {
    /// No agent version with this id
    #[error("agent version not found: {id}")]
    VersionNotFound { id: i64 },

    /// No execution with this id
    #[error("execution not found: {id}")]
    ExecutionNotFound { id: i64 },

    /// No blob stored at this path
    #[error("blob not found: {path}")]
    BlobNotFound { path: String },

    /// Blob path is absolute or escapes the store root
    #[error("invalid blob path: {path}")]
    InvalidBlobPath { path: String },

    /// Compare-and-set update observed a different prior status
    #[error("status conflict on {record} {id}: expected {expected}, found {actual}")]
    StatusConflict {
        record: &'static str,
        id: i64,
        expected: String,
        actual: String,
    },

    /// Requested status change is not in the transition table
    #[error("invalid transition on {record} {id}: {from} -> {to}")]
    InvalidTransition {
        record: &'static str,
        id: i64,
        from: String,
        to: String,
    },

    /// Stored status string does not name a known status
    #[error("unknown status: {0}")]
    UnknownStatus(String),

    /// Backend failure (I/O, database)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

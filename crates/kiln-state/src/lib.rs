//! Kiln-State: persistence layer for the Kiln build-and-execute pipeline
//!
//! Stores agent versions and executions as status-bearing records, and
//! archive bytes as blobs addressed by relative path.
//!
//! ## Key Components
//!
//! - `VersionStore` / `ExecutionStore`: record stores with compare-and-set
//!   status updates
//! - `BlobStore`: archive bytes by path
//! - `SurrealRecordStore`: SurrealDB implementation of both record stores
//! - `fakes`: in-memory implementations for tests and local runs

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use schema::{ExecutionRow, VersionRow};
pub use storage_traits::{
    AgentId, AgentVersion, BlobStore, CallerId, Execution, ExecutionId, ExecutionStatus,
    ExecutionStore, NewAgentVersion, NewExecution, StorageResult, VersionId, VersionStatus,
    VersionStore,
};
pub use surreal_store::SurrealRecordStore;

/// Result type for kiln-state operations
pub type Result<T> = std::result::Result<T, StateError>;

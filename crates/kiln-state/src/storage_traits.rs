//! Storage trait definitions for Kiln
//!
//! These traits define the persistence collaborators of the build and
//! execution pipeline:
//! - `VersionStore`: agent versions (one build attempt each)
//! - `ExecutionStore`: invocations of a ready version
//! - `BlobStore`: archive bytes addressed by relative path
//!
//! Status updates are compare-and-set: the caller names the status it
//! observed, and the store refuses the write if the row has moved on.
//! In-memory fakes are provided for testing via the `fakes` module.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Owning agent of a set of versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub i64);

/// Store-assigned, increasing version identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub i64);

/// Store-assigned, increasing execution identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub i64);

/// Opaque caller identity, resolved outside this crate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        CallerId(id.into())
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(AgentId, VersionId, ExecutionId, CallerId);

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Build lifecycle of an agent version.
///
/// `Queued → Building → Ready | Failed`; `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VersionStatus {
    Queued,
    Building,
    Ready,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Queued => "QUEUED",
            VersionStatus::Building => "BUILDING",
            VersionStatus::Ready => "READY",
            VersionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VersionStatus::Ready | VersionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        matches!(
            (self, next),
            (VersionStatus::Queued, VersionStatus::Building)
                | (VersionStatus::Building, VersionStatus::Ready)
                | (VersionStatus::Building, VersionStatus::Failed)
        )
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(VersionStatus::Queued),
            "BUILDING" => Ok(VersionStatus::Building),
            "READY" => Ok(VersionStatus::Ready),
            "FAILED" => Ok(VersionStatus::Failed),
            _ => Err(StorageError::UnknownStatus(s.to_string())),
        }
    }
}

/// Lifecycle of a single execution.
///
/// `Pending → Running → Completed | Failed | Cancelled`, plus
/// `Pending → Cancelled`. The three outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Statuses an execution may be created in.
    pub fn is_initial(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Pending, ExecutionStatus::Cancelled)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            _ => Err(StorageError::UnknownStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Fields supplied when a version is created (always in `Queued`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgentVersion {
    pub agent_id: AgentId,
    /// Human-readable label, e.g. "v3"
    pub version: String,
    /// Blob path of the uploaded archive
    pub archive_path: String,
    /// SHA-256 hex of the archive bytes
    pub archive_digest: Option<String>,
}

/// One build attempt of an agent's code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVersion {
    pub id: VersionId,
    pub agent_id: AgentId,
    pub version: String,
    pub status: VersionStatus,
    pub build_log: Option<String>,
    pub archive_path: String,
    pub archive_digest: Option<String>,
    /// Parsed descriptor, stored once the build succeeds
    pub config: Option<serde_json::Value>,
    /// `"module:function"`
    pub entrypoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentVersion {
    /// Move to `next`, appending `log_line` to the build log.
    ///
    /// Returns the prior status, which callers pass to
    /// [`VersionStore::update_version`] as the expected status.
    pub fn advance(&mut self, next: VersionStatus, log_line: &str) -> StorageResult<VersionStatus> {
        let prior = self.status;
        if !prior.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                record: "agent_version",
                id: self.id.0,
                from: prior.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.build_log = Some(match self.build_log.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{log_line}"),
            _ => log_line.to_string(),
        });
        self.updated_at = Utc::now();
        Ok(prior)
    }
}

/// Fields supplied when an execution is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub agent_version_id: VersionId,
    pub caller: CallerId,
    /// `Pending` (deferred path) or `Running` (synchronous path)
    pub status: ExecutionStatus,
    pub input_data: serde_json::Value,
}

/// One invocation of a ready version's entrypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub agent_version_id: VersionId,
    pub caller: CallerId,
    pub status: ExecutionStatus,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Move to `next`. Returns the prior status for the compare-and-set write.
    pub fn advance(&mut self, next: ExecutionStatus) -> StorageResult<ExecutionStatus> {
        let prior = self.status;
        if !prior.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                record: "execution",
                id: self.id.0,
                from: prior.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(prior)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Agent version persistence.
///
/// Guarantees:
/// - ids are assigned by the store and strictly increase.
/// - `update_version` only writes if the stored status equals `expected`
///   and `expected → version.status` is an allowed transition.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Create a version in `Queued`.
    async fn create_version(&self, new: NewAgentVersion) -> StorageResult<AgentVersion>;

    /// Fetch a version. Returns `StorageError::VersionNotFound` if absent.
    async fn get_version(&self, id: VersionId) -> StorageResult<AgentVersion>;

    /// All versions of an agent, oldest first.
    async fn list_versions(&self, agent_id: AgentId) -> StorageResult<Vec<AgentVersion>>;

    /// Replace the stored row if its status is still `expected`.
    async fn update_version(
        &self,
        version: &AgentVersion,
        expected: VersionStatus,
    ) -> StorageResult<()>;
}

/// Execution persistence. Same compare-and-set contract as [`VersionStore`].
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an execution in `new.status` (must be an initial status).
    async fn create_execution(&self, new: NewExecution) -> StorageResult<Execution>;

    /// Fetch an execution. Returns `StorageError::ExecutionNotFound` if absent.
    async fn get_execution(&self, id: ExecutionId) -> StorageResult<Execution>;

    /// Executions filtered by caller and, optionally, by version; oldest first.
    async fn list_executions(
        &self,
        caller: &CallerId,
        version: Option<VersionId>,
    ) -> StorageResult<Vec<Execution>>;

    /// Replace the stored row if its status is still `expected`.
    async fn update_execution(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> StorageResult<()>;
}

/// Archive blob storage addressed by relative path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes at `path`, replacing any previous content.
    async fn save(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    /// Read bytes. Returns `StorageError::BlobNotFound` if absent.
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Check whether a blob exists.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Delete a blob. Returns whether anything was removed.
    async fn delete(&self, path: &str) -> StorageResult<bool>;
}

/// Check the transition `expected → next` for a compare-and-set write.
pub(crate) fn check_version_transition(
    id: VersionId,
    expected: VersionStatus,
    next: VersionStatus,
) -> StorageResult<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            record: "agent_version",
            id: id.0,
            from: expected.to_string(),
            to: next.to_string(),
        })
    }
}

pub(crate) fn check_execution_transition(
    id: ExecutionId,
    expected: ExecutionStatus,
    next: ExecutionStatus,
) -> StorageResult<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            record: "execution",
            id: id.0,
            from: expected.to_string(),
            to: next.to_string(),
        })
    }
}

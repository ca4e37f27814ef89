//! In-memory fakes for storage traits (testing and local runs)
//!
//! Provides `MemoryVersionStore`, `MemoryExecutionStore`, and
//! `MemoryBlobStore` that satisfy the trait contracts without any external
//! dependencies. Compare-and-set writes are atomic under the store mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryVersionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VersionTable {
    next_id: i64,
    rows: BTreeMap<i64, AgentVersion>,
}

/// In-memory version store backed by a `BTreeMap<id, AgentVersion>`.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    table: Mutex<VersionTable>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn create_version(&self, new: NewAgentVersion) -> StorageResult<AgentVersion> {
        let mut table = self.table.lock().unwrap();
        table.next_id += 1;
        let now = Utc::now();
        let record = AgentVersion {
            id: VersionId(table.next_id),
            agent_id: new.agent_id,
            version: new.version,
            status: VersionStatus::Queued,
            build_log: None,
            archive_path: new.archive_path,
            archive_digest: new.archive_digest,
            config: None,
            entrypoint: None,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_version(&self, id: VersionId) -> StorageResult<AgentVersion> {
        let table = self.table.lock().unwrap();
        table
            .rows
            .get(&id.0)
            .cloned()
            .ok_or(StorageError::VersionNotFound { id: id.0 })
    }

    async fn list_versions(&self, agent_id: AgentId) -> StorageResult<Vec<AgentVersion>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .rows
            .values()
            .filter(|v| v.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn update_version(
        &self,
        version: &AgentVersion,
        expected: VersionStatus,
    ) -> StorageResult<()> {
        check_version_transition(version.id, expected, version.status)?;
        let mut table = self.table.lock().unwrap();
        let row = table
            .rows
            .get_mut(&version.id.0)
            .ok_or(StorageError::VersionNotFound { id: version.id.0 })?;
        if row.status != expected {
            return Err(StorageError::StatusConflict {
                record: "agent_version",
                id: version.id.0,
                expected: expected.to_string(),
                actual: row.status.to_string(),
            });
        }
        *row = version.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryExecutionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ExecutionTable {
    next_id: i64,
    rows: BTreeMap<i64, Execution>,
}

/// In-memory execution store backed by a `BTreeMap<id, Execution>`.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    table: Mutex<ExecutionTable>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_execution(&self, new: NewExecution) -> StorageResult<Execution> {
        if !new.status.is_initial() {
            return Err(StorageError::InvalidTransition {
                record: "execution",
                id: 0,
                from: "NEW".to_string(),
                to: new.status.to_string(),
            });
        }
        let mut table = self.table.lock().unwrap();
        table.next_id += 1;
        let now = Utc::now();
        let record = Execution {
            id: ExecutionId(table.next_id),
            agent_version_id: new.agent_version_id,
            caller: new.caller,
            status: new.status,
            input_data: new.input_data,
            output_data: None,
            error_message: None,
            logs: None,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<Execution> {
        let table = self.table.lock().unwrap();
        table
            .rows
            .get(&id.0)
            .cloned()
            .ok_or(StorageError::ExecutionNotFound { id: id.0 })
    }

    async fn list_executions(
        &self,
        caller: &CallerId,
        version: Option<VersionId>,
    ) -> StorageResult<Vec<Execution>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .rows
            .values()
            .filter(|e| &e.caller == caller)
            .filter(|e| version.map(|v| e.agent_version_id == v).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> StorageResult<()> {
        check_execution_transition(execution.id, expected, execution.status)?;
        let mut table = self.table.lock().unwrap();
        let row = table
            .rows
            .get_mut(&execution.id.0)
            .ok_or(StorageError::ExecutionNotFound {
                id: execution.id.0,
            })?;
        if row.status != expected {
            return Err(StorageError::StatusConflict {
                record: "execution",
                id: execution.id.0,
                expected: expected.to_string(),
                actual: row.status.to_string(),
            });
        }
        *row = execution.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory blob store backed by a `HashMap<path, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::BlobNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.contains_key(path))
    }

    async fn delete(&self, path: &str) -> StorageResult<bool> {
        let mut blobs = self.blobs.lock().unwrap();
        Ok(blobs.remove(path).is_some())
    }
}

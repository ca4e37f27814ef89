//! SurrealDB-backed version and execution stores
//!
//! Uses `schema::VersionRow` and `schema::ExecutionRow` for persistence,
//! converting to/from `storage_traits` types at the boundary. Status updates
//! are a single conditional `UPDATE ... WHERE status = $expected`, so two
//! writers racing on the same row cannot both succeed.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{ExecutionRow, VersionRow};
use crate::storage_traits::*;

const NAMESPACE: &str = "kiln";
const DATABASE: &str = "main";

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`VersionStore`] and [`ExecutionStore`].
pub struct SurrealRecordStore {
    db: Surreal<Any>,
    next_version_id: AtomicI64,
    next_execution_id: AtomicI64,
}

impl SurrealRecordStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `kiln/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealRecordStore connected (in-memory)");
        Ok(store)
    }

    /// Create from environment variables.
    ///
    /// Uses `SURREALDB_URL` when set, otherwise local persistence under
    /// `<storage_root>/db`.
    pub async fn from_env(storage_root: impl AsRef<Path>) -> crate::Result<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let store = Self::connect(&url).await?;
            info!("SurrealRecordStore connected ({})", url);
            return Ok(store);
        }

        let path = storage_root.as_ref().join("db");
        std::fs::create_dir_all(&path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        info!("No SURREALDB_URL found, using local persistence: {}", url);
        Self::connect(&url).await
    }

    /// Connect to any SurrealDB endpoint URL and initialise the schema.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        let max_version = Self::max_id(&db, "agent_versions", "version_id").await?;
        let max_execution = Self::max_id(&db, "executions", "execution_id").await?;
        debug!(max_version, max_execution, "seeded id counters");

        Ok(Self {
            db,
            next_version_id: AtomicI64::new(max_version + 1),
            next_execution_id: AtomicI64::new(max_execution + 1),
        })
    }

    // -- private helpers -----------------------------------------------------

    async fn max_id(db: &Surreal<Any>, table: &str, column: &str) -> crate::Result<i64> {
        #[derive(Deserialize)]
        struct MaxRow {
            max: Option<i64>,
        }

        let sql = format!("SELECT math::max({column}) AS max FROM {table} GROUP ALL");
        let mut res = db.query(sql).await?;
        let rows: Vec<MaxRow> = res.take(0)?;
        Ok(rows.into_iter().next().and_then(|r| r.max).unwrap_or(0))
    }

    async fn fetch_version(&self, id: VersionId) -> StorageResult<VersionRow> {
        let mut res = self
            .db
            .query("SELECT * FROM agent_versions WHERE version_id = $vid")
            .bind(("vid", id.0))
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or(StorageError::VersionNotFound { id: id.0 })
    }

    async fn fetch_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRow> {
        let mut res = self
            .db
            .query("SELECT * FROM executions WHERE execution_id = $eid")
            .bind(("eid", id.0))
            .await
            .map_err(backend)?;

        let rows: Vec<ExecutionRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or(StorageError::ExecutionNotFound { id: id.0 })
    }
}

#[async_trait]
impl VersionStore for SurrealRecordStore {
    async fn create_version(&self, new: NewAgentVersion) -> StorageResult<AgentVersion> {
        let now = Utc::now();
        let record = AgentVersion {
            id: VersionId(self.next_version_id.fetch_add(1, Ordering::SeqCst)),
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

        self.db
            .query("CREATE agent_versions CONTENT $row")
            .bind(("row", VersionRow::from(&record)))
            .await
            .and_then(|r| r.check())
            .map_err(backend)?;

        debug!(version_id = record.id.0, agent_id = record.agent_id.0, "version created");
        Ok(record)
    }

    async fn get_version(&self, id: VersionId) -> StorageResult<AgentVersion> {
        self.fetch_version(id).await?.try_into()
    }

    async fn list_versions(&self, agent_id: AgentId) -> StorageResult<Vec<AgentVersion>> {
        let mut res = self
            .db
            .query("SELECT * FROM agent_versions WHERE agent_id = $aid ORDER BY version_id ASC")
            .bind(("aid", agent_id.0))
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(AgentVersion::try_from).collect()
    }

    async fn update_version(
        &self,
        version: &AgentVersion,
        expected: VersionStatus,
    ) -> StorageResult<()> {
        check_version_transition(version.id, expected, version.status)?;

        let mut res = self
            .db
            .query(
                "UPDATE agent_versions CONTENT $row \
                 WHERE version_id = $vid AND status = $expected RETURN AFTER",
            )
            .bind(("row", VersionRow::from(version)))
            .bind(("vid", version.id.0))
            .bind(("expected", expected.as_str()))
            .await
            .map_err(backend)?;

        let updated: Vec<VersionRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            let current = self.fetch_version(version.id).await?;
            return Err(StorageError::StatusConflict {
                record: "agent_version",
                id: version.id.0,
                expected: expected.to_string(),
                actual: current.status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SurrealRecordStore {
    async fn create_execution(&self, new: NewExecution) -> StorageResult<Execution> {
        if !new.status.is_initial() {
            return Err(StorageError::InvalidTransition {
                record: "execution",
                id: 0,
                from: "NEW".to_string(),
                to: new.status.to_string(),
            });
        }

        let now = Utc::now();
        let record = Execution {
            id: ExecutionId(self.next_execution_id.fetch_add(1, Ordering::SeqCst)),
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

        self.db
            .query("CREATE executions CONTENT $row")
            .bind(("row", ExecutionRow::from(&record)))
            .await
            .and_then(|r| r.check())
            .map_err(backend)?;

        debug!(execution_id = record.id.0, "execution created");
        Ok(record)
    }

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<Execution> {
        self.fetch_execution(id).await?.try_into()
    }

    async fn list_executions(
        &self,
        caller: &CallerId,
        version: Option<VersionId>,
    ) -> StorageResult<Vec<Execution>> {
        let caller_owned = caller.0.clone();
        let rows: Vec<ExecutionRow> = if let Some(vid) = version {
            let mut res = self
                .db
                .query(
                    "SELECT * FROM executions WHERE caller = $caller \
                     AND agent_version_id = $vid ORDER BY execution_id ASC",
                )
                .bind(("caller", caller_owned))
                .bind(("vid", vid.0))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM executions WHERE caller = $caller ORDER BY execution_id ASC")
                .bind(("caller", caller_owned))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        };

        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> StorageResult<()> {
        check_execution_transition(execution.id, expected, execution.status)?;

        let mut res = self
            .db
            .query(
                "UPDATE executions CONTENT $row \
                 WHERE execution_id = $eid AND status = $expected RETURN AFTER",
            )
            .bind(("row", ExecutionRow::from(execution)))
            .bind(("eid", execution.id.0))
            .bind(("expected", expected.as_str()))
            .await
            .map_err(backend)?;

        let updated: Vec<ExecutionRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            let current = self.fetch_execution(execution.id).await?;
            return Err(StorageError::StatusConflict {
                record: "execution",
                id: execution.id.0,
                expected: expected.to_string(),
                actual: current.status,
            });
        }
        Ok(())
    }
}

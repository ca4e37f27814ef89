//! SurrealDB row types for agent versions and executions
//!
//! Rows keep statuses as strings and timestamps as SurrealDB datetimes;
//! conversion to the `storage_traits` records happens at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    AgentId, AgentVersion, CallerId, Execution, ExecutionId, VersionId, StorageResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row in the `agent_versions` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRow {
    pub version_id: i64,
    pub agent_id: i64,
    pub version: String,
    /// "QUEUED" | "BUILDING" | "READY" | "FAILED"
    pub status: String,
    pub build_log: Option<String>,
    pub archive_path: String,
    pub archive_digest: Option<String>,
    pub config: Option<serde_json::Value>,
    pub entrypoint: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&AgentVersion> for VersionRow {
    fn from(v: &AgentVersion) -> Self {
        VersionRow {
            version_id: v.id.0,
            agent_id: v.agent_id.0,
            version: v.version.clone(),
            status: v.status.as_str().to_string(),
            build_log: v.build_log.clone(),
            archive_path: v.archive_path.clone(),
            archive_digest: v.archive_digest.clone(),
            config: v.config.clone(),
            entrypoint: v.entrypoint.clone(),
            created_at: v.created_at,
            updated_at: v.updated_at,
        }
    }
}

impl TryFrom<VersionRow> for AgentVersion {
    type Error = StorageError;

    fn try_from(row: VersionRow) -> StorageResult<Self> {
        Ok(AgentVersion {
            id: VersionId(row.version_id),
            agent_id: AgentId(row.agent_id),
            version: row.version,
            status: row.status.parse()?,
            build_log: row.build_log,
            archive_path: row.archive_path,
            archive_digest: row.archive_digest,
            config: row.config,
            entrypoint: row.entrypoint,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row in the `executions` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub execution_id: i64,
    pub agent_version_id: i64,
    pub caller: String,
    /// "PENDING" | "RUNNING" | "COMPLETED" | "FAILED" | "CANCELLED"
    pub status: String,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&Execution> for ExecutionRow {
    fn from(e: &Execution) -> Self {
        ExecutionRow {
            execution_id: e.id.0,
            agent_version_id: e.agent_version_id.0,
            caller: e.caller.0.clone(),
            status: e.status.as_str().to_string(),
            input_data: e.input_data.clone(),
            output_data: e.output_data.clone(),
            error_message: e.error_message.clone(),
            logs: e.logs.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
        }
    }
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StorageError;

    fn try_from(row: ExecutionRow) -> StorageResult<Self> {
        Ok(Execution {
            id: ExecutionId(row.execution_id),
            agent_version_id: VersionId(row.agent_version_id),
            caller: CallerId(row.caller),
            status: row.status.parse()?,
            input_data: row.input_data,
            output_data: row.output_data,
            error_message: row.error_message,
            logs: row.logs,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::{ExecutionStatus, VersionStatus};

    #[test]
    fn version_row_keeps_uppercase_status() {
        let now = Utc::now();
        let v = AgentVersion {
            id: VersionId(3),
            agent_id: AgentId(1),
            version: "v3".into(),
            status: VersionStatus::Building,
            build_log: Some("Starting build validation...".into()),
            archive_path: "agents/1/artifacts/v3_agent.tar.gz".into(),
            archive_digest: None,
            config: None,
            entrypoint: None,
            created_at: now,
            updated_at: now,
        };
        let row = VersionRow::from(&v);
        assert_eq!(row.status, "BUILDING");
        let back = AgentVersion::try_from(row).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn unknown_execution_status_is_rejected() {
        let now = Utc::now();
        let row = ExecutionRow {
            execution_id: 1,
            agent_version_id: 1,
            caller: "alice".into(),
            status: "EXPLODED".into(),
            input_data: serde_json::json!({}),
            output_data: None,
            error_message: None,
            logs: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            Execution::try_from(row),
            Err(StorageError::UnknownStatus(_))
        ));
        assert_eq!(ExecutionStatus::Pending.as_str(), "PENDING");
    }
}

//! SurrealDB schema migrations and initialization
//!
//! Sets up the `agent_versions` and `executions` tables with their unique
//! id indexes and the lookup indexes the pipeline queries by.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Kiln tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Kiln SurrealDB schema");

    init_agent_versions_table(db).await?;
    init_executions_table(db).await?;

    info!("Kiln schema initialization complete");
    Ok(())
}

/// Initialize `agent_versions`
///
/// Schema:
/// ```text
/// TABLE agent_versions {
///   version_id:     INT (unique, store-assigned)
///   agent_id:       INT (indexed)
///   version:        STRING
///   status:         STRING (QUEUED | BUILDING | READY | FAILED)
///   build_log:      STRING?
///   archive_path:   STRING
///   archive_digest: STRING?
///   config:         OBJECT?
///   entrypoint:     STRING?
///   created_at:     DATETIME
///   updated_at:     DATETIME
/// }
/// ```
///
/// Status transitions are enforced by the store's compare-and-set update.
async fn init_agent_versions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing agent_versions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agent_versions SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_version_id ON TABLE agent_versions COLUMNS version_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_agent_id ON TABLE agent_versions COLUMNS agent_id;
        DEFINE INDEX IF NOT EXISTS idx_agent_status ON TABLE agent_versions COLUMNS agent_id, status;
    "#;

    db.query(sql).await?.check()?;
    info!("agent_versions table initialized");
    Ok(())
}

/// Initialize `executions`
///
/// Schema:
/// ```text
/// TABLE executions {
///   execution_id:     INT (unique, store-assigned)
///   agent_version_id: INT (indexed)
///   caller:           STRING (indexed)
///   status:           STRING (PENDING | RUNNING | COMPLETED | FAILED | CANCELLED)
///   input_data:       OBJECT
///   output_data:      OBJECT?
///   error_message:    STRING?
///   logs:             STRING?
///   created_at:       DATETIME
///   updated_at:       DATETIME
/// }
/// ```
async fn init_executions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing executions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS executions SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_execution_id ON TABLE executions COLUMNS execution_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_caller ON TABLE executions COLUMNS caller;
        DEFINE INDEX IF NOT EXISTS idx_caller_version ON TABLE executions COLUMNS caller, agent_version_id;
    "#;

    db.query(sql).await?.check()?;
    info!("executions table initialized");
    Ok(())
}

//! Execution orchestration: PENDING → RUNNING → COMPLETED | FAILED | CANCELLED.
//!
//! Each run happens on its own blocking worker. The orchestrator waits for
//! it up to the execution timeout; on expiry the worker is abandoned and its
//! interrupt flag raised, so the engine stops at its next operation.
//! Terminal writes are compare-and-set against RUNNING: if the execution was
//! cancelled meanwhile, the worker's result is dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_state::{
    AgentId, AgentVersion, BlobStore, CallerId, Execution, ExecutionId, ExecutionStatus,
    ExecutionStore, NewExecution, StorageError, VersionId, VersionStatus, VersionStore,
};
use tracing::Instrument;

use crate::build::elapsed_ms;
use crate::descriptor::Entrypoint;
use crate::error::{KilnError, Result};
use crate::loader::CancelFlag;
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::{run_entrypoint, WorkerOutcome, WorkerRequest};

/// Offset and size of a listing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

pub struct ExecutionOrchestrator {
    versions: Arc<dyn VersionStore>,
    executions: Arc<dyn ExecutionStore>,
    blobs: Arc<dyn BlobStore>,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl ExecutionOrchestrator {
    pub fn new(
        versions: Arc<dyn VersionStore>,
        executions: Arc<dyn ExecutionStore>,
        blobs: Arc<dyn BlobStore>,
        scratch_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            versions,
            executions,
            blobs,
            scratch_root: scratch_root.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the agent's latest READY version synchronously.
    pub async fn execute(
        &self,
        agent_id: AgentId,
        payload: serde_json::Value,
        caller: &CallerId,
    ) -> Result<Execution> {
        let version = self.ready_version(agent_id).await?;
        let execution = self
            .executions
            .create_execution(NewExecution {
                agent_version_id: version.id,
                caller: caller.clone(),
                status: ExecutionStatus::Running,
                input_data: payload,
            })
            .await?;
        let span = obs::execution_span(execution.id.0);
        self.drive(execution, &version).instrument(span).await
    }

    /// Record a PENDING execution against the agent's latest READY version.
    pub async fn create_pending(
        &self,
        agent_id: AgentId,
        payload: serde_json::Value,
        caller: &CallerId,
    ) -> Result<Execution> {
        let version = self.ready_version(agent_id).await?;
        let execution = self
            .executions
            .create_execution(NewExecution {
                agent_version_id: version.id,
                caller: caller.clone(),
                status: ExecutionStatus::Pending,
                input_data: payload,
            })
            .await?;
        tracing::debug!(execution_id = execution.id.0, version_id = version.id.0, "execution queued");
        Ok(execution)
    }

    /// Start a PENDING execution. Any other status is returned unchanged.
    pub async fn run_pending(&self, execution_id: ExecutionId) -> Result<Execution> {
        let mut execution = self.executions.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Ok(execution);
        }
        let version = self.versions.get_version(execution.agent_version_id).await?;
        ensure_runnable(&version)?;

        let prior = execution.advance(ExecutionStatus::Running)?;
        match self.executions.update_execution(&execution, prior).await {
            Ok(()) => {}
            Err(StorageError::StatusConflict { .. }) => {
                return Ok(self.executions.get_execution(execution_id).await?)
            }
            Err(e) => return Err(e.into()),
        }
        let span = obs::execution_span(execution_id.0);
        self.drive(execution, &version).instrument(span).await
    }

    /// Cancel a PENDING or RUNNING execution.
    ///
    /// Does not interrupt a running worker; its late result is discarded.
    /// On a terminal execution this is a no-op returning the record.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<Execution> {
        loop {
            let mut execution = self.executions.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            let prior = execution.advance(ExecutionStatus::Cancelled)?;
            match self.executions.update_execution(&execution, prior).await {
                Ok(()) => {
                    METRICS.inc_executions_cancelled();
                    obs::emit_execution_cancelled(execution_id.0);
                    return Ok(execution);
                }
                // Status moved underneath us; re-read and decide again.
                Err(StorageError::StatusConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fetch an execution owned by `caller`.
    pub async fn get_execution(&self, execution_id: ExecutionId, caller: &CallerId) -> Result<Execution> {
        let execution = self.executions.get_execution(execution_id).await?;
        if &execution.caller != caller {
            return Err(KilnError::NotFound {
                kind: "execution",
                id: execution_id.0,
            });
        }
        Ok(execution)
    }

    /// The caller's executions in id order, optionally for one version,
    /// windowed by `page`.
    pub async fn list_executions(
        &self,
        caller: &CallerId,
        version: Option<VersionId>,
        page: Page,
    ) -> Result<Vec<Execution>> {
        let all = self.executions.list_executions(caller, version).await?;
        Ok(all.into_iter().skip(page.skip).take(page.limit).collect())
    }

    /// Most recently created READY version of the agent; ties go to the
    /// highest id.
    async fn ready_version(&self, agent_id: AgentId) -> Result<AgentVersion> {
        let version = self
            .versions
            .list_versions(agent_id)
            .await?
            .into_iter()
            .filter(|v| v.status == VersionStatus::Ready)
            .max_by_key(|v| (v.created_at, v.id))
            .ok_or(KilnError::NoReadyVersion(agent_id))?;
        ensure_runnable(&version)?;
        Ok(version)
    }

    async fn drive(&self, execution: Execution, version: &AgentVersion) -> Result<Execution> {
        let started = Instant::now();
        let entrypoint: Entrypoint = match version.entrypoint.as_deref().map(str::parse::<Entrypoint>) {
            Some(Ok(ep)) => ep,
            Some(Err(e)) => return self.finish(execution, failed(e), started).await,
            None => return self.finish(execution, failed(no_entrypoint(version)), started).await,
        };
        obs::emit_execution_started(execution.id.0, version.id.0, &entrypoint.to_string());

        let archive = match self.blobs.read(&version.archive_path).await {
            Ok(bytes) => bytes,
            Err(StorageError::BlobNotFound { .. }) | Err(StorageError::InvalidBlobPath { .. }) => {
                let err = KilnError::Execution(format!("Archive not found: {}", version.archive_path));
                return self.finish(execution, failed(err), started).await;
            }
            Err(e) => {
                // Backend faults still propagate, after the record is closed.
                let err = KilnError::Execution(format!("Failed to read archive: {e}"));
                self.finish(execution, failed(err), started).await?;
                return Err(e.into());
            }
        };

        let request = WorkerRequest {
            execution_id: execution.id.0,
            archive,
            entrypoint,
            payload: execution.input_data.clone(),
        };
        let cancel = CancelFlag::new();
        let worker = {
            let cancel = cancel.clone();
            let scratch_root = self.scratch_root.clone();
            tokio::task::spawn_blocking(move || run_entrypoint(request, &scratch_root, &cancel))
        };

        let outcome = match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => failed(KilnError::Execution(format!("worker panicked: {join_err}"))),
            Err(_) => {
                cancel.raise();
                let limit_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                METRICS.inc_executions_timed_out();
                obs::emit_execution_timed_out(execution.id.0, limit_ms);
                failed(KilnError::Timeout { limit_ms })
            }
        };

        self.finish(execution, outcome, started).await
    }

    /// Write the terminal status. A lost compare-and-set means the
    /// execution was cancelled; the stored record wins.
    async fn finish(&self, mut execution: Execution, outcome: WorkerOutcome, started: Instant) -> Result<Execution> {
        let mut logs = outcome.printed;
        let next = match outcome.result {
            Ok(output) => {
                execution.output_data = Some(output);
                logs.push(format!("Execution {} completed successfully", execution.id));
                ExecutionStatus::Completed
            }
            Err(KilnError::Timeout { limit_ms }) => {
                execution.error_message = Some(KilnError::Timeout { limit_ms }.to_string());
                logs.push(format!("Execution exceeded timeout limit of {limit_ms} ms"));
                ExecutionStatus::Failed
            }
            Err(e) => {
                execution.error_message = Some(e.to_string());
                logs.push(format!("Execution error: {e}"));
                ExecutionStatus::Failed
            }
        };
        execution.logs = Some(logs.join("\n"));

        let prior = execution.advance(next)?;
        match self.executions.update_execution(&execution, prior).await {
            Ok(()) => {}
            Err(StorageError::StatusConflict { actual, .. }) => {
                obs::emit_result_discarded(execution.id.0, &actual);
                return Ok(self.executions.get_execution(execution.id).await?);
            }
            Err(e) => return Err(e.into()),
        }

        match next {
            ExecutionStatus::Completed => METRICS.inc_executions_completed(),
            _ => METRICS.inc_executions_failed(),
        }
        obs::emit_execution_finished(execution.id.0, next.as_str(), elapsed_ms(started));
        Ok(execution)
    }
}

fn failed(err: KilnError) -> WorkerOutcome {
    WorkerOutcome {
        result: Err(err),
        printed: Vec::new(),
    }
}

fn no_entrypoint(version: &AgentVersion) -> KilnError {
    KilnError::State(format!("agent version {} has no entrypoint", version.id))
}

fn ensure_runnable(version: &AgentVersion) -> Result<()> {
    if version.status != VersionStatus::Ready {
        return Err(KilnError::State(format!(
            "agent version {} is {}, not READY",
            version.id, version.status
        )));
    }
    if version.entrypoint.is_none() {
        return Err(no_entrypoint(version));
    }
    Ok(())
}

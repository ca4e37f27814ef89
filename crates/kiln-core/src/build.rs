//! Build orchestration: QUEUED → BUILDING → READY | FAILED.
//!
//! A build validates the stored archive of one agent version. Every status
//! write is a compare-and-set against the status this orchestrator last
//! observed, so a version is built at most once even if it is enqueued
//! several times.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_state::{AgentVersion, BlobStore, StorageError, VersionId, VersionStatus, VersionStore};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::Result;
use crate::loader::CancelFlag;
use crate::metrics::METRICS;
use crate::obs::{self, BuildSpan};
use crate::validator::{ArtifactValidator, ValidationReport};

pub const LOG_BUILD_STARTED: &str = "Starting build validation...";
pub const LOG_BUILD_SUCCEEDED: &str = "Build completed successfully";

/// Result of one `process_build` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// The version had already left QUEUED; nothing was changed.
    AlreadyProcessed { status: VersionStatus },
    Ready { entrypoint: String },
    Failed { reason: String },
}

pub struct BuildOrchestrator {
    versions: Arc<dyn VersionStore>,
    blobs: Arc<dyn BlobStore>,
    validator: ArtifactValidator,
    scratch_root: PathBuf,
    build_timeout: Duration,
}

impl BuildOrchestrator {
    pub fn new(
        versions: Arc<dyn VersionStore>,
        blobs: Arc<dyn BlobStore>,
        scratch_root: impl Into<PathBuf>,
        build_timeout: Duration,
    ) -> Self {
        Self {
            versions,
            blobs,
            validator: ArtifactValidator::new(),
            scratch_root: scratch_root.into(),
            build_timeout,
        }
    }

    /// Run `process_build` on a background task.
    pub fn enqueue_build(self: &Arc<Self>, version_id: VersionId) -> JoinHandle<Result<BuildOutcome>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.process_build(version_id).await;
            if let Err(e) = &outcome {
                tracing::error!(version_id = version_id.0, error = %e, "background build failed");
            }
            outcome
        })
    }

    /// Build one version. Persistence failures propagate; everything else
    /// ends in a terminal status.
    pub async fn process_build(&self, version_id: VersionId) -> Result<BuildOutcome> {
        self.process_inner(version_id)
            .instrument(obs::build_span(version_id.0))
            .await
    }

    async fn process_inner(&self, version_id: VersionId) -> Result<BuildOutcome> {
        let started = Instant::now();
        let mut version = self.versions.get_version(version_id).await?;

        if version.status != VersionStatus::Queued {
            obs::emit_build_skipped(version_id.0, version.status.as_str());
            return Ok(BuildOutcome::AlreadyProcessed {
                status: version.status,
            });
        }

        let prior = version.advance(VersionStatus::Building, LOG_BUILD_STARTED)?;
        match self.versions.update_version(&version, prior).await {
            Ok(()) => {}
            Err(StorageError::StatusConflict { .. }) => {
                let current = self.versions.get_version(version_id).await?;
                obs::emit_build_skipped(version_id.0, current.status.as_str());
                return Ok(BuildOutcome::AlreadyProcessed {
                    status: current.status,
                });
            }
            Err(e) => return Err(e.into()),
        }
        obs::emit_build_started(version_id.0, version.agent_id.0);

        let archive = match self.blobs.read(&version.archive_path).await {
            Ok(bytes) => bytes,
            Err(StorageError::BlobNotFound { .. }) | Err(StorageError::InvalidBlobPath { .. }) => {
                let reason = format!("Archive not found: {}", version.archive_path);
                return self.fail(version, reason, started).await;
            }
            Err(e) => return Err(e.into()),
        };

        let report = match self.run_validation(version_id, archive).await {
            Ok(report) => report,
            Err(reason) => return self.fail(version, format!("Build failed: {reason}"), started).await,
        };

        if !report.valid {
            let reason = report
                .message
                .unwrap_or_else(|| "Build failed: validation rejected the artifact".into());
            return self.fail(version, reason, started).await;
        }

        let entrypoint = report.entrypoint.unwrap_or_default();
        version.config = report.descriptor;
        version.entrypoint = Some(entrypoint.clone());
        let prior = version.advance(VersionStatus::Ready, LOG_BUILD_SUCCEEDED)?;
        self.versions.update_version(&version, prior).await?;

        METRICS.inc_builds_ready();
        obs::emit_build_finished(version_id.0, VersionStatus::Ready.as_str(), elapsed_ms(started));
        Ok(BuildOutcome::Ready { entrypoint })
    }

    /// Validate on a blocking thread within the build timeout.
    ///
    /// `Err` carries the reason for faults outside the validator itself.
    async fn run_validation(&self, version_id: VersionId, archive: Vec<u8>) -> std::result::Result<ValidationReport, String> {
        let cancel = CancelFlag::new();
        let worker = {
            let cancel = cancel.clone();
            let validator = self.validator;
            let scratch_root = self.scratch_root.clone();
            tokio::task::spawn_blocking(move || -> std::result::Result<ValidationReport, String> {
                let _span = BuildSpan::enter(version_id.0);
                std::fs::create_dir_all(&scratch_root).map_err(|e| e.to_string())?;
                let scratch = tempfile::Builder::new()
                    .prefix(&format!("kiln-build-{}-", version_id.0))
                    .tempdir_in(&scratch_root)
                    .map_err(|e| e.to_string())?;
                Ok(validator.validate_bytes(&archive, scratch.path(), &cancel))
            })
        };

        match tokio::time::timeout(self.build_timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(join_err.to_string()),
            Err(_) => {
                cancel.raise();
                Err(format!(
                    "validation exceeded {} ms",
                    self.build_timeout.as_millis()
                ))
            }
        }
    }

    async fn fail(&self, mut version: AgentVersion, reason: String, started: Instant) -> Result<BuildOutcome> {
        let prior = version.advance(VersionStatus::Failed, &reason)?;
        self.versions.update_version(&version, prior).await?;

        METRICS.inc_builds_failed();
        tracing::warn!(version_id = version.id.0, reason = %reason, "build failed");
        obs::emit_build_finished(version.id.0, VersionStatus::Failed.as_str(), elapsed_ms(started));
        Ok(BuildOutcome::Failed { reason })
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

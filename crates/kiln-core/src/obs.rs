//! Structured observability hooks for build and execution lifecycles.
//!
//! This module provides:
//! - Scoped tracing spans: `build_span` / `execution_span` for async code
//!   (via `Instrument`), and the `BuildSpan` / `ExecutionSpan` RAII guards
//!   for blocking workers
//! - Emission functions for lifecycle events
//!
//! Events are emitted at `info!` level with an `event` field naming them.

use tracing::{info, warn, Span};

pub fn build_span(version_id: i64) -> Span {
    tracing::info_span!("kiln.build", version_id = version_id)
}

pub fn execution_span(execution_id: i64) -> Span {
    tracing::info_span!("kiln.execution", execution_id = execution_id)
}

/// RAII guard that enters a build-scoped span on the current thread.
///
/// Not `Send`; use [`build_span`] with `Instrument` across `.await`.
pub struct BuildSpan {
    _span: tracing::span::EnteredSpan,
}

impl BuildSpan {
    pub fn enter(version_id: i64) -> Self {
        Self {
            _span: build_span(version_id).entered(),
        }
    }
}

/// RAII guard that enters an execution-scoped span on the current thread.
pub struct ExecutionSpan {
    _span: tracing::span::EnteredSpan,
}

impl ExecutionSpan {
    pub fn enter(execution_id: i64) -> Self {
        Self {
            _span: execution_span(execution_id).entered(),
        }
    }
}

pub fn emit_build_started(version_id: i64, agent_id: i64) {
    info!(event = "build.started", version_id, agent_id);
}

/// Emit event: build reached a terminal status.
pub fn emit_build_finished(version_id: i64, status: &str, duration_ms: u64) {
    info!(event = "build.finished", version_id, status = %status, duration_ms);
}

/// Emit event: build request ignored because the version already left QUEUED.
pub fn emit_build_skipped(version_id: i64, status: &str) {
    info!(event = "build.skipped", version_id, status = %status);
}

pub fn emit_execution_started(execution_id: i64, version_id: i64, entrypoint: &str) {
    info!(
        event = "execution.started",
        execution_id,
        version_id,
        entrypoint = %entrypoint,
    );
}

/// Emit event: execution reached a terminal status.
pub fn emit_execution_finished(execution_id: i64, status: &str, duration_ms: u64) {
    info!(event = "execution.finished", execution_id, status = %status, duration_ms);
}

/// Emit event: worker abandoned after exceeding its time limit (warning level).
pub fn emit_execution_timed_out(execution_id: i64, limit_ms: u64) {
    warn!(event = "execution.timed_out", execution_id, limit_ms);
}

pub fn emit_execution_cancelled(execution_id: i64) {
    info!(event = "execution.cancelled", execution_id);
}

/// Emit event: a worker result arrived after the record had left RUNNING.
pub fn emit_result_discarded(execution_id: i64, status: &str) {
    warn!(event = "execution.result_discarded", execution_id, status = %status);
}

//! Global atomic counters for Kiln observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations, no locking.
pub struct Metrics {
    builds_ready: AtomicU64,
    builds_failed: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
    executions_cancelled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            builds_ready: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            executions_completed: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            executions_cancelled: AtomicU64::new(0),
        }
    }

    pub fn inc_builds_ready(&self) {
        self.builds_ready.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_ready", "counter incremented");
    }

    pub fn inc_builds_failed(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_failed", "counter incremented");
    }

    pub fn inc_executions_completed(&self) {
        self.executions_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_completed", "counter incremented");
    }

    /// Counts every FAILED execution, timeouts included.
    pub fn inc_executions_failed(&self) {
        self.executions_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_failed", "counter incremented");
    }

    pub fn inc_executions_timed_out(&self) {
        self.executions_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_timed_out", "counter incremented");
    }

    pub fn inc_executions_cancelled(&self) {
        self.executions_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_cancelled", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            builds_ready = self.builds_ready(),
            builds_failed = self.builds_failed(),
            executions_completed = self.executions_completed(),
            executions_failed = self.executions_failed(),
            executions_timed_out = self.executions_timed_out(),
            executions_cancelled = self.executions_cancelled(),
        );
    }

    pub fn builds_ready(&self) -> u64 {
        self.builds_ready.load(Ordering::Relaxed)
    }

    pub fn builds_failed(&self) -> u64 {
        self.builds_failed.load(Ordering::Relaxed)
    }

    pub fn executions_completed(&self) -> u64 {
        self.executions_completed.load(Ordering::Relaxed)
    }

    pub fn executions_failed(&self) -> u64 {
        self.executions_failed.load(Ordering::Relaxed)
    }

    pub fn executions_timed_out(&self) -> u64 {
        self.executions_timed_out.load(Ordering::Relaxed)
    }

    pub fn executions_cancelled(&self) -> u64 {
        self.executions_cancelled.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.builds_ready.store(0, Ordering::Relaxed);
        self.builds_failed.store(0, Ordering::Relaxed);
        self.executions_completed.store(0, Ordering::Relaxed);
        self.executions_failed.store(0, Ordering::Relaxed);
        self.executions_timed_out.store(0, Ordering::Relaxed);
        self.executions_cancelled.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_builds_ready();
        m.inc_builds_failed();
        m.inc_builds_failed();
        assert_eq!(m.builds_ready(), 1);
        assert_eq!(m.builds_failed(), 2);

        m.inc_executions_failed();
        m.inc_executions_timed_out();
        assert_eq!(m.executions_failed(), 1);
        assert_eq!(m.executions_timed_out(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_builds_ready();
        m.inc_executions_completed();
        m.inc_executions_cancelled();
        m.reset();
        assert_eq!(m.builds_ready(), 0);
        assert_eq!(m.executions_completed(), 0);
        assert_eq!(m.executions_cancelled(), 0);
    }
}

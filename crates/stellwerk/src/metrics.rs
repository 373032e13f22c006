use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::task::OutcomeKind;

/// Counters the runner maintains as tasks move through their lifecycle.
///
/// Updated with relaxed atomics; read via [`RunnerMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    /// Tasks accepted by `submit`.
    pub submitted: AtomicU64,
    /// Worker processes actually spawned.
    pub spawned: AtomicU64,
    /// Tasks resolved with a success value.
    pub completed: AtomicU64,
    /// Tasks resolved with a failure.
    pub failed: AtomicU64,
    /// Tasks resolved as cancelled.
    pub cancelled: AtomicU64,
    /// Workers alive right now.
    pub running: AtomicU64,
    /// Highest number of workers alive at once.
    pub peak_running: AtomicU64,
}

impl RunnerMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let now = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_running.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_gone(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, kind: OutcomeKind) {
        let counter = match kind {
            OutcomeKind::Completed => &self.completed,
            OutcomeKind::Failed(_) => &self.failed,
            OutcomeKind::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            peak_running: self.peak_running.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the runner's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: u64,
    pub peak_running: u64,
}

impl MetricsSnapshot {
    /// Resolved tasks of any kind.
    pub fn resolved(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FailureKind;

    #[test]
    fn metrics_default_zero() {
        let m = RunnerMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.submitted, 0);
        assert_eq!(snap.resolved(), 0);
        assert_eq!(snap.peak_running, 0);
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let m = RunnerMetrics::new();
        m.record_spawned();
        m.record_spawned();
        m.record_worker_gone();
        m.record_spawned();

        let snap = m.snapshot();
        assert_eq!(snap.spawned, 3);
        assert_eq!(snap.running, 2);
        assert_eq!(snap.peak_running, 2);
    }

    #[test]
    fn outcomes_land_in_their_counter() {
        let m = RunnerMetrics::new();
        m.record_outcome(OutcomeKind::Completed);
        m.record_outcome(OutcomeKind::Failed(FailureKind::Panic));
        m.record_outcome(OutcomeKind::Failed(FailureKind::Died));
        m.record_outcome(OutcomeKind::Cancelled);

        let snap = m.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.resolved(), 4);
    }

    #[test]
    fn snapshot_serializes() {
        let m = RunnerMetrics::new();
        m.record_submitted();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["submitted"], 1);
        assert_eq!(json["running"], 0);
    }
}

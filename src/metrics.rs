//! Draw counters for the status endpoint.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Aggregated draw metrics. Shared as `Arc<DrawMetrics>`.
#[derive(Debug, Default)]
pub struct DrawMetrics {
    /// Spins the operator started.
    pub spins_started: AtomicU64,
    /// Draws whose winner reached the registry.
    pub draws_committed: AtomicU64,
    /// Spins that ended without a winner.
    pub draws_void: AtomicU64,
    /// Winners announced but not persisted.
    pub commit_failures: AtomicU64,
    /// Conditional writes rejected because another console wrote first.
    pub commit_conflicts: AtomicU64,
    pub undos: AtomicU64,
    pub resets: AtomicU64,
    /// Sum of spin durations in milliseconds (for computing average).
    pub spin_duration_sum_ms: AtomicU64,
    /// Number of completed spins contributing to the duration sum.
    pub spins_completed: AtomicU64,
}

impl DrawMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_spin_started(&self) {
        self.spins_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spin coming to rest after `duration`.
    pub fn record_spin_completed(&self, duration: Duration) {
        self.spin_duration_sum_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.spins_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.draws_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_void(&self) {
        self.draws_void.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.commit_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undo(&self) {
        self.undos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Average spin duration in milliseconds, or 0 if none completed.
    pub fn avg_spin_ms(&self) -> u64 {
        let count = self.spins_completed.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.spin_duration_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "spins_started": self.spins_started.load(Ordering::Relaxed),
            "spins_completed": self.spins_completed.load(Ordering::Relaxed),
            "draws_committed": self.draws_committed.load(Ordering::Relaxed),
            "draws_void": self.draws_void.load(Ordering::Relaxed),
            "commit_failures": self.commit_failures.load(Ordering::Relaxed),
            "commit_conflicts": self.commit_conflicts.load(Ordering::Relaxed),
            "undos": self.undos.load(Ordering::Relaxed),
            "resets": self.resets.load(Ordering::Relaxed),
            "avg_spin_ms": self.avg_spin_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_ignores_unfinished_spins() {
        let metrics = DrawMetrics::new();
        assert_eq!(metrics.avg_spin_ms(), 0);

        metrics.record_spin_started();
        metrics.record_spin_started();
        metrics.record_spin_completed(Duration::from_millis(1000));
        metrics.record_spin_completed(Duration::from_millis(3000));
        assert_eq!(metrics.avg_spin_ms(), 2000);

        let json = metrics.to_json();
        assert_eq!(json["spins_started"], 2);
        assert_eq!(json["avg_spin_ms"], 2000);
    }
}

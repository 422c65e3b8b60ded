//! Metrics collected by the update log.
//!
//! Meters are monotonically increasing operation counters; gauges are
//! computed from live state when a snapshot is taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Operation meters for the update log.
#[derive(Debug)]
pub struct UpdateLogMetrics {
    replay_ops: AtomicU64,
    applying_buffered_ops: AtomicU64,
    copy_over_old_updates_ops: AtomicU64,
    start_time: SystemTime,
}

impl Default for UpdateLogMetrics {
    fn default() -> Self {
        UpdateLogMetrics {
            replay_ops: AtomicU64::new(0),
            applying_buffered_ops: AtomicU64::new(0),
            copy_over_old_updates_ops: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }
}

impl UpdateLogMetrics {
    /// Count one replayed operation.
    pub fn mark_replay_op(&self) {
        self.replay_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one applied-buffered operation.
    pub fn mark_applying_buffered_op(&self) {
        self.applying_buffered_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one copy-over-old-updates pass.
    pub fn mark_copy_over_old_updates(&self) {
        self.copy_over_old_updates_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Total replayed operations.
    pub fn replay_ops(&self) -> u64 {
        self.replay_ops.load(Ordering::Relaxed)
    }

    /// Total applied-buffered operations.
    pub fn applying_buffered_ops(&self) -> u64 {
        self.applying_buffered_ops.load(Ordering::Relaxed)
    }

    /// Total copy-over-old-updates passes.
    pub fn copy_over_old_updates_ops(&self) -> u64 {
        self.copy_over_old_updates_ops.load(Ordering::Relaxed)
    }

    /// When this update log was created.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }
}

/// Point-in-time view of the update log's metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Operations sitting in a log that have not reached the index yet.
    pub buffered_ops: u64,
    /// Retired logs not yet trimmed.
    pub replay_logs_remaining: usize,
    /// Total bytes across retired logs.
    pub replay_bytes_remaining: u64,
    /// Numeric state value; stable across releases.
    pub state: u32,
    /// Total replayed operations.
    pub replay_ops: u64,
    /// Total applied-buffered operations.
    pub applying_buffered_ops: u64,
    /// Total copy-over-old-updates passes.
    pub copy_over_old_updates_ops: u64,
    /// When this update log was created.
    pub start_time: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meters_accumulate() {
        let metrics = UpdateLogMetrics::default();
        metrics.mark_replay_op();
        metrics.mark_replay_op();
        metrics.mark_applying_buffered_op();
        metrics.mark_copy_over_old_updates();

        assert_eq!(metrics.replay_ops(), 2);
        assert_eq!(metrics.applying_buffered_ops(), 1);
        assert_eq!(metrics.copy_over_old_updates_ops(), 1);
    }
}

//! The update log core.
//!
//! An update log records every document mutation before it reaches the
//! index, keeps an in-memory id → position map for near-real-time lookup,
//! and replays uncommitted tails after unclean shutdowns. See
//! [`update_log::UpdateLog`] for the façade.

pub mod command;
pub mod key_index;
pub mod locks;
pub mod log_file;
pub mod metrics;
pub mod recent;
pub(crate) mod replay;
pub mod update_log;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use locks::UpdateLocks;
pub use log_file::{LogEntry, Payload, SyncLevel, TransactionLog};
pub use metrics::{MetricsSnapshot, UpdateLogMetrics};
pub use recent::RecentUpdates;
pub use update_log::{Dbq, UpdateLog, UpdateLogConfig};

/// File-name prefix of regular transaction logs.
pub const TLOG_NAME: &str = "tlog";
/// File-name prefix of buffer sub-logs.
pub const BUFFER_TLOG_NAME: &str = "buffer.tlog";

/// File name for a log id: zero-padded so lexicographic order is id order.
pub fn log_file_name(prefix: &str, id: u64) -> String {
    format!("{prefix}.{id:019}")
}

/// Update-log state.
///
/// Numeric values are stable: external monitoring depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
    /// Replaying stale logs found at startup.
    Replaying = 0,
    /// Accumulating incoming writes in a buffer log.
    Buffering = 1,
    /// Draining the buffer log into the live ingest path.
    ApplyingBuffered = 2,
    /// Normal operation.
    Active = 3,
}

impl State {
    /// The stable numeric value.
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Decode a stored value; unknown values map to [`State::Active`].
    pub fn from_value(value: u32) -> State {
        match value {
            0 => State::Replaying,
            1 => State::Buffering,
            2 => State::ApplyingBuffered,
            _ => State::Active,
        }
    }
}

/// Counters describing one recovery (startup replay or buffered apply).
#[derive(Debug, Default)]
pub struct RecoveryInfo {
    position_of_start: AtomicU64,
    adds: AtomicU64,
    deletes: AtomicU64,
    delete_by_query: AtomicU64,
    errors: AtomicU64,
    failed: AtomicBool,
}

impl RecoveryInfo {
    /// Byte offset replay started from.
    pub fn position_of_start(&self) -> u64 {
        self.position_of_start.load(Ordering::SeqCst)
    }

    /// Record the byte offset replay starts from.
    pub fn set_position_of_start(&self, pos: u64) {
        self.position_of_start.store(pos, Ordering::SeqCst);
    }

    /// Replayed adds (including in-place updates).
    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::SeqCst)
    }

    /// Replayed deletes by id.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Replayed deletes by query.
    pub fn delete_by_query(&self) -> u64 {
        self.delete_by_query.load(Ordering::SeqCst)
    }

    /// Records that failed and were skipped.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Whether the recovery failed unrecoverably.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_adds(&self) {
        self.adds.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn incr_deletes(&self) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn incr_delete_by_query(&self) {
        self.delete_by_query.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Display for RecoveryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecoveryInfo{{adds={} deletes={} deleteByQuery={} errors={} positionOfStart={}}}",
            self.adds(),
            self.deletes(),
            self.delete_by_query(),
            self.errors(),
            self.position_of_start()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_padding() {
        assert_eq!(log_file_name(TLOG_NAME, 0), "tlog.0000000000000000000");
        assert_eq!(log_file_name(TLOG_NAME, 42), "tlog.0000000000000000042");
        // lexicographic order matches id order
        assert!(log_file_name(TLOG_NAME, 9) < log_file_name(TLOG_NAME, 10));
    }

    #[test]
    fn test_state_values_are_stable() {
        assert_eq!(State::Replaying.value(), 0);
        assert_eq!(State::Buffering.value(), 1);
        assert_eq!(State::ApplyingBuffered.value(), 2);
        assert_eq!(State::Active.value(), 3);
        assert_eq!(State::from_value(1), State::Buffering);
    }
}

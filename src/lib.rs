//! # Naginata
//!
//! A durable, per-shard update log for near-real-time search, with an
//! in-memory lookup index, crash recovery, and leader-failover buffering.
//!
//! ## Features
//!
//! - Append-only transaction logs with positional, reverse, and sorted
//!   readers
//! - Realtime get: id → latest logged document, across commit boundaries
//! - Crash recovery by replaying uncommitted log tails
//! - In-place (partial) update chains resolved back to a full document
//! - Buffering mode for replicas catching up from a snapshot
//! - Recent-update summaries for peer sync
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use naginata::document::Document;
//! use naginata::index::MemoryIndex;
//! use naginata::update::command::AddCommand;
//! use naginata::update::{UpdateLog, UpdateLogConfig};
//!
//! let tmp = tempfile::tempdir().unwrap();
//! let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
//! ulog.init(Arc::new(MemoryIndex::new())).unwrap();
//!
//! let doc = Document::builder().add_text("title", "hello").build();
//! ulog.add(AddCommand::new(b"doc-1".to_vec(), doc, 10), false).unwrap();
//!
//! assert_eq!(ulog.lookup_version(b"doc-1").unwrap(), Some(10));
//! ulog.close(true);
//! ```

pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod update;

pub mod prelude {
    //! Convenience re-exports.
    pub use crate::document::{Document, FieldValue};
    pub use crate::error::{NaginataError, Result};
    pub use crate::index::{IndexHandle, MemoryIndex, Searcher, UpdateProcessor};
    pub use crate::update::command::{AddCommand, CommitCommand, DeleteCommand};
    pub use crate::update::{State, SyncLevel, UpdateLog, UpdateLogConfig};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Boundary to the search-index writer.
//!
//! The update log never writes to the index directly. Everything it needs
//! from the index side is expressed by [`IndexHandle`]: committing, opening
//! a near-real-time searcher, resolving a document's version from the
//! index, and creating [`UpdateProcessor`]s that replay funnels commands
//! through. [`MemoryIndex`] is the in-crate reference implementation.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use crate::document::Document;
use crate::error::Result;
use crate::update::command::{AddCommand, CommitCommand, DeleteCommand};

pub use memory::MemoryIndex;

/// A point-in-time view of the index, opened without flushing to disk.
pub trait Searcher: Send + Sync {
    /// Number of live documents visible to this searcher.
    fn num_docs(&self) -> usize;

    /// The document for `id`, if visible.
    fn doc(&self, id: &[u8]) -> Option<Document>;

    /// The version of the document for `id`, if visible.
    fn version(&self, id: &[u8]) -> Option<i64>;
}

/// Applies a stream of commands to the index during replay.
///
/// Processors are not thread-safe; replay keeps one per worker thread and
/// calls [`UpdateProcessor::finish`] on each at the end.
pub trait UpdateProcessor: Send {
    /// Apply an add (full or in-place).
    fn process_add(&mut self, cmd: &AddCommand) -> Result<()>;

    /// Apply a delete by id or by query.
    fn process_delete(&mut self, cmd: &DeleteCommand) -> Result<()>;

    /// Flush any processor-local state.
    fn finish(&mut self) -> Result<()>;
}

/// Handle on the index writer owned by the shard.
pub trait IndexHandle: Send + Sync + fmt::Debug {
    /// Commit the index writer.
    fn commit(&self, cmd: &CommitCommand) -> Result<()>;

    /// Open a fresh near-real-time searcher and return it.
    ///
    /// The update log calls this for its visibility side effect whenever
    /// its caches can no longer be trusted.
    fn open_realtime_searcher(&self) -> Result<Arc<dyn Searcher>>;

    /// The most recently opened searcher.
    fn searcher(&self) -> Arc<dyn Searcher>;

    /// Resolve a document's version from the index (not from any log).
    fn version_from_index(&self, id: &[u8]) -> Result<Option<i64>>;

    /// Whether the underlying storage survives restarts.
    fn is_persistent(&self) -> bool {
        true
    }

    /// Whether this handle was produced by a shard reload.
    fn is_reloaded(&self) -> bool {
        false
    }

    /// Create a processor for replaying commands into the index.
    fn create_processor(&self) -> Result<Box<dyn UpdateProcessor>>;
}

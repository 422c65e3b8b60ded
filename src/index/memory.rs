//! In-memory index implementation.
//!
//! A small but complete [`IndexHandle`] used by tests and by embedders that
//! do not need a persistent index. Documents live in a map keyed by their
//! indexed id; a "searcher" is a snapshot of that map taken when the last
//! near-real-time searcher was opened, which gives the same visibility
//! behavior a real index exhibits between commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::document::Document;
use crate::error::Result;
use crate::index::{IndexHandle, Searcher, UpdateProcessor};
use crate::update::command::{AddCommand, CommitCommand, DeleteCommand};

#[derive(Debug, Default)]
struct MemoryIndexInner {
    /// Live documents as the writer sees them.
    live: HashMap<Vec<u8>, (i64, Document)>,
    /// Snapshot visible to the most recently opened searcher.
    view: HashMap<Vec<u8>, (i64, Document)>,
    commit_count: u64,
}

/// An in-memory [`IndexHandle`].
#[derive(Debug)]
pub struct MemoryIndex {
    inner: Arc<RwLock<MemoryIndexInner>>,
    persistent: AtomicBool,
    reloaded: AtomicBool,
}

impl MemoryIndex {
    /// Create an empty index that reports itself persistent.
    pub fn new() -> Self {
        MemoryIndex {
            inner: Arc::new(RwLock::new(MemoryIndexInner::default())),
            persistent: AtomicBool::new(true),
            reloaded: AtomicBool::new(false),
        }
    }

    /// Control the `is_persistent` answer (non-persistent indexes get their
    /// logs cleared at startup).
    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::SeqCst);
    }

    /// Control the `is_reloaded` answer.
    pub fn set_reloaded(&self, reloaded: bool) {
        self.reloaded.store(reloaded, Ordering::SeqCst);
    }

    /// Apply an add or in-place update to the writer's live view.
    pub fn apply_add(&self, cmd: &AddCommand) {
        let mut inner = self.inner.write();
        let doc = if cmd.is_in_place() {
            let mut merged = cmd.doc.clone();
            if let Some((_, existing)) = inner.live.get(&cmd.id) {
                merged.merge_missing_fields(existing, None);
            }
            merged
        } else {
            cmd.doc.clone()
        };
        inner.live.insert(cmd.id.clone(), (cmd.version, doc));
    }

    /// Apply a delete by id to the writer's live view.
    pub fn apply_delete(&self, id: &[u8]) {
        self.inner.write().live.remove(id);
    }

    /// Apply a delete by query to the writer's live view.
    pub fn apply_delete_by_query(&self, query: &str) {
        let mut inner = self.inner.write();
        inner.live.retain(|_, (_, doc)| !query_matches(query, doc));
    }

    /// Number of commits performed; used by tests.
    pub fn commit_count(&self) -> u64 {
        self.inner.read().commit_count
    }
}

impl IndexHandle for MemoryIndex {
    fn commit(&self, _cmd: &CommitCommand) -> Result<()> {
        let mut inner = self.inner.write();
        let snapshot = inner.live.clone();
        inner.view = snapshot;
        inner.commit_count += 1;
        Ok(())
    }

    fn open_realtime_searcher(&self) -> Result<Arc<dyn Searcher>> {
        let mut inner = self.inner.write();
        let snapshot = inner.live.clone();
        inner.view = snapshot.clone();
        Ok(Arc::new(MemorySearcher { docs: snapshot }))
    }

    fn searcher(&self) -> Arc<dyn Searcher> {
        Arc::new(MemorySearcher {
            docs: self.inner.read().view.clone(),
        })
    }

    fn version_from_index(&self, id: &[u8]) -> Result<Option<i64>> {
        Ok(self.inner.read().view.get(id).map(|(v, _)| *v))
    }

    fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    fn is_reloaded(&self) -> bool {
        self.reloaded.load(Ordering::SeqCst)
    }

    fn create_processor(&self) -> Result<Box<dyn UpdateProcessor>> {
        Ok(Box::new(MemoryProcessor {
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Snapshot searcher over the in-memory index.
#[derive(Debug)]
pub struct MemorySearcher {
    docs: HashMap<Vec<u8>, (i64, Document)>,
}

impl Searcher for MemorySearcher {
    fn num_docs(&self) -> usize {
        self.docs.len()
    }

    fn doc(&self, id: &[u8]) -> Option<Document> {
        self.docs.get(id).map(|(_, d)| d.clone())
    }

    fn version(&self, id: &[u8]) -> Option<i64> {
        self.docs.get(id).map(|(v, _)| *v)
    }
}

struct MemoryProcessor {
    inner: Arc<RwLock<MemoryIndexInner>>,
}

impl UpdateProcessor for MemoryProcessor {
    fn process_add(&mut self, cmd: &AddCommand) -> Result<()> {
        let mut inner = self.inner.write();
        let doc = if cmd.is_in_place() {
            let mut merged = cmd.doc.clone();
            if let Some((_, existing)) = inner.live.get(&cmd.id) {
                merged.merge_missing_fields(existing, None);
            }
            merged
        } else {
            cmd.doc.clone()
        };
        inner.live.insert(cmd.id.clone(), (cmd.version, doc));
        Ok(())
    }

    fn process_delete(&mut self, cmd: &DeleteCommand) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(id) = &cmd.id {
            inner.live.remove(id);
        } else if let Some(query) = &cmd.query {
            inner.live.retain(|_, (_, doc)| !query_matches(query, doc));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Minimal query matcher: `*:*` matches everything, `field:value` matches
/// string equality on the rendered field value.
fn query_matches(query: &str, doc: &Document) -> bool {
    if query == "*:*" {
        return true;
    }
    match query.split_once(':') {
        Some((field, value)) => doc
            .get_field(field)
            .map(|v| v.to_query_string() == value)
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn add(id: &[u8], version: i64) -> AddCommand {
        AddCommand::new(
            id.to_vec(),
            Document::builder().add_integer("v", version).build(),
            version,
        )
    }

    #[test]
    fn test_searcher_visibility_follows_opens() {
        let index = MemoryIndex::new();
        index.apply_add(&add(b"a", 10));

        // nothing visible until a searcher is opened
        assert_eq!(index.searcher().num_docs(), 0);
        assert_eq!(index.version_from_index(b"a").unwrap(), None);

        let searcher = index.open_realtime_searcher().unwrap();
        assert_eq!(searcher.num_docs(), 1);
        assert_eq!(index.version_from_index(b"a").unwrap(), Some(10));
    }

    #[test]
    fn test_in_place_add_merges_existing_fields() {
        let index = MemoryIndex::new();
        index.apply_add(&AddCommand::new(
            b"a".to_vec(),
            Document::builder().add_integer("x", 1).add_integer("y", 1).build(),
            10,
        ));
        index.apply_add(&AddCommand::in_place(
            b"a".to_vec(),
            Document::builder().add_integer("y", 2).build(),
            11,
            10,
        ));

        let searcher = index.open_realtime_searcher().unwrap();
        let doc = searcher.doc(b"a").unwrap();
        assert_eq!(doc.get_field("x").unwrap().as_integer(), Some(1));
        assert_eq!(doc.get_field("y").unwrap().as_integer(), Some(2));
    }

    #[test]
    fn test_delete_by_query_matching() {
        let index = MemoryIndex::new();
        index.apply_add(&AddCommand::new(
            b"a".to_vec(),
            Document::builder().add_text("color", "red").build(),
            10,
        ));
        index.apply_add(&AddCommand::new(
            b"b".to_vec(),
            Document::builder().add_text("color", "blue").build(),
            11,
        ));

        index.apply_delete_by_query("color:red");
        let searcher = index.open_realtime_searcher().unwrap();
        assert_eq!(searcher.num_docs(), 1);
        assert!(searcher.doc(b"b").is_some());

        index.apply_delete_by_query("*:*");
        let searcher = index.open_realtime_searcher().unwrap();
        assert_eq!(searcher.num_docs(), 0);
    }

    #[test]
    fn test_processor_applies_commands() {
        let index = MemoryIndex::new();
        let mut proc = index.create_processor().unwrap();
        proc.process_add(&add(b"a", 10)).unwrap();
        proc.process_delete(&DeleteCommand::by_id(b"a".to_vec(), -11))
            .unwrap();
        proc.finish().unwrap();

        let searcher = index.open_realtime_searcher().unwrap();
        assert_eq!(searcher.num_docs(), 0);
    }
}

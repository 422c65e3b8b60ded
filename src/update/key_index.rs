//! In-memory id → log-position index.
//!
//! The update log keeps up to three generations of this map (`current`,
//! `prev`, `prev2`), rotated on commit boundaries, plus a bounded
//! insertion-ordered cache of recent deletes. The delete cache exists
//! because the index cannot distinguish "absent" from "deleted" on its own.

use ahash::AHashMap;
use std::collections::VecDeque;

/// One generation of the id → position map.
pub type KeyIndex = AHashMap<Vec<u8>, LogPtr>;

/// Position and version of an update in a transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPtr {
    /// Byte offset in the backing log; -1 for map-only entries written
    /// during replay.
    pub offset: i64,
    /// Version of the update at that position.
    pub version: i64,
    /// Offset of the update this one depends on (in-place chains); -1 if
    /// not applicable.
    pub prev_offset: i64,
}

impl LogPtr {
    /// An entry without an in-place dependency.
    pub fn new(offset: i64, version: i64) -> Self {
        LogPtr {
            offset,
            version,
            prev_offset: -1,
        }
    }

    /// An entry depending on a previous in-place update.
    pub fn with_prev(offset: i64, version: i64, prev_offset: i64) -> Self {
        LogPtr {
            offset,
            version,
            prev_offset,
        }
    }
}

/// Bounded insertion-ordered map of recent deletes.
///
/// Evicts the oldest entry once the capacity is exceeded. Re-inserting an
/// existing id updates its value but keeps its original position.
#[derive(Debug)]
pub struct OldDeletes {
    capacity: usize,
    map: AHashMap<Vec<u8>, LogPtr>,
    order: VecDeque<Vec<u8>>,
}

impl OldDeletes {
    /// A cache evicting beyond `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        OldDeletes {
            capacity,
            map: AHashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::new(),
        }
    }

    /// Record a delete for `id`.
    pub fn insert(&mut self, id: Vec<u8>, ptr: LogPtr) {
        if self.map.insert(id.clone(), ptr).is_none() {
            self.order.push_back(id);
            while self.map.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                } else {
                    break;
                }
            }
        }
    }

    /// The recorded delete for `id`, if still cached.
    pub fn get(&self, id: &[u8]) -> Option<&LogPtr> {
        self.map.get(id)
    }

    /// Number of cached deletes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all cached deletes.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

//! Summaries of the most recent updates across all live logs.
//!
//! A [`RecentUpdates`] is a scoped snapshot: it takes a reference on every
//! log it reads (newest first) and releases them when dropped. Peer sync
//! uses it to advertise the last N versions this shard has seen and to
//! fetch individual updates by version.

use std::collections::HashSet;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::Result;
use crate::update::command::{ADD, COMMIT, DELETE, DELETE_BY_QUERY};
use crate::update::log_file::{LogEntry, TransactionLog};

/// Position of one update inside a snapshot log.
#[derive(Debug, Clone)]
pub struct Update {
    /// The log the update lives in.
    pub log: Arc<TransactionLog>,
    /// The update's version.
    pub version: i64,
    /// For in-place updates, the version depended upon; -1 otherwise.
    pub previous_version: i64,
    /// Byte offset of the record.
    pub pointer: u64,
}

/// A delete-by-id observed while scanning.
#[derive(Debug, Clone)]
pub struct DeleteUpdate {
    /// The delete's (negative) version.
    pub version: i64,
    /// The deleted id bytes.
    pub id: Vec<u8>,
}

/// Snapshot of the most recent updates, newest log first.
pub struct RecentUpdates {
    log_list: Vec<Arc<TransactionLog>>,
    num_records_to_keep: usize,
    /// Per-log updates, newest first within each log.
    update_list: Vec<Vec<Update>>,
    updates: AHashMap<i64, Update>,
    /// Delete-by-query updates, newest first.
    pub delete_by_query_list: Vec<Update>,
    /// Deletes by id, newest first.
    pub delete_list: Vec<DeleteUpdate>,
    buffer_updates: HashSet<i64>,
}

impl RecentUpdates {
    /// Build the snapshot. `log_list` must be ordered newest first and each
    /// log must carry a reference owned by this snapshot.
    pub(crate) fn new(log_list: Vec<Arc<TransactionLog>>, num_records_to_keep: usize) -> Self {
        let mut recent = RecentUpdates {
            log_list,
            num_records_to_keep,
            update_list: Vec::new(),
            updates: AHashMap::new(),
            delete_by_query_list: Vec::new(),
            delete_list: Vec::new(),
            buffer_updates: HashSet::new(),
        };
        recent.update();
        recent
    }

    /// Versions of updates made while the shard was buffering.
    pub fn buffer_updates(&self) -> &HashSet<i64> {
        &self.buffer_updates
    }

    /// The newest `n` distinct versions, in encounter order.
    pub fn get_versions(&self, n: usize) -> Vec<i64> {
        self.get_versions_capped(n, i64::MAX)
    }

    /// The newest `n` distinct versions with `|version| <= |max_version|`.
    pub fn get_versions_capped(&self, n: usize, max_version: i64) -> Vec<i64> {
        let mut out = Vec::with_capacity(n.min(self.updates.len()));
        let mut seen = HashSet::with_capacity(n);
        let mut remaining = n;

        for single_list in &self.update_list {
            for ptr in single_list {
                if ptr.version.unsigned_abs() > max_version.unsigned_abs() {
                    continue;
                }
                if !seen.insert(ptr.version) {
                    continue;
                }
                out.push(ptr.version);
                remaining -= 1;
                if remaining == 0 {
                    return out;
                }
            }
        }
        out
    }

    /// The record for a version, if present in the snapshot.
    pub fn lookup(&self, version: i64) -> Result<Option<LogEntry>> {
        match self.updates.get(&version) {
            None => Ok(None),
            Some(update) => update.log.lookup(update.pointer).map(Some),
        }
    }

    /// Delete-by-query records strictly newer than `after_version`, skipping
    /// versions already in `seen`.
    pub fn get_delete_by_query(
        &self,
        after_version: i64,
        seen: &mut HashSet<i64>,
    ) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        for update in &self.delete_by_query_list {
            if update.version.unsigned_abs() > after_version.unsigned_abs() {
                if seen.insert(update.version) {
                    out.push(update.log.lookup(update.pointer)?);
                } else {
                    log::debug!(
                        "get_delete_by_query(after_version={after_version}) skipping duplicate version {}",
                        update.version
                    );
                }
            }
        }
        Ok(out)
    }

    /// The largest `|version|` present in the snapshot.
    pub fn max_recent_version(&self) -> i64 {
        self.updates
            .keys()
            .map(|v| v.unsigned_abs() as i64)
            .max()
            .unwrap_or(0)
    }

    fn update(&mut self) {
        let mut num_updates = 0;

        for old_log in &self.log_list {
            let mut updates_for_log = Vec::new();

            let mut reader = match Arc::clone(old_log).reverse_reader() {
                Ok(r) => r,
                Err(e) => {
                    log::error!("exception reading versions from log {old_log:?}: {e}");
                    self.update_list.push(updates_for_log);
                    continue;
                }
            };

            while num_updates < self.num_records_to_keep {
                let entry = match reader.next() {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("exception reverse reading log {old_log:?}: {e}");
                        break;
                    }
                };

                let version = entry.version;
                if old_log.is_buffer() {
                    self.buffer_updates.insert(version);
                }

                match entry.base_op() {
                    ADD | DELETE | DELETE_BY_QUERY => {
                        let update = Update {
                            log: Arc::clone(old_log),
                            pointer: reader.position(),
                            version,
                            previous_version: if entry.is_in_place() {
                                entry.prev_version
                            } else {
                                -1
                            },
                        };
                        updates_for_log.push(update.clone());
                        self.updates.insert(version, update.clone());

                        if entry.base_op() == DELETE_BY_QUERY {
                            self.delete_by_query_list.push(update);
                        } else if entry.base_op() == DELETE {
                            if let Some(id) = entry.indexed_id() {
                                self.delete_list.push(DeleteUpdate {
                                    version,
                                    id: id.to_vec(),
                                });
                            }
                        }
                    }
                    COMMIT => {}
                    other => {
                        log::warn!("unknown operation {other} reverse reading log {old_log:?}");
                        break;
                    }
                }

                num_updates += 1;
            }

            self.update_list.push(updates_for_log);
        }
    }
}

impl Drop for RecentUpdates {
    fn drop(&mut self) {
        for log in &self.log_list {
            log.decref();
        }
    }
}

impl std::fmt::Debug for RecentUpdates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecentUpdates")
            .field("logs", &self.log_list.len())
            .field("updates", &self.updates.len())
            .field("deletes", &self.delete_list.len())
            .field("delete_by_queries", &self.delete_by_query_list.len())
            .finish()
    }
}

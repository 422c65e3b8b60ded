//! The update-log façade.
//!
//! Holds references to the transaction logs and a map of unique key →
//! location in log (along with the update's version). The map is only
//! cleared on soft or hard commit; up to two older generations are kept so
//! lookups keep working while a commit or searcher reopen is in flight.
//!
//! All structural changes (map mutation, log rotation, retention trimming,
//! state transitions) serialize on one internal monitor. Log appends happen
//! under it; log reads do not: readers take a reference on the log and
//! read outside the lock.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::error::{NaginataError, Result};
use crate::index::IndexHandle;
use crate::storage::dir::{self, LogDirectory};
use crate::update::command::{
    flags, AddCommand, CommitCommand, DeleteCommand, ADD, COMMIT, DELETE, DELETE_BY_QUERY,
};
use crate::update::key_index::{KeyIndex, LogPtr, OldDeletes};
use crate::update::log_file::{LogEntry, SyncLevel, TransactionLog};
use crate::update::metrics::{MetricsSnapshot, UpdateLogMetrics};
use crate::update::recent::RecentUpdates;
use crate::update::replay::LogReplayer;
use crate::update::{
    log_file_name, RecoveryInfo, State, UpdateLocks, BUFFER_TLOG_NAME, TLOG_NAME,
};

/// Bound on the recent-deletes cache.
pub const NUM_DELETES_TO_KEEP: usize = 1000;
/// Bound on the recent delete-by-query list.
pub const NUM_DELETES_BY_QUERY_TO_KEEP: usize = 100;

/// Configuration for an update log. All fields have sensible defaults.
#[derive(Debug, Clone)]
pub struct UpdateLogConfig {
    /// Directory holding the log files; relative paths resolve against the
    /// shard instance directory and must not escape it.
    pub dir: Option<String>,
    /// Flush policy applied by [`UpdateLog::finish`].
    pub sync_level: SyncLevel,
    /// Target number of records retained across old logs.
    pub num_records_to_keep: usize,
    /// Hard cap on retained log files.
    pub max_num_logs_to_keep: usize,
    /// Read-side timeout of the update lock; 0 means wait forever.
    pub doc_lock_timeout_ms: u64,
    /// Obsolete; accepted and ignored with a warning.
    pub num_version_buckets: Option<u32>,
}

impl Default for UpdateLogConfig {
    fn default() -> Self {
        UpdateLogConfig {
            dir: None,
            sync_level: SyncLevel::Flush,
            num_records_to_keep: 100,
            max_num_logs_to_keep: 10,
            doc_lock_timeout_ms: 0,
            num_version_buckets: None,
        }
    }
}

/// The query and positive version of a recent delete-by-query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dbq {
    /// The query string.
    pub query: String,
    /// Positive version of the delete.
    pub version: i64,
}

#[derive(Default)]
struct Inner {
    /// Id the next created log will get.
    id: u64,
    tlog: Option<Arc<TransactionLog>>,
    prev_tlog: Option<Arc<TransactionLog>>,
    buffer_tlog: Option<Arc<TransactionLog>>,
    /// Retired logs, newest first.
    old_logs: VecDeque<Arc<TransactionLog>>,
    /// Number of records across `old_logs`.
    num_old_records: usize,
    /// Oldest-first pair of logs that were newest at startup.
    newest_logs_on_startup: Vec<Arc<TransactionLog>>,

    map: KeyIndex,
    prev_map: Option<KeyIndex>,
    prev_map2: Option<KeyIndex>,
    /// The log backing entries found in `prev_map`.
    prev_map_log: Option<Arc<TransactionLog>>,
    /// The log backing entries found in `prev_map2`.
    prev_map_log2: Option<Arc<TransactionLog>>,

    old_deletes: Option<OldDeletes>,
    /// Recent delete-by-query commands, newest (highest version) first.
    delete_by_queries: VecDeque<Dbq>,

    starting_versions: Vec<i64>,
    exist_old_buffer_log: bool,
}

impl Inner {
    fn old_deletes(&mut self) -> &mut OldDeletes {
        self.old_deletes
            .get_or_insert_with(|| OldDeletes::new(NUM_DELETES_TO_KEEP))
    }
}

/// Durable per-shard update log with an in-memory lookup index.
pub struct UpdateLog {
    config: UpdateLogConfig,
    dir: LogDirectory,
    index: RwLock<Option<Arc<dyn IndexHandle>>>,
    locks: Arc<UpdateLocks>,
    state: AtomicU32,
    initialized: AtomicBool,
    closed: AtomicBool,
    cancel_apply_buffered: AtomicBool,
    metrics: UpdateLogMetrics,
    recovery_info: Mutex<Option<Arc<RecoveryInfo>>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for UpdateLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLog")
            .field("dir", &self.dir.path())
            .field("state", &self.state())
            .finish()
    }
}

impl UpdateLog {
    /// First init phase: resolve the log directory and record the static
    /// configuration. The log is not usable until [`UpdateLog::init`] binds
    /// it to an index handle.
    pub fn new(instance_dir: &Path, config: UpdateLogConfig) -> Result<Self> {
        if config.num_version_buckets.is_some() {
            log::warn!("numVersionBuckets is obsolete and ignored");
        }

        let resolved = LogDirectory::resolve(instance_dir, config.dir.as_deref())?;
        let dir = LogDirectory::open(resolved)?;

        log::info!(
            "initializing update log: dir={} syncLevel={:?} numRecordsToKeep={} maxNumLogsToKeep={}",
            dir.path().display(),
            config.sync_level,
            config.num_records_to_keep,
            config.max_num_logs_to_keep
        );

        let locks = Arc::new(UpdateLocks::new(config.doc_lock_timeout_ms));
        Ok(UpdateLog {
            config,
            dir,
            index: RwLock::new(None),
            locks,
            state: AtomicU32::new(State::Active.value()),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel_apply_buffered: AtomicBool::new(false),
            metrics: UpdateLogMetrics::default(),
            recovery_info: Mutex::new(None),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Second init phase: bind to the index writer, scan the directory for
    /// existing logs, and seed the recent-deletes and delete-by-query
    /// caches from them.
    pub fn init(&self, index: Arc<dyn IndexHandle>) -> Result<()> {
        *self.index.write() = Some(Arc::clone(&index));

        if self.initialized.swap(true, Ordering::SeqCst) {
            log::debug!("update log re-init: nothing else to do");
            return Ok(());
        }

        if !index.is_reloaded() && !index.is_persistent() {
            self.dir.clear();
        }

        let tlog_prefix = format!("{TLOG_NAME}.");
        let buffer_prefix = format!("{BUFFER_TLOG_NAME}.");

        {
            let mut inner = self.inner.lock();
            let files = self.dir.list_files(&tlog_prefix)?;
            inner.id = scan_last_log_id(&files).map(|last| last + 1).unwrap_or(0);
            // existing buffer logs mean the previous recovery never
            // completed; peer sync must not be skipped
            inner.exist_old_buffer_log = self.dir.any_file_with_prefix(&buffer_prefix);

            log::debug!(
                "update log init: dir={} existing logs={files:?} next id={}",
                self.dir.path().display(),
                inner.id
            );

            for name in &files {
                let path = self.dir.file_path(name);
                let log_id = parse_log_id(name).unwrap_or(0);
                match TransactionLog::open_existing(path.clone(), log_id) {
                    Ok(old_log) => {
                        // don't trim on startup since more than one log may
                        // be uncapped
                        self.add_old_log_locked(&mut inner, old_log, false);
                    }
                    Err(e) => {
                        log::error!(
                            "failure to open existing log file (non fatal) {}: {e}",
                            path.display()
                        );
                        dir::delete_file(&path);
                    }
                }
            }

            // oldest-first pair of the newest logs; at abnormal close both
            // the active and the previous log may be uncapped
            let newest: Vec<Arc<TransactionLog>> =
                inner.old_logs.iter().take(2).rev().cloned().collect();
            inner.newest_logs_on_startup = newest;
        }

        let recent = self.recent_updates();
        let starting_versions = recent.get_versions(self.config.num_records_to_keep);

        {
            let mut inner = self.inner.lock();
            inner.starting_versions = starting_versions;
            // populate recent deletes (the index can't provide these)
            for du in recent.delete_list.iter().rev() {
                inner
                    .old_deletes()
                    .insert(du.id.clone(), LogPtr::new(-1, du.version));
            }
        }

        // populate recent delete-by-query commands
        for update in recent.delete_by_query_list.iter().rev() {
            match update.log.lookup(update.pointer) {
                Ok(entry) => {
                    if let Some(query) = entry.query() {
                        self.track_delete_by_query(query, entry.version);
                    }
                }
                Err(e) => log::warn!("could not read delete-by-query at startup: {e}"),
            }
        }

        Ok(())
    }

    /// The shard-wide update lock.
    pub fn locks(&self) -> &Arc<UpdateLocks> {
        &self.locks
    }

    /// The operation meters.
    pub fn metrics(&self) -> &UpdateLogMetrics {
        &self.metrics
    }

    /// Current state.
    pub fn state(&self) -> State {
        State::from_value(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state.value(), Ordering::SeqCst);
    }

    /// Versions visible at startup, for peer sync.
    pub fn starting_versions(&self) -> Vec<i64> {
        self.inner.lock().starting_versions.clone()
    }

    /// Whether a buffer log was found at startup (a previous recovery did
    /// not complete).
    pub fn exist_old_buffer_log(&self) -> bool {
        self.inner.lock().exist_old_buffer_log
    }

    /// Whether an uncommitted active log exists.
    pub fn has_uncommitted_changes(&self) -> bool {
        self.inner.lock().tlog.is_some()
    }

    /// Retention target for records in old logs.
    pub fn num_records_to_keep(&self) -> usize {
        self.config.num_records_to_keep
    }

    /// Hard cap on retained old logs.
    pub fn max_num_logs_to_keep(&self) -> usize {
        self.config.max_num_logs_to_keep
    }

    fn index_handle(&self) -> Result<Arc<dyn IndexHandle>> {
        self.index
            .read()
            .clone()
            .ok_or_else(|| NaginataError::invalid_state("update log is not bound to an index"))
    }

    pub(crate) fn index(&self) -> Result<Arc<dyn IndexHandle>> {
        self.index_handle()
    }

    pub(crate) fn is_apply_buffered_cancelled(&self) -> bool {
        self.cancel_apply_buffered.load(Ordering::SeqCst)
    }

    /// Cooperatively cancel an in-flight buffered apply.
    pub fn cancel_apply_buffered_updates(&self) {
        self.cancel_apply_buffered.store(true, Ordering::SeqCst);
    }

    /// Latest recovery counters, if a recovery ran.
    pub fn recovery_info(&self) -> Option<Arc<RecoveryInfo>> {
        self.recovery_info.lock().clone()
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Record an add (full or in-place).
    ///
    /// With `clear_caches` set, the lookup maps are cleared and a new
    /// realtime searcher opened instead of indexing the new position (used
    /// when the writer changed state out-of-band).
    pub fn add(&self, cmd: AddCommand, clear_caches: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        self.add_locked(&mut inner, cmd, clear_caches)
    }

    fn add_locked(&self, inner: &mut Inner, cmd: AddCommand, clear_caches: bool) -> Result<()> {
        if cmd.flags & flags::BUFFERING != 0 {
            self.ensure_buffer_tlog_locked(inner)?;
            if let Some(buffer) = &inner.buffer_tlog {
                buffer.write_add(&cmd, -1)?;
            }
            return Ok(());
        }

        let prev_offset = self.prev_offset_for_update_locked(inner, &cmd);

        let mut offset = -1i64;
        if !self.update_from_old_tlogs(cmd.flags) {
            self.ensure_log_locked(inner)?;
            if let Some(tlog) = &inner.tlog {
                offset = tlog.write_add(&cmd, prev_offset)? as i64;
            }
        }

        if !clear_caches {
            let ptr = LogPtr::with_prev(offset, cmd.version, prev_offset);
            log::trace!("TLOG: added id {} at {ptr:?}", cmd.printable_id());
            inner.map.insert(cmd.id, ptr);
        } else {
            self.open_realtime_searcher_locked(inner);
            log::trace!("TLOG: added id {} with clear_caches=true", cmd.printable_id());
        }
        Ok(())
    }

    /// For an in-place update, the offset of the entry it depends on, found
    /// by probing the live map generations; -1 when not found (the previous
    /// update lives in the index, or the command is a full add).
    fn prev_offset_for_update_locked(&self, inner: &Inner, cmd: &AddCommand) -> i64 {
        if !cmd.is_in_place() {
            return -1;
        }
        for map in [Some(&inner.map), inner.prev_map.as_ref(), inner.prev_map2.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(entry) = map.get(&cmd.id) {
                return entry.offset;
            }
        }
        -1
    }

    fn update_from_old_tlogs(&self, cmd_flags: u32) -> bool {
        cmd_flags & flags::REPLAY != 0 && self.state() == State::Replaying
    }

    /// Record a delete by id.
    pub fn delete(&self, cmd: DeleteCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        self.delete_locked(&mut inner, cmd)
    }

    fn delete_locked(&self, inner: &mut Inner, cmd: DeleteCommand) -> Result<()> {
        if cmd.flags & flags::BUFFERING != 0 {
            self.ensure_buffer_tlog_locked(inner)?;
            if let Some(buffer) = &inner.buffer_tlog {
                buffer.write_delete(&cmd)?;
            }
            return Ok(());
        }

        let id = cmd.id.clone().ok_or_else(|| {
            NaginataError::invalid_state("delete command without an id".to_string())
        })?;

        let mut offset = -1i64;
        if !self.update_from_old_tlogs(cmd.flags) {
            self.ensure_log_locked(inner)?;
            if let Some(tlog) = &inner.tlog {
                offset = tlog.write_delete(&cmd)? as i64;
            }
        }

        let ptr = LogPtr::new(offset, cmd.version);
        log::trace!(
            "TLOG: added delete for id {} at {ptr:?}",
            String::from_utf8_lossy(&id)
        );
        inner.map.insert(id.clone(), ptr);
        inner.old_deletes().insert(id, ptr);
        Ok(())
    }

    /// Record a delete by query.
    ///
    /// Since we cannot know which documents the query hit, all lookup maps
    /// are cleared and a new realtime searcher opened, unless
    /// `IGNORE_INDEXWRITER` is set.
    pub fn delete_by_query(&self, cmd: DeleteCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        self.delete_by_query_locked(&mut inner, cmd)
    }

    fn delete_by_query_locked(&self, inner: &mut Inner, cmd: DeleteCommand) -> Result<()> {
        if cmd.flags & flags::BUFFERING != 0 {
            self.ensure_buffer_tlog_locked(inner)?;
            if let Some(buffer) = &inner.buffer_tlog {
                buffer.write_delete_by_query(&cmd)?;
            }
            return Ok(());
        }

        let query = cmd.query.clone().ok_or_else(|| {
            NaginataError::invalid_state("delete-by-query command without a query".to_string())
        })?;

        if !self.update_from_old_tlogs(cmd.flags) {
            self.ensure_log_locked(inner)?;
            if let Some(tlog) = &inner.tlog {
                tlog.write_delete_by_query(&cmd)?;
            }
        }

        if cmd.flags & flags::IGNORE_INDEXWRITER == 0 {
            self.open_realtime_searcher_locked(inner);
            self.track_delete_by_query_locked(inner, &query, cmd.version);
        }
        Ok(())
    }

    /// Open a new realtime searcher and clear the id caches.
    ///
    /// May also be called while updates are being buffered (peer sync /
    /// index fingerprinting).
    pub fn open_realtime_searcher(&self) {
        log::debug!("open_realtime_searcher");
        let mut inner = self.inner.lock();
        self.open_realtime_searcher_locked(&mut inner);
    }

    fn open_realtime_searcher_locked(&self, inner: &mut Inner) {
        // a new reader must be opened before anything looks at the caches
        // again, so a cache miss reads fresh data
        let index = match self.index_handle() {
            Ok(index) => index,
            Err(e) => {
                log::error!("error opening realtime searcher: {e}");
                return;
            }
        };
        if let Err(e) = index.open_realtime_searcher() {
            log::error!("error opening realtime searcher: {e}");
            return;
        }

        inner.map.clear();
        if let Some(prev) = inner.prev_map.as_mut() {
            prev.clear();
        }
        if let Some(prev2) = inner.prev_map2.as_mut() {
            prev2.clear();
        }
    }

    /// Track a delete-by-query in the recent-DBQ list.
    pub fn track_delete_by_query(&self, query: &str, version: i64) {
        let mut inner = self.inner.lock();
        self.track_delete_by_query_locked(&mut inner, query, version);
    }

    fn track_delete_by_query_locked(&self, inner: &mut Inner, query: &str, version: i64) {
        let version = version.abs();
        let dbqs = &mut inner.delete_by_queries;

        if dbqs.front().map(|front| front.version < version).unwrap_or(true) {
            // common non-reordered case
            dbqs.push_front(Dbq {
                query: query.to_string(),
                version,
            });
        } else {
            // reordered arrival: find the insertion point
            let mut insert_at = dbqs.len();
            for (i, old) in dbqs.iter().enumerate() {
                if old.version < version {
                    insert_at = i;
                    break;
                }
                if old.version == version && old.query == query {
                    return; // a duplicate
                }
            }
            dbqs.insert(
                insert_at,
                Dbq {
                    query: query.to_string(),
                    version,
                },
            );
        }

        if dbqs.len() > NUM_DELETES_BY_QUERY_TO_KEEP {
            dbqs.pop_back();
        }
    }

    /// Recent delete-by-query commands with a version strictly greater
    /// than `version`, newest first.
    pub fn dbq_newer_than(&self, version: i64) -> Vec<Dbq> {
        let inner = self.inner.lock();
        inner
            .delete_by_queries
            .iter()
            .take_while(|dbq| dbq.version > version)
            .cloned()
            .collect()
    }

    /// Snapshot of the recent DBQ list, newest first; for tests and
    /// peer-sync reconciliation.
    pub fn delete_by_queries(&self) -> Vec<Dbq> {
        self.inner.lock().delete_by_queries.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // commit handling
    // ------------------------------------------------------------------

    /// Rotate the lookup maps and hand the active log over for capping.
    pub fn pre_commit(&self, cmd: &CommitCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        self.pre_commit_locked(&mut inner, cmd)
    }

    fn pre_commit_locked(&self, inner: &mut Inner, cmd: &CommitCommand) -> Result<()> {
        log::debug!("TLOG: pre_commit");

        if self.state() != State::Active && cmd.flags & flags::REPLAY == 0 {
            // if we aren't active and this isn't a replay commit, don't
            // mess with the current log; commits that bypass the usual
            // processing chain can get here
            return Ok(());
        }

        // since we're changing the log, we must change the map
        self.new_map_locked(inner);

        if inner.prev_tlog.is_some() {
            // the previous commit's post_commit never ran; cap that log
            // first or it would leak
            self.post_commit_locked(inner, cmd)?;
        }
        inner.prev_tlog = inner.tlog.take();
        inner.id += 1;
        Ok(())
    }

    /// Cap the rotated log with a commit record and retire it.
    pub fn post_commit(&self, cmd: &CommitCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        self.post_commit_locked(&mut inner, cmd)
    }

    fn post_commit_locked(&self, inner: &mut Inner, cmd: &CommitCommand) -> Result<()> {
        log::debug!("TLOG: post_commit");
        if let Some(prev) = inner.prev_tlog.clone() {
            // if we made it through the commit, write a commit record to
            // the log so it is not replayed on startup
            prev.write_commit(cmd)?;
            inner.prev_tlog = None;
            self.add_old_log_locked(inner, prev, true);
        }
        Ok(())
    }

    /// Rotate the lookup maps without rotating the file.
    pub fn pre_soft_commit(&self, cmd: &CommitCommand) {
        if !cmd.soft_commit {
            return; // already handled at the start of the hard commit
        }
        let mut inner = self.inner.lock();
        // adds from here on may or may not make it into this commit, so
        // they start a fresh map; everything already added will show up in
        // the new reader once the commit succeeds
        self.new_map_locked(&mut inner);
    }

    /// Release the older map generations once the new searcher is open.
    pub fn post_soft_commit(&self, _cmd: &CommitCommand) {
        let mut inner = self.inner.lock();
        inner.prev_map = None;
        inner.prev_map2 = None;
        inner.prev_map_log = None;
        inner.prev_map_log2 = None;
    }

    fn new_map_locked(&self, inner: &mut Inner) {
        inner.prev_map2 = inner.prev_map.take();
        inner.prev_map_log2 = inner.prev_map_log.take();

        inner.prev_map = Some(std::mem::take(&mut inner.map));
        inner.prev_map_log = inner.tlog.clone();
    }

    /// Takes over ownership of the log, keeping it until no longer needed
    /// and then dropping its reference.
    fn add_old_log_locked(
        &self,
        inner: &mut Inner,
        old_log: Arc<TransactionLog>,
        remove_old: bool,
    ) {
        inner.num_old_records += old_log.num_records();

        let mut curr_records = inner.num_old_records;
        if let Some(tlog) = &inner.tlog {
            if !Arc::ptr_eq(tlog, &old_log) {
                curr_records += tlog.num_records();
            }
        }

        while remove_old && !inner.old_logs.is_empty() {
            let last = match inner.old_logs.back() {
                Some(last) => last,
                None => break,
            };
            let nrec = last.num_records();
            // remove the oldest log if it is not needed to keep at least
            // num_records_to_keep, or if the file-count cap is exceeded
            let over_cap = self.config.max_num_logs_to_keep > 0
                && inner.old_logs.len() >= self.config.max_num_logs_to_keep;
            if curr_records - nrec >= self.config.num_records_to_keep || over_cap {
                curr_records -= nrec;
                inner.num_old_records -= nrec;
                if let Some(removed) = inner.old_logs.pop_back() {
                    removed.decref(); // deleted when no longer in use
                }
                continue;
            }
            break;
        }

        // no incref: ownership transfers from the caller
        inner.old_logs.push_front(old_log);
    }

    /// Ensure the active log exists, creating the next `tlog.<id>` file.
    ///
    /// The listing captured at init can be stale; a duplicate file name is
    /// retried once against a refreshed listing.
    fn ensure_log_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.tlog.is_some() {
            return Ok(());
        }

        let mut attempts = 0;
        loop {
            let name = log_file_name(TLOG_NAME, inner.id);
            let path = self.dir.file_path(&name);
            if !path.exists() {
                inner.tlog = Some(TransactionLog::create(path, inner.id, false)?);
                return Ok(());
            }

            log::error!(
                "new transaction log already exists {} size={:?}, skipping it",
                path.display(),
                std::fs::metadata(&path).map(|m| m.len())
            );
            attempts += 1;
            if attempts >= 2 {
                return Err(NaginataError::server(
                    "cannot recover from already existing logs".to_string(),
                ));
            }
            let files = self.dir.list_files(&format!("{TLOG_NAME}."))?;
            inner.id = scan_last_log_id(&files).map(|last| last + 1).unwrap_or(0);
        }
    }

    fn ensure_buffer_tlog_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.buffer_tlog.is_some() {
            return Ok(());
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let name = format!("{BUFFER_TLOG_NAME}.{nanos}");
        inner.buffer_tlog = Some(TransactionLog::create(
            self.dir.file_path(&name),
            nanos,
            true,
        )?);
        Ok(())
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// The latest logged record for `id`, if the id is still tracked by a
    /// live map generation.
    pub fn lookup(&self, id: &[u8]) -> Result<Option<LogEntry>> {
        let (ptr, lookup_log) = {
            let inner = self.inner.lock();
            let Some((ptr, log)) = Self::find_ptr_locked(&inner, id) else {
                return Ok(None);
            };
            if ptr.offset < 0 {
                return Ok(None);
            }
            let Some(log) = log else { return Ok(None) };
            if !log.try_incref() {
                return Ok(None);
            }
            (ptr, log)
        };

        // do the read outside the monitor; holding it would stall writers
        let result = lookup_log.lookup(ptr.offset as u64);
        lookup_log.decref();
        result.map(Some)
    }

    /// The latest known version for `id`, consulting the live maps, then
    /// the index, then the recent-deletes cache.
    ///
    /// This only guarantees the latest *completed* update; stronger
    /// guarantees need coordination above the update log.
    pub fn lookup_version(&self, id: &[u8]) -> Result<Option<i64>> {
        let from_maps = {
            let inner = self.inner.lock();
            Self::find_ptr_locked(&inner, id).map(|(ptr, _)| ptr.version)
        };
        if let Some(version) = from_maps {
            return Ok(Some(version));
        }

        if let Some(version) = self.index_handle()?.version_from_index(id)? {
            return Ok(Some(version));
        }

        // deletes leave no version in the index; check the recent-deletes
        // cache before giving up
        let inner = self.inner.lock();
        Ok(inner
            .old_deletes
            .as_ref()
            .and_then(|cache| cache.get(id))
            .map(|ptr| ptr.version))
    }

    fn find_ptr_locked(
        inner: &Inner,
        id: &[u8],
    ) -> Option<(LogPtr, Option<Arc<TransactionLog>>)> {
        if let Some(ptr) = inner.map.get(id) {
            // something in `map` is always in `tlog`
            return Some((*ptr, inner.tlog.clone()));
        }
        if let Some(prev) = &inner.prev_map {
            if let Some(ptr) = prev.get(id) {
                return Some((*ptr, inner.prev_map_log.clone()));
            }
        }
        if let Some(prev2) = &inner.prev_map2 {
            if let Some(ptr) = prev2.get(id) {
                return Some((*ptr, inner.prev_map_log2.clone()));
            }
        }
        None
    }

    /// Walk an in-place update chain backwards, merging partial documents
    /// into `doc`, until a full document or the end of tracked history.
    ///
    /// Returns `0` if a full document was found (or `only_fields` was
    /// satisfied), `-1` if the chain bottoms out in the index, or the last
    /// known `prev_offset` if the chain was rotated out of the tracked
    /// logs.
    pub fn apply_partial_updates(
        &self,
        id: &[u8],
        mut prev_offset: i64,
        mut prev_version: i64,
        only_fields: Option<&std::collections::HashSet<String>>,
        doc: &mut crate::document::Document,
    ) -> Result<i64> {
        let inner = self.inner.lock();
        let lookup_logs = [
            inner.tlog.clone(),
            inner.prev_map_log.clone(),
            inner.prev_map_log2.clone(),
        ];

        while prev_offset >= 0 {
            let Some(entry) =
                Self::entry_from_logs(&lookup_logs, prev_offset as u64, prev_version)
            else {
                // the chain entry was supposed to exist but has been
                // rotated out of every tracked log
                return Ok(prev_offset);
            };

            if entry.base_op() != ADD {
                return Err(NaginataError::invalid_state(format!(
                    "entry at {prev_offset} should be an add or in-place update while looking \
                     for id={}",
                    String::from_utf8_lossy(id)
                )));
            }
            let Some(partial) = entry.doc() else {
                return Err(NaginataError::invalid_state(format!(
                    "entry at {prev_offset} is not a document while looking for id={}",
                    String::from_utf8_lossy(id)
                )));
            };

            doc.merge_missing_fields(partial, only_fields);

            if !entry.is_in_place() {
                return Ok(0); // full document found in the log
            }

            prev_offset = entry.prev_offset;
            prev_version = entry.prev_version;

            if let Some(fields) = only_fields {
                if doc.contains_all(fields) {
                    return Ok(0); // everything requested is resolved
                }
            }
        }

        // the full document is not in the logs; it must be in the index
        Ok(-1)
    }

    /// Find the entry with the given version at the given offset across the
    /// candidate logs.
    ///
    /// Two logs can carry different records at the same offset after a
    /// rotation; a version mismatch (or an unreadable frame) falls through
    /// to the next log.
    fn entry_from_logs(
        lookup_logs: &[Option<Arc<TransactionLog>>],
        offset: u64,
        version: i64,
    ) -> Option<LogEntry> {
        for lookup_log in lookup_logs.iter().flatten() {
            if lookup_log.log_size() <= offset {
                continue;
            }
            if !lookup_log.try_incref() {
                continue;
            }
            let found = match lookup_log.lookup(offset) {
                Ok(entry) if entry.version == version => Some(entry),
                Ok(_) => None,
                Err(e) => {
                    log::debug!(
                        "exception reading log {lookup_log:?} for version {version} \
                         (expected with rotated logs): {e}"
                    );
                    None
                }
            };
            lookup_log.decref();
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Snapshot the recent updates across every live log.
    pub fn recent_updates(&self) -> RecentUpdates {
        let log_list = {
            let inner = self.inner.lock();
            let mut list = Vec::with_capacity(inner.old_logs.len() + 3);
            if let Some(buffer) = &inner.buffer_tlog {
                buffer.incref();
                list.push(Arc::clone(buffer));
            }
            if let Some(tlog) = &inner.tlog {
                tlog.incref();
                list.push(Arc::clone(tlog));
            }
            if let Some(prev) = &inner.prev_tlog {
                prev.incref();
                list.push(Arc::clone(prev));
            }
            for old in &inner.old_logs {
                old.incref();
                list.push(Arc::clone(old));
            }
            list
        };
        RecentUpdates::new(log_list, self.config.num_records_to_keep)
    }

    /// Apply the flush policy to the active log.
    pub fn finish(&self, sync_level: Option<SyncLevel>) -> Result<()> {
        let sync = sync_level.unwrap_or(self.config.sync_level);
        if sync == SyncLevel::None {
            return Ok(());
        }

        let current = {
            let inner = self.inner.lock();
            match &inner.tlog {
                Some(tlog) if tlog.try_incref() => Arc::clone(tlog),
                _ => return Ok(()),
            }
        };
        let result = current.finish(sync);
        current.decref();
        result
    }

    // ------------------------------------------------------------------
    // recovery and buffering
    // ------------------------------------------------------------------

    /// Replay uncapped logs found at startup. Returns `None` when there is
    /// nothing to replay.
    pub fn recover_from_log(self: Arc<Self>) -> Option<JoinHandle<Arc<RecoveryInfo>>> {
        let recovery = Arc::new(RecoveryInfo::default());
        *self.recovery_info.lock() = Some(Arc::clone(&recovery));

        let mut recover_logs = Vec::new();
        {
            let inner = self.inner.lock();
            for candidate in &inner.newest_logs_on_startup {
                if !candidate.try_incref() {
                    continue;
                }
                match candidate.ends_with_commit() {
                    Ok(false) => recover_logs.push(Arc::clone(candidate)),
                    Ok(true) => {
                        candidate.close_output();
                        candidate.decref();
                    }
                    Err(e) => {
                        log::error!("error inspecting tlog {candidate:?}: {e}");
                        candidate.close_output();
                        candidate.decref();
                    }
                }
            }
        }
        if recover_logs.is_empty() {
            return None;
        }

        self.locks.block_updates();
        self.set_state(State::Replaying);
        {
            // these caches were populated from the very logs we are about
            // to replay
            let mut inner = self.inner.lock();
            inner.delete_by_queries.clear();
            if let Some(cache) = inner.old_deletes.as_mut() {
                cache.clear();
            }
        }
        self.locks.unblock_updates();

        // any new update from this point observes the replaying state
        Self::spawn_replayer(&self, recover_logs, false, false, recovery)
    }

    /// Replay the active log so every update reaches the index; required
    /// when a pull-style replica becomes leader.
    pub fn recover_from_current_log(self: Arc<Self>) -> Option<JoinHandle<Arc<RecoveryInfo>>> {
        let recovery = Arc::new(RecoveryInfo::default());
        let tlog = {
            let mut inner = self.inner.lock();
            let Some(tlog) = inner.tlog.clone() else {
                return None;
            };
            inner.map.clear();
            tlog.incref();
            tlog
        };
        *self.recovery_info.lock() = Some(Arc::clone(&recovery));

        self.locks.block_updates();
        self.set_state(State::Replaying);
        self.locks.unblock_updates();

        Self::spawn_replayer(&self, vec![tlog], false, true, recovery)
    }

    /// Start accumulating incoming updates in a buffer log.
    pub fn buffer_updates(&self) {
        self.locks.block_updates();
        let state = self.state();
        if state != State::Active && state != State::Buffering {
            log::warn!("unexpected state for buffer_updates: {state:?}, ignoring request");
            self.locks.unblock_updates();
            return;
        }

        {
            let mut inner = self.inner.lock();
            Self::drop_buffer_tlog_locked(&mut inner);
        }
        self.dir
            .delete_files_with_prefix(&format!("{BUFFER_TLOG_NAME}."));

        *self.recovery_info.lock() = Some(Arc::new(RecoveryInfo::default()));
        log::info!("starting to buffer updates. {self:?}");
        self.set_state(State::Buffering);
        self.locks.unblock_updates();
    }

    /// Discard buffered updates and return to ACTIVE. Returns `false` when
    /// the shard was not buffering.
    pub fn drop_buffered_updates(&self) -> bool {
        self.locks.block_updates();
        let dropped = if self.state() == State::Buffering {
            log::info!("dropping buffered updates. {self:?}");
            let mut inner = self.inner.lock();
            Self::drop_buffer_tlog_locked(&mut inner);
            self.set_state(State::Active);
            true
        } else {
            false
        };
        self.locks.unblock_updates();
        dropped
    }

    pub(crate) fn drop_buffer_tlog(&self) {
        let mut inner = self.inner.lock();
        Self::drop_buffer_tlog_locked(&mut inner);
    }

    fn drop_buffer_tlog_locked(inner: &mut Inner) {
        if let Some(buffer) = inner.buffer_tlog.take() {
            buffer.decref();
        }
    }

    /// Drain the buffer log through the live ingest path. Returns `None`
    /// when there is nothing to apply.
    pub fn apply_buffered_updates(self: Arc<Self>) -> Option<JoinHandle<Arc<RecoveryInfo>>> {
        if self.closed.load(Ordering::SeqCst) {
            log::error!("apply_buffered_updates after close");
            return None;
        }

        self.locks.block_updates();
        self.cancel_apply_buffered.store(false, Ordering::SeqCst);
        if self.state() != State::Buffering {
            self.locks.unblock_updates();
            return None;
        }

        let buffer = {
            let inner = self.inner.lock();
            match &inner.buffer_tlog {
                None => {
                    // no updates were received while buffering
                    self.set_state(State::Active);
                    self.locks.unblock_updates();
                    return None;
                }
                Some(buffer) => {
                    buffer.incref();
                    Arc::clone(buffer)
                }
            }
        };

        let recovery = Arc::new(RecoveryInfo::default());
        *self.recovery_info.lock() = Some(Arc::clone(&recovery));
        self.set_state(State::ApplyingBuffered);
        self.locks.unblock_updates();

        Self::spawn_replayer(&self, vec![buffer], true, false, recovery)
    }

    fn spawn_replayer(
        this: &Arc<Self>,
        logs: Vec<Arc<TransactionLog>>,
        active_log: bool,
        in_sorted_order: bool,
        recovery: Arc<RecoveryInfo>,
    ) -> Option<JoinHandle<Arc<RecoveryInfo>>> {
        let replayer = LogReplayer::new(
            Arc::clone(this),
            logs,
            active_log,
            in_sorted_order,
            Arc::clone(&recovery),
        );
        let ulog = Arc::clone(this);
        let drop_buffer = active_log;
        let spawned = std::thread::Builder::new()
            .name("recovery".to_string())
            .spawn(move || {
                replayer.run();
                if drop_buffer {
                    ulog.drop_buffer_tlog();
                }
                recovery
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("failed to spawn recovery thread: {e}");
                if let Some(r) = this.recovery_info.lock().as_ref() {
                    r.set_failed();
                }
                this.set_state(State::Active);
                None
            }
        }
    }

    /// Full commit flow used at the end of a replay: rotate, commit the
    /// writer, cap the rotated log.
    pub(crate) fn replay_commit(&self, cmd: &CommitCommand) -> Result<()> {
        self.pre_commit(cmd)?;
        let result = self.index_handle()?.commit(cmd);
        let post = self.post_commit(cmd);
        result?;
        post
    }

    /// End buffering without a replay: copy buffered updates newer than the
    /// commit version into the active log and return to ACTIVE. Keeps the
    /// current log so nothing can be lost on the next fetch.
    pub fn copy_over_buffering_updates(&self, cmd: &CommitCommand) -> Result<()> {
        self.locks.block_updates();
        let result = (|| {
            let mut inner = self.inner.lock();
            self.set_state(State::Active);
            let Some(buffer) = inner.buffer_tlog.clone() else {
                return Ok(());
            };
            let copy = self.copy_over_old_updates_locked(&mut inner, cmd.version, &buffer);
            Self::drop_buffer_tlog_locked(&mut inner);
            copy
        })();
        self.locks.unblock_updates();
        result
    }

    /// Rotate to a new log, copying over any updates newer than the commit
    /// version so they remain available for realtime get.
    pub fn commit_and_switch_to_new_tlog(&self, cmd: &CommitCommand) -> Result<()> {
        self.locks.block_updates();
        let result = (|| {
            let mut inner = self.inner.lock();
            if inner.tlog.is_none() {
                return Ok(());
            }
            self.pre_commit_locked(&mut inner, cmd)?;
            let copy = self.copy_over_old_updates_auto_locked(&mut inner, cmd.version);
            let post = self.post_commit_locked(&mut inner, cmd);
            copy?;
            post
        })();
        self.locks.unblock_updates();
        result
    }

    /// Copy updates newer than `commit_version` from the newest retired log
    /// into the active log.
    pub fn copy_over_old_updates(&self, commit_version: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        self.copy_over_old_updates_auto_locked(&mut inner, commit_version)
    }

    fn copy_over_old_updates_auto_locked(
        &self,
        inner: &mut Inner,
        commit_version: i64,
    ) -> Result<()> {
        let old_tlog = inner
            .prev_tlog
            .clone()
            .or_else(|| inner.old_logs.front().cloned());
        let Some(old_tlog) = old_tlog else {
            return Ok(());
        };
        if old_tlog.refcount() == 0 {
            return Ok(());
        }
        match old_tlog.ends_with_commit() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                log::warn!("exception reading log: {e}");
                return Ok(());
            }
        }
        self.copy_over_old_updates_locked(inner, commit_version, &old_tlog)
    }

    fn copy_over_old_updates_locked(
        &self,
        inner: &mut Inner,
        commit_version: i64,
        old_tlog: &Arc<TransactionLog>,
    ) -> Result<()> {
        self.metrics.mark_copy_over_old_updates();

        let mut reader = Arc::clone(old_tlog).reader(0)?;
        loop {
            let entry = match reader.next() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("unexpected log entry or corrupt log: {e}");
                    break;
                }
            };
            if entry.version.unsigned_abs() <= commit_version.unsigned_abs() {
                continue;
            }
            match entry.base_op() {
                ADD => match entry.to_add_command() {
                    Ok(cmd) => {
                        self.add_locked(inner, cmd.with_flags(flags::IGNORE_AUTOCOMMIT), false)?
                    }
                    Err(e) => log::warn!("unexpected log entry or corrupt log: {e}"),
                },
                DELETE => match entry.to_delete_command() {
                    Ok(cmd) => {
                        self.delete_locked(inner, cmd.with_flags(flags::IGNORE_AUTOCOMMIT))?
                    }
                    Err(e) => log::warn!("unexpected log entry or corrupt log: {e}"),
                },
                DELETE_BY_QUERY => match entry.to_delete_command() {
                    Ok(cmd) => self.delete_by_query_locked(
                        inner,
                        cmd.with_flags(flags::IGNORE_AUTOCOMMIT),
                    )?,
                    Err(e) => log::warn!("unexpected log entry or corrupt log: {e}"),
                },
                COMMIT => {}
                other => {
                    return Err(NaginataError::server(format!("unknown operation {other}")))
                }
            }
        }
        drop(reader);

        // the source log is going away; entries found through prev_map
        // would point into it
        if let Some(prev) = &inner.prev_tlog {
            if Arc::ptr_eq(prev, old_tlog) {
                inner.prev_map = None;
            }
        } else if inner
            .prev_map_log
            .as_ref()
            .map(|l| Arc::ptr_eq(l, old_tlog))
            .unwrap_or(false)
        {
            inner.prev_map = None;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // shutdown and test support
    // ------------------------------------------------------------------

    /// Close the update log. With `committed` set, uncapped live logs get a
    /// trailing commit so the next startup does not replay them.
    pub fn close(&self, committed: bool) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();

        // keep the files themselves; old logs may be needed for replay and
        // version lookups by the next incarnation
        let prev = inner.prev_tlog.take();
        let tlog = inner.tlog.take();
        if let Some(log) = prev {
            Self::do_close(&log, committed);
        }
        if let Some(log) = tlog {
            Self::do_close(&log, committed);
        }

        for old in inner.old_logs.drain(..) {
            old.set_delete_on_close(false);
            old.decref();
            old.force_close();
        }

        if let Some(buffer) = inner.buffer_tlog.take() {
            // an existing buffer log signals the next startup to skip the
            // peer-sync shortcut, so it must survive
            buffer.set_delete_on_close(false);
            buffer.decref();
            buffer.force_close();
        }
    }

    fn do_close(log: &Arc<TransactionLog>, write_commit: bool) {
        if write_commit {
            log::info!("recording commit on close for {log:?}");
            if let Err(e) = log.write_commit(&CommitCommand::default()) {
                log::error!("error capping {log:?} on close: {e}");
            }
        }
        log.set_delete_on_close(false);
        log.decref();
        log.force_close();
    }

    /// Clear all in-memory tracking; test support.
    pub fn delete_all(&self) {
        let mut inner = self.inner.lock();
        self.open_realtime_searcher_locked(&mut inner);
        if let Some(cache) = inner.old_deletes.as_mut() {
            cache.clear();
        }
        inner.delete_by_queries.clear();
    }

    /// Point-in-time metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = self.state();
        let inner = self.inner.lock();

        let buffered_ops = match state {
            State::Buffering => inner
                .buffer_tlog
                .as_ref()
                .map(|b| b.num_records() as u64)
                .unwrap_or(0),
            State::ApplyingBuffered => {
                let recovery = self.recovery_info.lock();
                match (&inner.tlog, recovery.as_ref()) {
                    (Some(tlog), Some(r)) => (tlog.num_records() as u64)
                        .saturating_sub(r.adds() + r.deletes() + r.delete_by_query() + r.errors()),
                    _ => 0,
                }
            }
            _ => 0,
        };

        MetricsSnapshot {
            buffered_ops,
            replay_logs_remaining: inner.old_logs.len(),
            replay_bytes_remaining: inner.old_logs.iter().map(|l| l.log_size()).sum(),
            state: state.value(),
            replay_ops: self.metrics.replay_ops(),
            applying_buffered_ops: self.metrics.applying_buffered_ops(),
            copy_over_old_updates_ops: self.metrics.copy_over_old_updates_ops(),
            start_time: self.metrics.start_time(),
        }
    }

    /// Total size in bytes across retired logs.
    pub fn total_logs_size(&self) -> u64 {
        self.inner.lock().old_logs.iter().map(|l| l.log_size()).sum()
    }

    /// Number of retired logs.
    pub fn total_logs_number(&self) -> usize {
        self.inner.lock().old_logs.len()
    }
}

fn parse_log_id(name: &str) -> Option<u64> {
    name.rsplit('.').next()?.parse().ok()
}

fn scan_last_log_id(files: &[String]) -> Option<u64> {
    files.last().and_then(|name| parse_log_id(name))
}

//! Log replay.
//!
//! A [`LogReplayer`] drains one or more transaction logs through the normal
//! ingest path, flagged as replay. Commands for the same id are serialized
//! on a hash-partitioned worker pool; commands for different ids run in
//! parallel. Delete-by-query waits for quiescence and runs inline. Each
//! worker owns its own update processor, since processors are not
//! thread-safe.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{NaginataError, Result};
use crate::index::{IndexHandle, UpdateProcessor};
use crate::update::command::{flags, CommitCommand, ADD, COMMIT, DELETE, DELETE_BY_QUERY};
use crate::update::log_file::{LogEntry, LogReader, SortedReader, TransactionLog};
use crate::update::update_log::UpdateLog;
use crate::update::{RecoveryInfo, State};

fn replay_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 8)
}

enum ReplayReader {
    Forward(LogReader),
    Sorted(SortedReader),
}

impl ReplayReader {
    fn next(&mut self) -> Result<Option<LogEntry>> {
        match self {
            ReplayReader::Forward(r) => r.next(),
            ReplayReader::Sorted(r) => r.next(),
        }
    }
}

/// Replays a list of logs on its own thread.
pub(crate) struct LogReplayer {
    ulog: Arc<UpdateLog>,
    logs: VecDeque<Arc<TransactionLog>>,
    active_log: bool,
    in_sorted_order: bool,
    recovery: Arc<RecoveryInfo>,
}

impl LogReplayer {
    pub(crate) fn new(
        ulog: Arc<UpdateLog>,
        logs: Vec<Arc<TransactionLog>>,
        active_log: bool,
        in_sorted_order: bool,
        recovery: Arc<RecoveryInfo>,
    ) -> Self {
        LogReplayer {
            ulog,
            logs: logs.into(),
            active_log,
            in_sorted_order,
            recovery,
        }
    }

    pub(crate) fn run(mut self) {
        let mut finishing = false;

        let result = loop {
            let Some(translog) = self.logs.pop_front() else {
                break Ok(());
            };
            let outcome = self.do_replay(&translog, &mut finishing);
            translog.decref();
            if let Err(e) = outcome {
                break Err(e);
            }
        };

        if let Err(e) = result {
            if e.is_service_unavailable() {
                log::error!("replay failed, service unavailable: {e}");
                self.recovery.set_failed();
            } else {
                self.recovery.incr_errors();
                log::error!("replay failed: {e}");
            }
        }

        // change the state while updates are still blocked to prevent races
        self.ulog.set_state(State::Active);
        if finishing {
            self.ulog.locks().unblock_updates();
        }

        // clean up any logs we never got to
        for translog in &self.logs {
            log::error!("did not recover from tlog {translog:?}");
            translog.decref();
        }

        log::warn!("log replay finished. {}", self.recovery);
    }

    fn do_replay(&self, translog: &Arc<TransactionLog>, finishing: &mut bool) -> Result<()> {
        log::warn!(
            "starting log replay {translog:?} active={} starting pos={} sorted={}",
            self.active_log,
            self.recovery.position_of_start(),
            self.in_sorted_order
        );

        let start = self.recovery.position_of_start();
        let mut reader = if self.in_sorted_order {
            ReplayReader::Sorted(Arc::clone(translog).sorted_reader(start)?)
        } else {
            ReplayReader::Forward(Arc::clone(translog).reader(start)?)
        };

        let index = self.ulog.index()?;
        let mut executor = if self.in_sorted_order {
            None
        } else {
            Some(OrderedExecutor::new(
                replay_workers(),
                Arc::clone(&index),
                Arc::clone(&self.recovery),
            )?)
        };
        let mut dispatch_parallel = executor.is_some();
        let mut inline_proc: Option<Box<dyn UpdateProcessor>> = None;
        let mut commit_version = 0i64;

        loop {
            if self.ulog.is_apply_buffered_cancelled() {
                break;
            }

            let mut entry = self.read_next(&mut reader);
            if entry.is_none() && self.active_log && !*finishing {
                // about to lock out all updates, including tasks still in
                // the executor, so wait for them first
                if let Some(ex) = &executor {
                    ex.wait_quiescent();
                }
                dispatch_parallel = false;
                self.ulog.locks().block_updates();
                *finishing = true;
                entry = self.read_next(&mut reader);
            }
            let Some(entry) = entry else { break };

            if let Some(ex) = &executor {
                if let Some(e) = ex.take_latched() {
                    return Err(e);
                }
            }

            let parallel = if dispatch_parallel {
                executor.as_ref()
            } else {
                None
            };
            match self.apply_entry(&entry, &index, parallel, &mut inline_proc, &mut commit_version)
            {
                Ok(()) => match self.ulog.state() {
                    State::Replaying => self.ulog.metrics().mark_replay_op(),
                    State::ApplyingBuffered => self.ulog.metrics().mark_applying_buffered_op(),
                    _ => {}
                },
                Err(e) if e.is_service_unavailable() => return Err(e),
                Err(e) => {
                    self.recovery.incr_errors();
                    log::warn!("REPLAY_ERR: exception replaying log: {e}");
                }
            }
        }

        if let Some(ex) = &executor {
            ex.wait_quiescent();
            if let Some(e) = ex.take_latched() {
                return Err(e);
            }
        }

        // commit through the normal commit flow so an incomplete log gets a
        // trailing commit and is not replayed again after a restart
        let commit_cmd = CommitCommand {
            version: commit_version,
            soft_commit: false,
            wait_searcher: true,
            flags: flags::REPLAY,
        };
        if let Err(e) = self.ulog.replay_commit(&commit_cmd) {
            self.recovery.incr_errors();
            log::error!("replay exception: final commit: {e}");
        }

        if !self.active_log && !translog.ends_with_commit().unwrap_or(false) {
            if let Err(e) = translog.write_commit(&commit_cmd) {
                self.recovery.incr_errors();
                log::error!("replay exception: capping replayed log: {e}");
            }
        }

        if let Some(ex) = executor.take() {
            ex.finish_all();
        }
        if let Some(mut proc) = inline_proc.take() {
            if let Err(e) = proc.finish() {
                self.recovery.incr_errors();
                log::error!("replay exception: finish: {e}");
            }
        }
        Ok(())
    }

    fn read_next(&self, reader: &mut ReplayReader) -> Option<LogEntry> {
        match reader.next() {
            Ok(entry) => entry,
            Err(e) => {
                self.recovery.incr_errors();
                log::warn!("REPLAY_ERR: exception reading log: {e}");
                None
            }
        }
    }

    fn apply_entry(
        &self,
        entry: &LogEntry,
        index: &Arc<dyn IndexHandle>,
        executor: Option<&OrderedExecutor>,
        inline_proc: &mut Option<Box<dyn UpdateProcessor>>,
        commit_version: &mut i64,
    ) -> Result<()> {
        match entry.base_op() {
            ADD => {
                self.recovery.incr_adds();
                let cmd = entry
                    .to_add_command()?
                    .with_flags(flags::REPLAY | flags::IGNORE_AUTOCOMMIT);
                match executor {
                    Some(ex) => {
                        let ulog = Arc::clone(&self.ulog);
                        let key = cmd.id.clone();
                        ex.execute(
                            &key,
                            Box::new(move |proc| {
                                proc.process_add(&cmd)?;
                                ulog.add(cmd, false)
                            }),
                        );
                        Ok(())
                    }
                    None => {
                        let proc = ensure_proc(inline_proc, index)?;
                        proc.process_add(&cmd)?;
                        self.ulog.add(cmd, false)
                    }
                }
            }
            DELETE => {
                self.recovery.incr_deletes();
                let cmd = entry
                    .to_delete_command()?
                    .with_flags(flags::REPLAY | flags::IGNORE_AUTOCOMMIT);
                match executor {
                    Some(ex) => {
                        let ulog = Arc::clone(&self.ulog);
                        let key = cmd.id.clone().unwrap_or_default();
                        ex.execute(
                            &key,
                            Box::new(move |proc| {
                                proc.process_delete(&cmd)?;
                                ulog.delete(cmd)
                            }),
                        );
                        Ok(())
                    }
                    None => {
                        let proc = ensure_proc(inline_proc, index)?;
                        proc.process_delete(&cmd)?;
                        self.ulog.delete(cmd)
                    }
                }
            }
            DELETE_BY_QUERY => {
                self.recovery.incr_delete_by_query();
                let cmd = entry
                    .to_delete_command()?
                    .with_flags(flags::REPLAY | flags::IGNORE_AUTOCOMMIT);
                // DBQ runs inline, behind every pending add
                if let Some(ex) = executor {
                    ex.wait_quiescent();
                }
                let proc = ensure_proc(inline_proc, index)?;
                proc.process_delete(&cmd)?;
                self.ulog.delete_by_query(cmd)
            }
            COMMIT => {
                *commit_version = entry.version;
                Ok(())
            }
            other => Err(NaginataError::server(format!("unknown operation {other}"))),
        }
    }
}

fn ensure_proc<'a>(
    slot: &'a mut Option<Box<dyn UpdateProcessor>>,
    index: &Arc<dyn IndexHandle>,
) -> Result<&'a mut Box<dyn UpdateProcessor>> {
    if slot.is_none() {
        *slot = Some(index.create_processor()?);
    }
    slot.as_mut()
        .ok_or_else(|| NaginataError::server("replay processor unavailable".to_string()))
}

type Task = Box<dyn FnOnce(&mut dyn UpdateProcessor) -> Result<()> + Send>;

enum Job {
    Task(Task),
    Finish,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Pending {
    fn inc(&self) {
        *self.count.lock() += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// Hash-partitioned worker pool: tasks with the same key run serially on
/// the same worker, tasks with different keys run in parallel.
pub(crate) struct OrderedExecutor {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
    latched: Arc<Mutex<Option<NaginataError>>>,
    hasher: ahash::RandomState,
}

impl OrderedExecutor {
    fn new(
        workers: usize,
        index: Arc<dyn IndexHandle>,
        recovery: Arc<RecoveryInfo>,
    ) -> Result<Self> {
        let pending = Arc::new(Pending::default());
        let latched: Arc<Mutex<Option<NaginataError>>> = Arc::new(Mutex::new(None));
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for i in 0..workers {
            let (tx, rx) = channel::<Job>();
            let index = Arc::clone(&index);
            let recovery = Arc::clone(&recovery);
            let pending = Arc::clone(&pending);
            let latched = Arc::clone(&latched);

            let handle = std::thread::Builder::new()
                .name(format!("replay-worker-{i}"))
                .spawn(move || {
                    let mut proc: Option<Box<dyn UpdateProcessor>> = None;
                    for job in rx {
                        match job {
                            Job::Task(task) => {
                                if latched.lock().is_none() {
                                    let result = run_task(task, &mut proc, &index);
                                    match result {
                                        Ok(()) => {}
                                        Err(e) if e.is_service_unavailable() => {
                                            let mut slot = latched.lock();
                                            if slot.is_none() {
                                                *slot = Some(e);
                                            }
                                        }
                                        Err(e) => {
                                            recovery.incr_errors();
                                            log::warn!(
                                                "REPLAY_ERR: exception replaying log: {e}"
                                            );
                                        }
                                    }
                                }
                                pending.dec();
                            }
                            Job::Finish => {
                                if let Some(p) = proc.as_mut() {
                                    if let Err(e) = p.finish() {
                                        recovery.incr_errors();
                                        log::error!("replay exception: finish: {e}");
                                    }
                                }
                                break;
                            }
                        }
                    }
                })
                .map_err(|e| NaginataError::server(format!("failed to spawn replay worker: {e}")))?;

            senders.push(tx);
            handles.push(handle);
        }

        Ok(OrderedExecutor {
            senders,
            handles,
            pending,
            latched,
            hasher: ahash::RandomState::new(),
        })
    }

    /// Dispatch a task; tasks sharing `key` keep their submission order.
    fn execute(&self, key: &[u8], task: Task) {
        let idx = (self.hasher.hash_one(key) as usize) % self.senders.len();
        self.pending.inc();
        if self.senders[idx].send(Job::Task(task)).is_err() {
            self.pending.dec();
            log::error!("replay worker {idx} is gone; task dropped");
        }
    }

    /// Wait until no dispatched task is pending or running.
    fn wait_quiescent(&self) {
        self.pending.wait_zero();
    }

    /// Take the latched service-unavailable error, if a worker hit one.
    fn take_latched(&self) -> Option<NaginataError> {
        self.latched.lock().take()
    }

    /// Finish every worker's processor and join the threads.
    fn finish_all(mut self) {
        for sender in &self.senders {
            let _ = sender.send(Job::Finish);
        }
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_task(
    task: Task,
    proc: &mut Option<Box<dyn UpdateProcessor>>,
    index: &Arc<dyn IndexHandle>,
) -> Result<()> {
    if proc.is_none() {
        *proc = Some(index.create_processor()?);
    }
    let p = proc
        .as_mut()
        .ok_or_else(|| NaginataError::server("replay processor unavailable".to_string()))?;
    task(p.as_mut())
}

//! End-to-end scenarios for the update log: realtime get, commit rotation,
//! in-place chains, crash replay, buffering, and delete-by-query.

use std::sync::Arc;

use tempfile::TempDir;

use naginata::document::Document;
use naginata::index::{IndexHandle, MemoryIndex};
use naginata::update::command::{flags, AddCommand, CommitCommand, DeleteCommand};
use naginata::update::{State, UpdateLog, UpdateLogConfig};

fn setup() -> (TempDir, Arc<UpdateLog>, Arc<MemoryIndex>) {
    setup_with_config(UpdateLogConfig::default())
}

fn setup_with_config(config: UpdateLogConfig) -> (TempDir, Arc<UpdateLog>, Arc<MemoryIndex>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(MemoryIndex::new());
    let ulog = Arc::new(UpdateLog::new(tmp.path(), config).unwrap());
    ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();
    (tmp, ulog, index)
}

/// Reopen an update log over an existing directory.
fn reopen(tmp: &TempDir) -> (Arc<UpdateLog>, Arc<MemoryIndex>) {
    let index = Arc::new(MemoryIndex::new());
    let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
    ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();
    (ulog, index)
}

/// The normal ingest path: apply to the index writer, then record in the
/// update log.
fn ingest_add(ulog: &UpdateLog, index: &MemoryIndex, id: &[u8], version: i64, doc: Document) {
    let cmd = AddCommand::new(id.to_vec(), doc, version);
    index.apply_add(&cmd);
    ulog.add(cmd, false).unwrap();
}

fn ingest_add_in_place(
    ulog: &UpdateLog,
    index: &MemoryIndex,
    id: &[u8],
    version: i64,
    prev_version: i64,
    doc: Document,
) {
    let cmd = AddCommand::in_place(id.to_vec(), doc, version, prev_version);
    index.apply_add(&cmd);
    ulog.add(cmd, false).unwrap();
}

fn ingest_delete_by_query(ulog: &UpdateLog, index: &MemoryIndex, query: &str, version: i64) {
    index.apply_delete_by_query(query);
    ulog.delete_by_query(DeleteCommand::by_query(query, version))
        .unwrap();
}

fn doc(pairs: &[(&str, i64)]) -> Document {
    let mut builder = Document::builder();
    for (name, value) in pairs {
        builder = builder.add_integer(*name, *value);
    }
    builder.build()
}

#[test]
fn test_basic_realtime_get() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1)]));

    assert_eq!(ulog.lookup_version(b"a").unwrap(), Some(10));
    let entry = ulog.lookup(b"a").unwrap().unwrap();
    assert_eq!(entry.version, 10);
    let found = entry.doc().unwrap();
    assert_eq!(found.get_field("x").unwrap().as_integer(), Some(1));

    ulog.close(true);
}

#[test]
fn test_commit_rotation_keeps_lookup_working() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1)]));

    let cmd = CommitCommand::hard(10);
    ulog.pre_commit(&cmd).unwrap();

    // between pre- and post-commit, the previous generation still answers
    let entry = ulog.lookup(b"a").unwrap().unwrap();
    assert_eq!(entry.doc().unwrap().get_field("x").unwrap().as_integer(), Some(1));

    index.commit(&cmd).unwrap();
    ulog.post_commit(&cmd).unwrap();

    ingest_add(&ulog, &index, b"a", 11, doc(&[("x", 2)]));
    let entry = ulog.lookup(b"a").unwrap().unwrap();
    assert_eq!(entry.version, 11);
    assert_eq!(entry.doc().unwrap().get_field("x").unwrap().as_integer(), Some(2));

    ulog.close(true);
}

#[test]
fn test_in_place_chain_resolves_to_merged_document() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1), ("y", 1)]));
    ingest_add_in_place(&ulog, &index, b"a", 11, 10, doc(&[("y", 2)]));
    ingest_add_in_place(&ulog, &index, b"a", 12, 11, doc(&[("y", 3)]));

    let latest = ulog.lookup(b"a").unwrap().unwrap();
    assert!(latest.is_in_place());
    assert_eq!(latest.version, 12);

    let mut resolved = latest.doc().unwrap().clone();
    let ret = ulog
        .apply_partial_updates(b"a", latest.prev_offset, latest.prev_version, None, &mut resolved)
        .unwrap();

    assert_eq!(ret, 0);
    assert_eq!(resolved.get_field("x").unwrap().as_integer(), Some(1));
    assert_eq!(resolved.get_field("y").unwrap().as_integer(), Some(3));

    ulog.close(true);
}

#[test]
fn test_partial_update_short_circuits_on_requested_fields() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1), ("y", 1)]));
    ingest_add_in_place(&ulog, &index, b"a", 11, 10, doc(&[("y", 2)]));

    let latest = ulog.lookup(b"a").unwrap().unwrap();
    let mut resolved = latest.doc().unwrap().clone();
    let only: std::collections::HashSet<String> = ["y".to_string()].into_iter().collect();
    let ret = ulog
        .apply_partial_updates(
            b"a",
            latest.prev_offset,
            latest.prev_version,
            Some(&only),
            &mut resolved,
        )
        .unwrap();

    assert_eq!(ret, 0);
    assert_eq!(resolved.get_field("y").unwrap().as_integer(), Some(2));
    // x was not requested, so the resolver could stop before fetching it
    assert!(!resolved.has_field("x"));

    ulog.close(true);
}

#[test]
fn test_replay_after_crash() {
    let tmp = TempDir::new().unwrap();
    let _ = env_logger::builder().is_test(true).try_init();

    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();

        ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1)]));
        ingest_add(&ulog, &index, b"b", 11, doc(&[("x", 2)]));

        // unclean shutdown: no commit record written
        ulog.close(false);
    }

    let (ulog, index) = reopen(&tmp);
    let handle = Arc::clone(&ulog).recover_from_log().expect("uncapped log should replay");
    let recovery = handle.join().unwrap();

    assert_eq!(recovery.adds(), 2);
    assert_eq!(recovery.errors(), 0);
    assert!(!recovery.failed());
    assert_eq!(ulog.state(), State::Active);

    // the replay reached the index through the processors
    let searcher = index.searcher();
    assert_eq!(searcher.num_docs(), 2);
    assert_eq!(searcher.version(b"a"), Some(10));
    assert_eq!(searcher.version(b"b"), Some(11));

    drop(ulog);

    // the replayed log was capped, so the next startup has nothing to do
    let (ulog, _index) = reopen(&tmp);
    assert!(Arc::clone(&ulog).recover_from_log().is_none());
    ulog.close(true);
}

#[test]
fn test_buffering_window_and_apply() {
    let (_tmp, ulog, index) = setup();

    ulog.buffer_updates();
    assert_eq!(ulog.state(), State::Buffering);

    // buffered updates bypass the index and the lookup maps entirely
    ulog.add(
        AddCommand::new(b"a".to_vec(), doc(&[("x", 1)]), 20).with_flags(flags::BUFFERING),
        false,
    )
    .unwrap();
    ulog.add(
        AddCommand::new(b"b".to_vec(), doc(&[("x", 2)]), 21).with_flags(flags::BUFFERING),
        false,
    )
    .unwrap();

    assert_eq!(ulog.lookup_version(b"a").unwrap(), None);
    assert_eq!(ulog.lookup_version(b"b").unwrap(), None);
    assert_eq!(ulog.metrics_snapshot().buffered_ops, 2);

    let handle = Arc::clone(&ulog).apply_buffered_updates().expect("buffer should apply");
    let recovery = handle.join().unwrap();

    assert_eq!(recovery.adds(), 2);
    assert!(!recovery.failed());
    assert_eq!(ulog.state(), State::Active);

    assert_eq!(ulog.lookup_version(b"a").unwrap(), Some(20));
    assert_eq!(ulog.lookup_version(b"b").unwrap(), Some(21));
    let searcher = index.searcher();
    assert_eq!(searcher.version(b"a"), Some(20));
    assert_eq!(searcher.version(b"b"), Some(21));

    ulog.close(true);
}

#[test]
fn test_drop_buffered_updates() {
    let (_tmp, ulog, _index) = setup();

    ulog.buffer_updates();
    ulog.add(
        AddCommand::new(b"a".to_vec(), doc(&[("x", 1)]), 20).with_flags(flags::BUFFERING),
        false,
    )
    .unwrap();

    assert!(ulog.drop_buffered_updates());
    assert_eq!(ulog.state(), State::Active);
    assert_eq!(ulog.lookup_version(b"a").unwrap(), None);

    // not buffering anymore, so a second drop reports false
    assert!(!ulog.drop_buffered_updates());

    ulog.close(true);
}

#[test]
fn test_delete_by_query_purges_caches_but_keeps_history() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1)]));
    index.open_realtime_searcher().unwrap();

    ingest_delete_by_query(&ulog, &index, "*:*", -11);

    // the id caches were purged: nothing can claim "a" still exists
    assert!(ulog.lookup(b"a").unwrap().is_none());

    // but the log still holds the version-10 add for peer sync
    let recent = ulog.recent_updates();
    let entry = recent.lookup(10).unwrap().unwrap();
    assert_eq!(entry.version, 10);
    assert_eq!(entry.indexed_id(), Some(b"a".as_slice()));
    drop(recent);

    // a realtime searcher opened after the DBQ sees no documents
    let searcher = index.searcher();
    assert_eq!(searcher.num_docs(), 0);

    let dbqs = ulog.delete_by_queries();
    assert_eq!(dbqs.len(), 1);
    assert_eq!(dbqs[0].query, "*:*");
    assert_eq!(dbqs[0].version, 11);

    ulog.close(true);
}

#[test]
fn test_soft_commit_rotates_maps_without_rotating_file() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1)]));

    let soft = CommitCommand::soft();
    ulog.pre_soft_commit(&soft);

    // still answered by the prev generation
    assert_eq!(ulog.lookup_version(b"a").unwrap(), Some(10));
    // the log file did not rotate
    assert!(ulog.has_uncommitted_changes());

    index.open_realtime_searcher().unwrap();
    ulog.post_soft_commit(&soft);

    // maps are gone, the index answers now
    assert_eq!(ulog.lookup_version(b"a").unwrap(), Some(10));

    ulog.close(true);
}

#[test]
fn test_delete_version_survives_map_clear_via_old_deletes() {
    let (_tmp, ulog, index) = setup();

    ingest_add(&ulog, &index, b"a", 10, doc(&[("x", 1)]));
    index.apply_delete(b"a");
    ulog.delete(DeleteCommand::by_id(b"a".to_vec(), -12)).unwrap();

    // rotate the delete out of every live map generation
    let soft = CommitCommand::soft();
    ulog.pre_soft_commit(&soft);
    ulog.post_soft_commit(&soft);
    index.open_realtime_searcher().unwrap();

    // the index has no version for a deleted doc; the recent-deletes cache
    // is the only evidence left
    assert_eq!(ulog.lookup_version(b"a").unwrap(), Some(-12));
    assert_eq!(ulog.lookup_version(b"never-seen").unwrap(), None);

    ulog.close(true);
}

#[test]
fn test_buffer_log_presence_detected_on_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index as Arc<dyn IndexHandle>).unwrap();

        ulog.buffer_updates();
        ulog.add(
            AddCommand::new(b"a".to_vec(), doc(&[("x", 1)]), 20).with_flags(flags::BUFFERING),
            false,
        )
        .unwrap();

        // crash while buffering: the buffer log stays on disk
        ulog.close(false);
    }

    let (ulog, _index) = reopen(&tmp);
    assert!(ulog.exist_old_buffer_log());
    ulog.close(true);
}

#[test]
fn test_copy_over_buffering_updates_keeps_newer_versions() {
    let (_tmp, ulog, index) = setup();

    ulog.buffer_updates();
    ulog.add(
        AddCommand::new(b"old".to_vec(), doc(&[("x", 1)]), 5).with_flags(flags::BUFFERING),
        false,
    )
    .unwrap();
    ulog.add(
        AddCommand::new(b"new".to_vec(), doc(&[("x", 2)]), 30).with_flags(flags::BUFFERING),
        false,
    )
    .unwrap();

    // everything up to version 10 is already covered by the snapshot we
    // recovered from; only newer buffered updates are copied over
    ulog.copy_over_buffering_updates(&CommitCommand::hard(10))
        .unwrap();

    assert_eq!(ulog.state(), State::Active);
    assert_eq!(ulog.lookup_version(b"new").unwrap(), Some(30));
    assert_eq!(ulog.lookup_version(b"old").unwrap(), None);
    assert_eq!(ulog.metrics_snapshot().state, State::Active.value());
    assert!(index.searcher().doc(b"new").is_none()); // log only, not indexed

    ulog.close(true);
}

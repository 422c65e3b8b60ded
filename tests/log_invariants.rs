//! Invariant checks over command sequences: retention bounds, ordering
//! guarantees, idempotent replay, and cache bounds.

use std::sync::Arc;

use tempfile::TempDir;

use naginata::document::Document;
use naginata::index::{IndexHandle, MemoryIndex};
use naginata::update::command::{AddCommand, CommitCommand, DeleteCommand};
use naginata::update::{UpdateLog, UpdateLogConfig};

fn setup_with_config(config: UpdateLogConfig) -> (TempDir, Arc<UpdateLog>, Arc<MemoryIndex>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(MemoryIndex::new());
    let ulog = Arc::new(UpdateLog::new(tmp.path(), config).unwrap());
    ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();
    (tmp, ulog, index)
}

fn int_doc(value: i64) -> Document {
    Document::builder().add_integer("v", value).build()
}

fn ingest_add(ulog: &UpdateLog, index: &MemoryIndex, id: &[u8], version: i64) {
    let cmd = AddCommand::new(id.to_vec(), int_doc(version), version);
    index.apply_add(&cmd);
    ulog.add(cmd, false).unwrap();
}

fn hard_commit(ulog: &UpdateLog, index: &MemoryIndex, version: i64) {
    let cmd = CommitCommand::hard(version);
    ulog.pre_commit(&cmd).unwrap();
    index.commit(&cmd).unwrap();
    ulog.post_commit(&cmd).unwrap();
}

#[test]
fn test_retention_bounds_hold_across_commits() {
    let config = UpdateLogConfig {
        num_records_to_keep: 5,
        max_num_logs_to_keep: 3,
        ..Default::default()
    };
    let (_tmp, ulog, index) = setup_with_config(config);

    let mut version = 0;
    for _round in 0..12 {
        for _ in 0..2 {
            version += 1;
            ingest_add(&ulog, &index, format!("id{version}").as_bytes(), version);
        }
        hard_commit(&ulog, &index, version);

        // hard cap on retired log files
        assert!(ulog.total_logs_number() <= 3);
    }

    // enough history is retained to answer for recent versions (commit
    // records also count toward the scan limit, so fewer than 5 come back)
    let recent = ulog.recent_updates();
    let versions = recent.get_versions(5);
    assert!(versions.len() >= 3);
    assert_eq!(versions[0], version);
    assert!(versions.contains(&(version - 1)));
    drop(recent);

    ulog.close(true);
}

#[test]
fn test_version_lookup_is_monotone_for_an_id() {
    let (_tmp, ulog, index) = setup_with_config(UpdateLogConfig::default());

    let mut last = 0;
    for version in [3i64, 7, 9, 15, 40] {
        ingest_add(&ulog, &index, b"doc", version);
        let seen = ulog.lookup_version(b"doc").unwrap().unwrap();
        assert!(seen >= last);
        assert_eq!(seen, version);
        last = seen;
    }

    ulog.close(true);
}

#[test]
fn test_dbq_list_is_descending_deduplicated_and_bounded() {
    let (_tmp, ulog, _index) = setup_with_config(UpdateLogConfig::default());

    // reordered arrivals, duplicates included
    for version in [5i64, 3, 9, 7, 9, 1, 8] {
        ulog.track_delete_by_query("q", version);
    }
    ulog.track_delete_by_query("other", 9);

    let dbqs = ulog.delete_by_queries();
    for pair in dbqs.windows(2) {
        assert!(pair[0].version >= pair[1].version);
    }
    // duplicate (9, "q") was dropped, (9, "other") kept
    assert_eq!(dbqs.iter().filter(|d| d.version == 9).count(), 2);
    assert_eq!(
        dbqs.iter()
            .filter(|d| d.version == 9 && d.query == "q")
            .count(),
        1
    );

    // bounded at 100 entries
    for version in 100..300 {
        ulog.track_delete_by_query("bulk", version);
    }
    let dbqs = ulog.delete_by_queries();
    assert_eq!(dbqs.len(), 100);
    assert_eq!(dbqs[0].version, 299);

    // newer-than filtering honors the descending order
    let newer = ulog.dbq_newer_than(297);
    assert_eq!(newer.len(), 2);

    ulog.close(true);
}

#[test]
fn test_replaying_twice_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let _ = env_logger::builder().is_test(true).try_init();

    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();

        ingest_add(&ulog, &index, b"a", 10);
        index.apply_delete(b"b");
        ulog.delete(DeleteCommand::by_id(b"b".to_vec(), -11)).unwrap();
        ingest_add(&ulog, &index, b"c", 12);

        ulog.close(false); // crash: no trailing commit
    }

    // first restart replays
    let first_state;
    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();

        let recovery = Arc::clone(&ulog).recover_from_log().unwrap().join().unwrap();
        assert_eq!(recovery.adds(), 2);
        assert_eq!(recovery.deletes(), 1);
        assert!(!recovery.failed());

        let searcher = index.searcher();
        first_state = (
            searcher.num_docs(),
            searcher.version(b"a"),
            searcher.version(b"c"),
        );
        drop(ulog);
    }

    // second restart finds the trailing commit and replays nothing
    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();

        assert!(Arc::clone(&ulog).recover_from_log().is_none());

        // replaying the already-capped history would have produced exactly
        // the same index state; nothing ran, so the index is untouched
        assert_eq!(index.searcher().num_docs(), 0);
        assert_eq!(first_state.0, 2);
        assert_eq!(first_state.1, Some(10));
        assert_eq!(first_state.2, Some(12));
        ulog.close(true);
    }
}

#[test]
fn test_recent_updates_summarize_and_lookup_by_version() {
    let (_tmp, ulog, index) = setup_with_config(UpdateLogConfig::default());

    for version in 1..=6 {
        ingest_add(&ulog, &index, format!("id{version}").as_bytes(), version);
    }
    index.apply_delete(b"id1");
    ulog.delete(DeleteCommand::by_id(b"id1".to_vec(), -7)).unwrap();
    ulog.delete_by_query(DeleteCommand::by_query("v:3", -8)).unwrap();

    let recent = ulog.recent_updates();

    let versions = recent.get_versions(4);
    assert_eq!(versions, vec![-8, -7, 6, 5]);

    let capped = recent.get_versions_capped(10, 5);
    assert!(capped.iter().all(|v| v.unsigned_abs() <= 5));

    let entry = recent.lookup(4).unwrap().unwrap();
    assert_eq!(entry.indexed_id(), Some(b"id4".as_slice()));

    assert_eq!(recent.delete_list.len(), 1);
    assert_eq!(recent.delete_list[0].id, b"id1".to_vec());

    let mut seen = std::collections::HashSet::new();
    let dbqs = recent.get_delete_by_query(5, &mut seen).unwrap();
    assert_eq!(dbqs.len(), 1);
    assert_eq!(dbqs[0].query(), Some("v:3"));

    assert_eq!(recent.max_recent_version(), 8);

    drop(recent);
    ulog.close(true);
}

#[test]
fn test_close_releases_directory_ownership() {
    let tmp = TempDir::new().unwrap();
    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();
        ingest_add(&ulog, &index, b"a", 1);
        ulog.close(true);
    }

    // a fresh update log can take over the same directory, and the capped
    // log needs no replay
    let index = Arc::new(MemoryIndex::new());
    let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
    ulog.init(index as Arc<dyn IndexHandle>).unwrap();
    assert!(Arc::clone(&ulog).recover_from_log().is_none());
    ulog.close(true);
}

#[test]
fn test_non_persistent_index_clears_logs_on_init() {
    let tmp = TempDir::new().unwrap();
    {
        let index = Arc::new(MemoryIndex::new());
        let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
        ulog.init(index.clone() as Arc<dyn IndexHandle>).unwrap();
        ingest_add(&ulog, &index, b"a", 1);
        ulog.close(false);
    }

    let index = Arc::new(MemoryIndex::new());
    index.set_persistent(false);
    let ulog = Arc::new(UpdateLog::new(tmp.path(), UpdateLogConfig::default()).unwrap());
    ulog.init(index as Arc<dyn IndexHandle>).unwrap();

    // a non-persistent index cannot match on-disk logs; they were cleared
    assert!(Arc::clone(&ulog).recover_from_log().is_none());
    assert!(ulog.recent_updates().get_versions(10).is_empty());
    ulog.close(true);
}

#[test]
fn test_update_lock_timeout_surfaces_service_unavailable() {
    let config = UpdateLogConfig {
        doc_lock_timeout_ms: 10,
        ..Default::default()
    };
    let (_tmp, ulog, _index) = setup_with_config(config);

    ulog.locks().block_updates();
    let err = ulog.locks().lock_for_update();
    assert!(err.is_err());
    assert!(err.err().unwrap().is_service_unavailable());
    ulog.locks().unblock_updates();

    let guard = ulog.locks().lock_for_update();
    assert!(guard.is_ok());
    drop(guard);

    ulog.close(true);
}

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use uplift_core::VersionId;

use super::*;

#[test]
fn file_store_starts_empty_when_state_missing() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let store = FileStateStore::open(&layout).expect("must open store");
    assert_eq!(store.state(), &InstanceState::default());
    assert!(!store.path().exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn file_store_commit_persists_and_bumps_serial() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut store = FileStateStore::open(&layout).expect("must open store");
    store.state_mut().version = Some(VersionId::new("2.0"));
    store.state_mut().needs_reindex = true;
    store.commit().expect("must commit");

    let reopened = FileStateStore::open(&layout).expect("must reopen store");
    assert_eq!(reopened.state().version, Some(VersionId::new("2.0")));
    assert!(reopened.state().needs_reindex);
    assert_eq!(reopened.state().serial, 1);

    store.commit().expect("unchanged commit must succeed");
    let again = FileStateStore::open(&layout).expect("must reopen store");
    assert_eq!(again.state().serial, 1, "no-op commit must not bump serial");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn file_store_abort_discards_uncommitted_changes() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut store = FileStateStore::open(&layout).expect("must open store");
    store.state_mut().version = Some(VersionId::new("1.0"));
    store.commit().expect("must commit");

    store
        .state_mut()
        .properties
        .insert("title".to_string(), "half-migrated".to_string());
    store.state_mut().version = Some(VersionId::new("9.9"));
    store.abort().expect("must abort");

    assert_eq!(store.state().version, Some(VersionId::new("1.0")));
    assert!(store.state().properties.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn file_store_reports_conflict_when_another_writer_committed() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut first = FileStateStore::open(&layout).expect("must open first store");
    let mut second = FileStateStore::open(&layout).expect("must open second store");

    first.state_mut().needs_role_remap = true;
    first.commit().expect("first writer must commit");

    second.state_mut().needs_reindex = true;
    let err = second
        .commit()
        .expect_err("second writer must observe the conflict");
    let conflict = err.as_conflict().expect("error must be a conflict");
    assert_eq!(conflict.expected, 0);
    assert_eq!(conflict.found, 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn file_store_dry_run_never_reaches_disk() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut store = FileStateStore::open(&layout).expect("must open store");
    store.state_mut().version = Some(VersionId::new("1.0"));
    store.state_mut().needs_reindex = true;
    store.commit().expect("must commit baseline");

    store.begin_run(true).expect("must begin dry run");
    store.state_mut().version = Some(VersionId::new("2.0"));
    store.state_mut().needs_reindex = false;
    store.commit().expect("dry commit must succeed");
    assert_eq!(store.state().version, Some(VersionId::new("2.0")));

    let on_disk = FileStateStore::open(&layout).expect("must reopen store");
    assert_eq!(on_disk.state().version, Some(VersionId::new("1.0")));

    store.rollback_run().expect("must roll back");
    assert_eq!(store.state().version, Some(VersionId::new("1.0")));
    assert!(store.state().needs_reindex);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn file_store_rollback_keeps_real_commits_and_drops_pending_edits() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut store = FileStateStore::open(&layout).expect("must open store");
    store.state_mut().version = Some(VersionId::new("1.0"));
    store.commit().expect("must commit baseline");

    store.begin_run(false).expect("must begin run");
    store.state_mut().version = Some(VersionId::new("2.0"));
    store.commit().expect("must commit step");
    store.state_mut().needs_reindex = true;
    store.rollback_run().expect("must roll back");

    assert_eq!(store.state().version, Some(VersionId::new("2.0")));
    assert!(!store.state().needs_reindex);
    let reopened = FileStateStore::open(&layout).expect("must reopen store");
    assert_eq!(reopened.state().version, Some(VersionId::new("2.0")));
    assert_eq!(reopened.state().serial, 2);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn file_store_rejects_unknown_state_format() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    fs::write(
        layout.instance_state_path(),
        r#"{"format": 7, "serial": 1, "version": "1.0"}"#,
    )
    .expect("must seed state");

    let err = FileStateStore::open(&layout).expect_err("unknown format must be rejected");
    assert!(
        matches!(err, StoreError::UnsupportedFormat { found: 7, .. }),
        "unexpected error: {err}"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn memory_store_counts_effective_commits() {
    let mut store = MemoryStateStore::new(InstanceState::default());
    store.commit().expect("empty commit");
    assert_eq!(store.commit_count(), 0);

    store.state_mut().version = Some(VersionId::new("1.0"));
    store.commit().expect("must commit");
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.committed().serial, 1);
}

#[test]
fn memory_store_injected_conflict_fires_once() {
    let mut store = MemoryStateStore::new(InstanceState::default());
    store.inject_conflict();
    store.state_mut().needs_reindex = true;

    let err = store.commit().expect_err("injected conflict must fire");
    assert!(err.as_conflict().is_some());
    store.commit().expect("second commit must succeed");
    assert!(store.committed().needs_reindex);
}

#[test]
fn begin_run_transaction_claims_marker_and_records_metadata() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    let mut store = FileStateStore::open(&layout).expect("must open store");
    store.state_mut().version = Some(VersionId::new("1.0"));
    store.commit().expect("must commit");

    let from = VersionId::new("1.0");
    let metadata = begin_run_transaction(&layout, "upgrade", Some(&from), 1_771_001_234)
        .expect("must begin run");
    assert_eq!(metadata.status, RunStatus::Planning);
    assert_eq!(
        read_active_run(&layout).expect("must read marker").as_deref(),
        Some(metadata.txid.as_str())
    );

    let err = begin_run_transaction(&layout, "upgrade", None, 1_771_001_999)
        .expect_err("second run must be refused");
    assert!(
        err.to_string().contains("another migration run is active"),
        "unexpected error: {err}"
    );

    update_run_status(&layout, &metadata.txid, RunStatus::Committed).expect("must update");
    let reread = read_run_metadata(&layout, &metadata.txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(reread.status, RunStatus::Committed);
    assert_eq!(reread.from_version, Some(from));

    clear_active_run(&layout).expect("must clear marker");
    assert_eq!(read_active_run(&layout).expect("must read marker"), None);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn begin_run_transaction_ignores_unreadable_instance_state() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    fs::create_dir_all(layout.instance_state_path()).expect("must block state path");

    let metadata =
        begin_run_transaction(&layout, "upgrade", None, 1_771_002_000).expect("must begin run");
    assert_eq!(
        read_active_run(&layout).expect("must read marker").as_deref(),
        Some(metadata.txid.as_str())
    );

    clear_active_run(&layout).expect("must clear marker");
    assert_eq!(read_active_run(&layout).expect("must read marker"), None);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn refused_run_leaves_no_metadata_behind() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    set_active_run(&layout, "run-existing").expect("must claim marker");

    begin_run_transaction(&layout, "upgrade", None, 1_771_002_100)
        .expect_err("run must be refused while another is active");

    let leftovers: Vec<_> = fs::read_dir(layout.transactions_dir())
        .expect("must list transactions")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".json"))
        .collect();
    assert!(leftovers.is_empty(), "unexpected metadata: {leftovers:?}");
    assert_eq!(
        read_active_run(&layout).expect("must read marker").as_deref(),
        Some("run-existing")
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn runs_started_in_the_same_second_get_distinct_txids() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let first = begin_run_transaction(&layout, "upgrade", None, 1_771_003_000)
        .expect("must begin first run");
    RunJournal::new(layout.clone(), first.txid.clone())
        .record("apply_step:1.0->2.0", "done", None)
        .expect("must journal first run");
    clear_active_run(&layout).expect("must clear marker");

    let second = begin_run_transaction(&layout, "upgrade", None, 1_771_003_000)
        .expect("must begin second run");
    assert_ne!(first.txid, second.txid);
    assert!(read_run_journal(&layout, &second.txid)
        .expect("must read journal")
        .is_empty());
    assert_eq!(
        read_run_metadata(&layout, &first.txid)
            .expect("must read metadata")
            .expect("first metadata must survive")
            .status,
        RunStatus::Planning
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn run_journal_appends_sequenced_entries() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut journal = RunJournal::new(layout.clone(), "run-1-1");
    journal
        .record("apply_step:1.0->2.0", "done", None)
        .expect("must record");
    journal
        .record("maintenance:reindex", "failed", Some("index offline".to_string()))
        .expect("must record");

    let entries = read_run_journal(&layout, "run-1-1").expect("must read journal");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 1);
    assert_eq!(entries[1].seq, 2);
    assert_eq!(entries[1].detail.as_deref(), Some("index offline"));

    let _ = fs::remove_dir_all(layout.root());
}

fn test_layout() -> InstanceLayout {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "uplift-store-test-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&path);
    InstanceLayout::new(path)
}

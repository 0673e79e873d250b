//! Independent per-kind status caches, invalidation and stale fallback.

mod common;

use std::sync::atomic::Ordering;

use ddr_sync_core::Error;
use ddr_sync_storage::RepoStatusStore;

use common::{MockVcs, base_with_collections, collection, context, test_config};

#[test]
fn kinds_are_cached_independently() {
    let tmp = base_with_collections(1);
    let vcs = MockVcs::new();
    let store = RepoStatusStore::new(context(test_config(tmp.path())), vcs.clone());
    let c = collection(tmp.path(), "ddr-test-1");

    store.repo_status(&c, false).unwrap();
    store.repo_status(&c, false).unwrap();
    assert_eq!(vcs.status_calls(), 1);
    assert_eq!(vcs.annex_calls(), 0);

    store.repo_annex_status(&c, false).unwrap();
    store.repo_annex_status(&c, false).unwrap();
    assert_eq!(vcs.annex_calls(), 1);
    assert_eq!(vcs.status_calls(), 1);

    store.repo_fetch(&c, false).unwrap();
    store.repo_fetch(&c, false).unwrap();
    assert_eq!(vcs.fetch_calls.load(Ordering::SeqCst), 1);

    store.repo_status(&c, true).unwrap();
    assert_eq!(vcs.status_calls(), 2);
}

#[test]
fn cache_delete_drops_all_kinds() {
    let tmp = base_with_collections(1);
    let vcs = MockVcs::new();
    let store = RepoStatusStore::new(context(test_config(tmp.path())), vcs.clone());
    let c = collection(tmp.path(), "ddr-test-1");

    store.repo_fetch(&c, false).unwrap();
    store.repo_status(&c, false).unwrap();
    store.repo_annex_status(&c, false).unwrap();
    store.cache_delete("ddr-test-1").unwrap();
    store.repo_fetch(&c, false).unwrap();
    store.repo_status(&c, false).unwrap();
    store.repo_annex_status(&c, false).unwrap();

    assert_eq!(vcs.fetch_calls.load(Ordering::SeqCst), 2);
    assert_eq!(vcs.status_calls(), 2);
    assert_eq!(vcs.annex_calls(), 2);
}

#[test]
fn cache_delete_marks_snapshot_stale_until_refresh() {
    let tmp = base_with_collections(1);
    let store = RepoStatusStore::new(context(test_config(tmp.path())), MockVcs::new());
    let c = collection(tmp.path(), "ddr-test-1");

    // no snapshot yet: nothing to mark
    store.cache_delete("ddr-test-1").unwrap();
    assert!(store.read_snapshot("ddr-test-1").unwrap().is_none());

    let fresh = store.refresh(&c).unwrap();
    store.cache_delete("ddr-test-1").unwrap();
    let marked = store.read_snapshot("ddr-test-1").unwrap().unwrap();
    assert!(marked.stale);
    assert_eq!(marked.checked_at, fresh.checked_at);

    store.refresh(&c).unwrap();
    assert!(!store.read_snapshot("ddr-test-1").unwrap().unwrap().stale);
}

#[test]
fn failed_commands_are_not_cached() {
    let tmp = base_with_collections(1);
    let vcs = MockVcs::new();
    let store = RepoStatusStore::new(context(test_config(tmp.path())), vcs.clone());
    let c = collection(tmp.path(), "ddr-test-1");

    vcs.set_failing(true);
    let err = store.repo_status(&c, false).unwrap_err();
    assert!(matches!(err, Error::StatusCommand { code: 128, .. }));
    assert!(err.is_recoverable());

    vcs.set_failing(false);
    store.repo_status(&c, false).unwrap();
    assert_eq!(vcs.status_calls(), 2);
}

#[test]
fn display_falls_back_to_stale_snapshot() {
    let tmp = base_with_collections(1);
    let vcs = MockVcs::new();
    let store = RepoStatusStore::new(context(test_config(tmp.path())), vcs.clone());
    let c = collection(tmp.path(), "ddr-test-1");

    // nothing to fall back to yet
    vcs.set_failing(true);
    assert!(store.current(&c).is_err());

    vcs.set_failing(false);
    let fresh = store.refresh(&c).unwrap();
    assert!(!fresh.stale);
    assert!(
        tmp.path()
            .join("tmp/gitstatus/ddr-test-1.json")
            .is_file()
    );

    store.cache_delete("ddr-test-1").unwrap();
    vcs.set_failing(true);
    let served = store.current(&c).unwrap();
    assert!(served.stale);
    assert_eq!(served.checked_at, fresh.checked_at);
    assert_eq!(served.state, fresh.state);
}

#[test]
fn current_uses_cache_when_live() {
    let tmp = base_with_collections(1);
    let vcs = MockVcs::new();
    let store = RepoStatusStore::new(context(test_config(tmp.path())), vcs.clone());
    let c = collection(tmp.path(), "ddr-test-1");

    store.refresh(&c).unwrap();
    let shown = store.current(&c).unwrap();
    assert!(!shown.stale);
    assert_eq!(vcs.status_calls(), 1);
    assert_eq!(vcs.annex_calls(), 1);
}

#[test]
fn corrupt_snapshot_reads_as_absent() {
    let tmp = base_with_collections(1);
    let store = RepoStatusStore::new(context(test_config(tmp.path())), MockVcs::new());
    let dir = tmp.path().join("tmp/gitstatus");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("ddr-test-1.json"), "{").unwrap();
    assert!(store.read_snapshot("ddr-test-1").unwrap().is_none());
}

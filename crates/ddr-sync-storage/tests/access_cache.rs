//! Freshness, cutoff and negative-cache behaviour of the gitolite info cache.

mod common;

use std::time::Duration;

use chrono::Utc;
use ddr_sync_core::Error;
use ddr_sync_storage::access::{AccessCache, AccessEntry, GITOLITE_INFO_KEY, RefreshOutcome};

use common::{GITOLITE_INFO, MockAccess, context, test_config};

#[test]
fn cached_orgs_are_served_without_querying() {
    let tmp = tempfile::TempDir::new().unwrap();
    let access = MockAccess::new(GITOLITE_INFO);
    let cache = AccessCache::new(context(test_config(tmp.path())), access.clone());

    for _ in 0..5 {
        assert_eq!(cache.get_repos_orgs().unwrap(), vec!["ddr-test"]);
    }
    assert_eq!(access.calls(), 1);
}

#[test]
fn refresh_requeries_only_past_cutoff() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let cutoff = config.gitolite_info_cache_cutoff;
    let access = MockAccess::new(GITOLITE_INFO);
    let cache = AccessCache::new(context(config), access.clone());

    let recent = AccessEntry {
        timestamp: Utc::now() - chrono::Duration::seconds(10),
        source: "git@test.example".into(),
        raw_info: GITOLITE_INFO.into(),
    };
    cache.store_entry(&recent).unwrap();
    assert!(matches!(
        cache.refresh().unwrap(),
        RefreshOutcome::Fresh { .. }
    ));
    assert_eq!(access.calls(), 0);

    let old_ts = Utc::now() - chrono::Duration::seconds(i64::try_from(cutoff).unwrap() + 60);
    cache
        .store_entry(&AccessEntry {
            timestamp: old_ts,
            ..recent
        })
        .unwrap();
    assert_eq!(
        cache.refresh().unwrap(),
        RefreshOutcome::Refreshed { orgs: 1 }
    );
    assert_eq!(access.calls(), 1);

    let stored = cache.cached_entry().unwrap().unwrap();
    assert!(stored.timestamp > old_ts);
    assert!(stored.age(Utc::now()) < Duration::from_secs(60));
}

#[test]
fn refresh_queries_when_missing_or_malformed() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ctx = context(test_config(tmp.path()));
    let access = MockAccess::new(GITOLITE_INFO);
    let cache = AccessCache::new(ctx.clone(), access.clone());

    assert!(matches!(cache.refresh().unwrap(), RefreshOutcome::Refreshed { .. }));
    ctx.cache.set(GITOLITE_INFO_KEY, "{garbage", None).unwrap();
    assert!(matches!(cache.refresh().unwrap(), RefreshOutcome::Refreshed { .. }));
    assert_eq!(access.calls(), 2);
}

#[test]
fn malformed_entry_is_a_cache_miss() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ctx = context(test_config(tmp.path()));
    ctx.cache.set(GITOLITE_INFO_KEY, "not json", None).unwrap();
    let access = MockAccess::new(GITOLITE_INFO);
    let cache = AccessCache::new(ctx, access.clone());

    assert_eq!(cache.get_repos_orgs().unwrap(), vec!["ddr-test"]);
    assert_eq!(access.calls(), 1);
}

#[test]
fn empty_answer_is_negatively_cached_and_reported() {
    let tmp = tempfile::TempDir::new().unwrap();
    let access = MockAccess::new("");
    let cache = AccessCache::new(context(test_config(tmp.path())), access.clone());

    assert!(matches!(
        cache.get_repos_orgs(),
        Err(Error::AccessUnavailable(_))
    ));
    // second caller hits the negative entry instead of the endpoint
    assert!(matches!(
        cache.get_repos_orgs(),
        Err(Error::AccessUnavailable(_))
    ));
    assert_eq!(access.calls(), 1);

    let negative = cache.cached_entry().unwrap().unwrap();
    assert!(negative.is_empty());
    assert_eq!(negative.source, "git@test.example");

    // the periodic refresher does not wait for the negative entry to expire
    access.set_info(GITOLITE_INFO);
    assert!(matches!(cache.refresh().unwrap(), RefreshOutcome::Refreshed { .. }));
    assert_eq!(cache.get_repos_orgs().unwrap(), vec!["ddr-test"]);
    assert_eq!(access.calls(), 2);
}

#[test]
fn info_exposes_collections_and_user() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cache = AccessCache::new(
        context(test_config(tmp.path())),
        MockAccess::new(GITOLITE_INFO),
    );
    let info = cache.info().unwrap();
    assert!(info.connected());
    assert_eq!(info.username.as_deref(), Some("ddr"));
    assert_eq!(info.collections(), vec!["ddr-test-1"]);
}

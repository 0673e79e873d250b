//! Shared fixtures for the storage integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddr_sync_core::{Config, MemoryCache, Result};
use ddr_sync_storage::{
    AccessControl, Collection, FsInventory, SchedulerContext, StatusOutput, SyncScheduler,
    VcsStatus,
};
use tempfile::TempDir;

pub const GITOLITE_INFO: &str = "hello ddr, this is git@mits running gitolite3 v3.6.6 on git 2.1.4

 R W C\tddr-test-[0-9]+
 R W\tddr-test
 R W\tddr-test-1
 R\tddr-readonly
";

/// Access endpoint that counts queries and returns canned text.
pub struct MockAccess {
    pub calls: AtomicUsize,
    pub info: Mutex<String>,
}

impl MockAccess {
    pub fn new(info: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            info: Mutex::new(info.to_string()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_info(&self, info: &str) {
        *self.info.lock().unwrap() = info.to_string();
    }
}

impl AccessControl for MockAccess {
    fn endpoint(&self) -> &str {
        "git@test.example"
    }

    fn query(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.lock().unwrap().clone())
    }
}

/// Status commands that count invocations, optionally sleep, and can be
/// switched to fail.
#[derive(Default)]
pub struct MockVcs {
    pub fetch_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub annex_calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Duration,
}

impl MockVcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn annex_calls(&self) -> usize {
        self.annex_calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn output(&self, text: &str) -> StatusOutput {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            StatusOutput {
                exit_code: 128,
                text: "fatal: unable to access repository".into(),
            }
        } else {
            StatusOutput {
                exit_code: 0,
                text: text.into(),
            }
        }
    }
}

impl VcsStatus for MockVcs {
    fn fetch(&self, _repo: &Path) -> Result<StatusOutput> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output("From mits:ddr-test-1\n"))
    }

    fn status(&self, _repo: &Path) -> Result<StatusOutput> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output("## master...origin/master [ahead 1]\n"))
    }

    fn annex_status(&self, _repo: &Path) -> Result<StatusOutput> {
        self.annex_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output("local annex keys: 3\n"))
    }
}

/// Base directory holding `ddr-test-1..=n` collections.
pub fn base_with_collections(n: u32) -> TempDir {
    let tmp = TempDir::new().unwrap();
    for i in 1..=n {
        make_collection(tmp.path(), &format!("ddr-test-{i}"));
    }
    tmp
}

pub fn make_collection(base: &Path, id: &str) -> PathBuf {
    let dir = base.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("collection.json"),
        format!("[{{\"application\": \"ddr-cmdln\"}}, {{\"id\": \"{id}\"}}]"),
    )
    .unwrap();
    dir
}

pub fn test_config(base: &Path) -> Config {
    Config {
        base_path: base.to_path_buf(),
        cache_dir: base.join("cache"),
        gitstatus_interval: 0,
        ..Config::default()
    }
}

pub fn context(config: Config) -> SchedulerContext {
    SchedulerContext::new(config, Arc::new(MemoryCache::new()))
}

pub fn scheduler(
    ctx: &SchedulerContext,
    access: &Arc<MockAccess>,
    vcs: &Arc<MockVcs>,
) -> SyncScheduler {
    SyncScheduler::new(
        ctx.clone(),
        access.clone(),
        vcs.clone(),
        Arc::new(FsInventory),
    )
}

pub fn collection(base: &Path, id: &str) -> Collection {
    Collection::from_path(&base.join(id)).unwrap()
}

//! The background status loop.
//!
//! Each tick refreshes at most one collection, and at most one tick runs at a
//! time across every process sharing the cache: the tick takes an add-if-absent
//! cache key with a TTL, so a crashed holder only blocks ticks until the key
//! expires. Work comes from the persisted [`SyncQueue`], refilled from the
//! access-controlled collection inventory when empty.
//!
//! A tick does nothing when:
//! - the global stop flag is raised ([`TickOutcome::Stopped`])
//! - an unscoped operation lock is held ([`TickOutcome::OperationLocked`])
//! - a recent check failed ([`TickOutcome::BackingOff`])
//! - another tick is in flight ([`TickOutcome::AlreadyRunning`])

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use ddr_sync_core::{CacheStore, Error, Result, global_metrics, ttl_from_secs};

use crate::access::{AccessCache, AccessControl};
use crate::collection::{Collection, CollectionInventory};
use crate::context::SchedulerContext;
use crate::locks;
use crate::queue::SyncQueue;
use crate::status::{RepoState, RepoStatusStore, VcsStatus};

/// Cache key of the cross-process tick mutex.
pub const GITSTATUS_LOCK_KEY: &str = "webui:gitstatus:lock";
/// Cache key set for `GITSTATUS_BACKOFF` seconds after a failed check.
pub const GITSTATUS_BACKOFF_KEY: &str = "webui:gitstatus:backoff";

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Updated {
        collection_id: String,
        state: RepoState,
        elapsed_ms: u64,
    },
    /// Another tick holds the global lock. Routine, not an error.
    AlreadyRunning,
    Stopped,
    OperationLocked {
        lock: String,
    },
    BackingOff,
    /// A lock scoped to this collection is held; it went to the back of the queue.
    Deferred {
        collection_id: String,
        lock: String,
    },
    /// Checked less than `GITSTATUS_COLLECTION_INTERVAL` seconds ago and not
    /// written since.
    NotDue {
        collection_id: String,
        age_secs: u64,
    },
    /// Queued path is no longer a collection.
    Missing {
        path: PathBuf,
    },
    /// Nothing to check: the inventory is empty.
    Idle,
    Failed {
        collection_id: Option<String>,
        error: String,
    },
}

/// Why [`SyncScheduler::gitstatus_loop`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    StorageUnavailable(String),
    /// The caller's tick budget ran out.
    TickLimit,
}

static LOCK_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Holds the global tick lock; deletes it on drop if still ours.
struct TickLock<'a> {
    cache: &'a dyn CacheStore,
    token: String,
}

impl<'a> TickLock<'a> {
    fn try_acquire(cache: &'a dyn CacheStore, ttl: Option<Duration>) -> Result<Option<Self>> {
        let token = format!(
            "{}:{}:{}",
            std::process::id(),
            LOCK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed),
            Utc::now().to_rfc3339()
        );
        if cache.add(GITSTATUS_LOCK_KEY, &token, ttl)? {
            Ok(Some(Self { cache, token }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for TickLock<'_> {
    fn drop(&mut self) {
        // after a TTL takeover the key belongs to someone else
        match self.cache.delete_if(GITSTATUS_LOCK_KEY, &self.token) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("gitstatus lock taken over, not released"),
            Err(e) => tracing::warn!("failed to release gitstatus lock: {e}"),
        }
    }
}

pub struct SyncScheduler {
    ctx: SchedulerContext,
    access: AccessCache,
    status: RepoStatusStore,
    inventory: Arc<dyn CollectionInventory>,
    queue: SyncQueue,
}

impl SyncScheduler {
    #[must_use]
    pub fn new(
        ctx: SchedulerContext,
        access: Arc<dyn AccessControl>,
        vcs: Arc<dyn VcsStatus>,
        inventory: Arc<dyn CollectionInventory>,
    ) -> Self {
        Self {
            access: AccessCache::new(ctx.clone(), access),
            status: RepoStatusStore::new(ctx.clone(), vcs),
            queue: SyncQueue::new(ctx.queue_path()),
            inventory,
            ctx,
        }
    }

    #[must_use]
    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    #[must_use]
    pub fn access(&self) -> &AccessCache {
        &self.access
    }

    #[must_use]
    pub fn status(&self) -> &RepoStatusStore {
        &self.status
    }

    #[must_use]
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Every collection path the credential may reach, in inventory order.
    pub fn collection_paths(&self) -> Result<Vec<PathBuf>> {
        let config = &self.ctx.config;
        let mut paths = Vec::new();
        for org in self.access.get_repos_orgs()? {
            paths.extend(
                self.inventory
                    .list_collections(&config.base_path, &config.repo, &org)?,
            );
        }
        Ok(paths)
    }

    /// Pop the next collection path, regenerating the queue when empty.
    pub fn gitstatus_next_repo(&self) -> Result<Option<PathBuf>> {
        self.queue.next_or_regenerate(|| self.collection_paths())
    }

    /// Fail unless the base path holds at least one `<repo>-*` directory and
    /// its tmp dir accepts writes. An empty directory is an unmounted device.
    pub fn check_storage(&self) -> Result<()> {
        let base = self.ctx.base_dir();
        let unavailable = || Error::StorageUnavailable(base.display().to_string());
        if !base.is_dir() {
            return Err(unavailable());
        }
        let prefix = format!("{}-", self.ctx.config.repo);
        let populated = fs::read_dir(base)?.filter_map(std::result::Result::ok).any(|entry| {
            entry.file_name().to_string_lossy().starts_with(&prefix)
                && entry.file_type().is_ok_and(|t| t.is_dir())
        });
        if !populated {
            tracing::warn!(base = %base.display(), "no collections under base path, not mounted?");
            return Err(unavailable());
        }
        let tmp = self.ctx.config.tmp_dir();
        let scratch = tmp.join(format!(".gitstatus-write-check-{}", std::process::id()));
        let writable = fs::create_dir_all(&tmp)
            .and_then(|()| fs::write(&scratch, b""))
            .and_then(|()| fs::remove_file(&scratch));
        writable.map_err(|e| {
            tracing::warn!(base = %base.display(), "storage not writable: {e}");
            unavailable()
        })
    }

    fn record_failure(&self, collection_id: Option<String>, err: &Error) -> TickOutcome {
        global_metrics().scheduler.failures_total.inc();
        tracing::warn!(
            collection = collection_id.as_deref().unwrap_or("-"),
            error_type = err.error_type(),
            "gitstatus check failed: {err}"
        );
        let ttl = ttl_from_secs(self.ctx.config.gitstatus_backoff);
        if ttl.is_some() {
            if let Err(e) = self
                .ctx
                .cache
                .set(GITSTATUS_BACKOFF_KEY, &Utc::now().to_rfc3339(), ttl)
            {
                tracing::warn!("failed to record gitstatus backoff: {e}");
            }
        }
        TickOutcome::Failed {
            collection_id,
            error: err.to_string(),
        }
    }

    /// Run one tick.
    ///
    /// Only storage loss is returned as an error; every other failure is
    /// absorbed into [`TickOutcome::Failed`] and retried on a later tick.
    pub fn gitstatus_update(&self) -> Result<TickOutcome> {
        let metrics = &global_metrics().scheduler;
        metrics.ticks_total.inc();
        let base = self.ctx.base_dir();

        if locks::locked(base) {
            return Ok(TickOutcome::Stopped);
        }
        if !base.is_dir() {
            return Err(Error::StorageUnavailable(base.display().to_string()));
        }
        if let Some(lock) = locks::blocking_lock(base, None)? {
            metrics.busy_skips_total.inc();
            tracing::debug!(lock = %lock, "operation lock held, skipping tick");
            return Ok(TickOutcome::OperationLocked {
                lock: lock.to_string(),
            });
        }
        if self.ctx.cache.get(GITSTATUS_BACKOFF_KEY)?.is_some() {
            return Ok(TickOutcome::BackingOff);
        }

        let ttl = ttl_from_secs(self.ctx.config.gitstatus_lock_expire);
        let Some(_guard) = TickLock::try_acquire(self.ctx.cache.as_ref(), ttl)? else {
            metrics.busy_skips_total.inc();
            tracing::debug!("gitstatus tick already running elsewhere");
            return Ok(TickOutcome::AlreadyRunning);
        };

        match self.update_next() {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal_to_loop() => Err(e),
            Err(e) => Ok(self.record_failure(None, &e)),
        }
    }

    fn update_next(&self) -> Result<TickOutcome> {
        let Some(path) = self.gitstatus_next_repo()? else {
            return Ok(TickOutcome::Idle);
        };
        let collection = match Collection::from_path(&path) {
            Ok(c) => c,
            Err(e) => {
                if !self.ctx.base_dir().is_dir() {
                    return Err(Error::StorageUnavailable(
                        self.ctx.base_dir().display().to_string(),
                    ));
                }
                tracing::warn!(path = %path.display(), "dropping queued path: {e}");
                return Ok(TickOutcome::Missing { path });
            }
        };
        let collection_id = collection.id.id.clone();

        if let Some(lock) = locks::blocking_lock(self.ctx.base_dir(), Some(&collection_id))? {
            self.queue.push_back(&path)?;
            global_metrics().scheduler.deferred_total.inc();
            tracing::debug!(collection = %collection_id, lock = %lock, "collection locked, deferred");
            return Ok(TickOutcome::Deferred {
                collection_id,
                lock: lock.to_string(),
            });
        }

        let min_interval = Duration::from_secs(self.ctx.config.gitstatus_collection_interval);
        if let Some(snapshot) = self.status.read_snapshot(&collection_id)? {
            let age = snapshot.age(Utc::now());
            if !snapshot.stale && age < min_interval {
                return Ok(TickOutcome::NotDue {
                    collection_id,
                    age_secs: age.as_secs(),
                });
            }
        }

        match self.status.refresh(&collection) {
            Ok(snapshot) => {
                let metrics = &global_metrics().scheduler;
                metrics.updates_total.inc();
                metrics.slowest_update_ms.fetch_max(snapshot.elapsed_ms);
                tracing::info!(
                    collection = %collection_id,
                    elapsed_ms = snapshot.elapsed_ms,
                    "gitstatus updated"
                );
                Ok(TickOutcome::Updated {
                    collection_id,
                    state: snapshot.state,
                    elapsed_ms: snapshot.elapsed_ms,
                })
            }
            Err(e) if e.is_fatal_to_loop() => Err(e),
            Err(e) => Ok(self.record_failure(Some(collection_id), &e)),
        }
    }

    /// Tick every `GITSTATUS_INTERVAL` seconds until the stop flag is raised,
    /// storage goes away, or `max_ticks` ticks have run.
    pub fn gitstatus_loop(&self, max_ticks: Option<u64>) -> LoopExit {
        let base = self.ctx.base_dir();
        let interval = self.ctx.config.tick_interval();
        tracing::info!(
            base = %base.display(),
            interval_secs = interval.as_secs(),
            "gitstatus loop started"
        );
        let mut ticks = 0u64;
        loop {
            if locks::locked(base) {
                tracing::info!("gitstatus stop flag present, exiting loop");
                return LoopExit::Stopped;
            }
            if let Err(e) = self.check_storage() {
                tracing::warn!("exiting gitstatus loop: {e}");
                return LoopExit::StorageUnavailable(e.to_string());
            }
            match self.gitstatus_update() {
                Ok(outcome) => tracing::debug!(?outcome, "gitstatus tick"),
                Err(e) if e.is_fatal_to_loop() => {
                    tracing::warn!("exiting gitstatus loop: {e}");
                    return LoopExit::StorageUnavailable(e.to_string());
                }
                Err(e) => tracing::warn!("gitstatus tick error: {e}"),
            }
            ticks += 1;
            if max_ticks.is_some_and(|max| ticks >= max) {
                return LoopExit::TickLimit;
            }
            std::thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddr_sync_core::MemoryCache;

    #[test]
    fn tick_lock_released_by_holder() {
        let cache = MemoryCache::new();
        let lock = TickLock::try_acquire(&cache, Some(Duration::from_secs(60)))
            .unwrap()
            .unwrap();
        assert!(TickLock::try_acquire(&cache, None).unwrap().is_none());
        drop(lock);
        assert!(cache.get(GITSTATUS_LOCK_KEY).unwrap().is_none());
    }

    #[test]
    fn tick_lock_left_alone_after_takeover() {
        let cache = MemoryCache::new();
        let lock = TickLock::try_acquire(&cache, Some(Duration::from_secs(60)))
            .unwrap()
            .unwrap();
        // expired and re-acquired by another process
        cache.set(GITSTATUS_LOCK_KEY, "other-holder", None).unwrap();
        drop(lock);
        assert_eq!(
            cache.get(GITSTATUS_LOCK_KEY).unwrap().as_deref(),
            Some("other-holder")
        );
    }
}

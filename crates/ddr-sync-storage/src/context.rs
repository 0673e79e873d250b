//! Shared coordination surface for one deployment.
//!
//! The scheduler, the status store and the access cache never reach for
//! globals: they are handed a [`SchedulerContext`] built once at process start.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ddr_sync_core::{CacheStore, Config};

use crate::locks;

/// Configuration plus the shared key/value cache.
#[derive(Clone)]
pub struct SchedulerContext {
    pub config: Config,
    pub cache: Arc<dyn CacheStore>,
}

impl SchedulerContext {
    #[must_use]
    pub fn new(config: Config, cache: Arc<dyn CacheStore>) -> Self {
        Self { config, cache }
    }

    /// Root of the collection repositories.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.config.base_path
    }

    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.config.queue_path()
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.config.snapshot_dir()
    }

    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        locks::lock_dir(self.base_dir())
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("base_path", &self.config.base_path)
            .field("cache_dir", &self.config.cache_dir)
            .finish_non_exhaustive()
    }
}

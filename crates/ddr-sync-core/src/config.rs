//! Configuration management for DDR repository sync
//!
//! Configuration is loaded from environment variables, using the same setting
//! names as the editor's settings module so a single environment file can
//! drive both the web process and the background scheduler.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct for DDR repository sync
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub base_path: PathBuf,
    pub repo: String,
    pub cache_dir: PathBuf,
    pub git_bin: String,

    // Gitolite
    pub gitolite: String,
    pub gitolite_timeout: u64,
    pub gitolite_info_cache_timeout: u64,
    pub gitolite_info_cache_cutoff: u64,
    pub gitolite_info_check_frequency: u64,
    pub gitolite_info_negative_ttl: u64,

    // Git status scheduler
    pub gitstatus_interval: u64,
    pub gitstatus_lock_expire: u64,
    pub gitstatus_collection_interval: u64,
    pub gitstatus_backoff: u64,

    // Repo status cache (0 = keep until invalidated)
    pub repo_fetch_timeout: u64,
    pub repo_status_timeout: u64,
    pub repo_annex_status_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Storage
            base_path: PathBuf::from("/var/www/media/ddr"),
            repo: "ddr".to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("ddr-sync"),
            git_bin: "git".to_string(),

            // Gitolite
            gitolite: "git@mits.densho.org".to_string(),
            gitolite_timeout: 60,
            gitolite_info_cache_timeout: 60 * 60,
            gitolite_info_cache_cutoff: 60 * 30,
            gitolite_info_check_frequency: 60 * 10,
            gitolite_info_negative_ttl: 60,

            // Git status scheduler
            gitstatus_interval: 60,
            gitstatus_lock_expire: 60 * 10,
            gitstatus_collection_interval: 60 * 60,
            gitstatus_backoff: 30,

            // Repo status cache
            repo_fetch_timeout: 0,
            repo_status_timeout: 60 * 10,
            repo_annex_status_timeout: 60 * 10,

            // Logging
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Storage
        if let Some(v) = env_value("DDR_BASE_PATH") {
            config.base_path = expand_path(&v);
        }
        if let Some(v) = env_value("DDR_REPO") {
            config.repo = v;
        }
        if let Some(v) = env_value("DDR_CACHE_DIR") {
            config.cache_dir = expand_path(&v);
        }
        if let Some(v) = env_value("GIT_BIN") {
            config.git_bin = v;
        }

        // Gitolite
        if let Some(v) = env_value("GITOLITE") {
            config.gitolite = v;
        }
        config.gitolite_timeout = env_u64("GITOLITE_TIMEOUT", config.gitolite_timeout);
        config.gitolite_info_cache_timeout = env_u64(
            "GITOLITE_INFO_CACHE_TIMEOUT",
            config.gitolite_info_cache_timeout,
        );
        config.gitolite_info_cache_cutoff = env_u64(
            "GITOLITE_INFO_CACHE_CUTOFF",
            config.gitolite_info_cache_cutoff,
        );
        config.gitolite_info_check_frequency = env_u64(
            "GITOLITE_INFO_CHECK_FREQUENCY",
            config.gitolite_info_check_frequency,
        );
        config.gitolite_info_negative_ttl = env_u64(
            "GITOLITE_INFO_NEGATIVE_TTL",
            config.gitolite_info_negative_ttl,
        );

        // Git status scheduler
        config.gitstatus_interval = env_u64("GITSTATUS_INTERVAL", config.gitstatus_interval);
        config.gitstatus_lock_expire =
            env_u64("GITSTATUS_LOCK_EXPIRE", config.gitstatus_lock_expire);
        config.gitstatus_collection_interval = env_u64(
            "GITSTATUS_COLLECTION_INTERVAL",
            config.gitstatus_collection_interval,
        );
        config.gitstatus_backoff = env_u64("GITSTATUS_BACKOFF", config.gitstatus_backoff);

        // Repo status cache
        config.repo_fetch_timeout = env_u64("REPO_FETCH_TIMEOUT", config.repo_fetch_timeout);
        config.repo_status_timeout = env_u64("REPO_STATUS_TIMEOUT", config.repo_status_timeout);
        config.repo_annex_status_timeout = env_u64(
            "REPO_ANNEX_STATUS_TIMEOUT",
            config.repo_annex_status_timeout,
        );

        // Logging
        if let Some(v) = env_value("LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }

    /// Scratch directory for the queue file and lock sentinels.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.base_path.join("tmp")
    }

    /// Persisted gitstatus queue.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.tmp_dir().join("gitstatus-queue.json")
    }

    /// Directory of per-collection status snapshots.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.tmp_dir().join("gitstatus")
    }

    /// Sleep between two scheduler ticks.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.gitstatus_interval)
    }
}

/// Convert a seconds setting into a cache TTL where zero means "no expiry".
#[must_use]
pub const fn ttl_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Read a non-empty environment variable.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

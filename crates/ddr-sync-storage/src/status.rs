//! Per-collection cached git / git-annex status.
//!
//! Three independent cache entries per collection, each with its own TTL:
//!
//! | kind | key | TTL setting |
//! |---|---|---|
//! | fetch | `webui:collection:<id>:fetch` | `REPO_FETCH_TIMEOUT` |
//! | status | `webui:collection:<id>:status` | `REPO_STATUS_TIMEOUT` |
//! | annex status | `webui:collection:<id>:annex_status` | `REPO_ANNEX_STATUS_TIMEOUT` |
//!
//! A miss runs the command and stores its output; a miss on one kind never
//! recomputes another. Concurrent misses may both run the command: callers
//! that need exactly-once go through the scheduler's global lock.
//!
//! Forced refreshes also write a JSON snapshot under `tmp/gitstatus/`, which
//! the interactive path falls back to when a recomputation fails.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use ddr_sync_core::{Error, Result, global_metrics, ttl_from_secs};

use crate::collection::Collection;
use crate::context::SchedulerContext;
use crate::write_json_atomic;

/// Output of one version-control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOutput {
    pub exit_code: i32,
    pub text: String,
}

impl StatusOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Version-control status primitives. Blocking.
pub trait VcsStatus: Send + Sync {
    fn fetch(&self, repo: &Path) -> Result<StatusOutput>;
    fn status(&self, repo: &Path) -> Result<StatusOutput>;
    fn annex_status(&self, repo: &Path) -> Result<StatusOutput>;
}

/// `git` subprocess implementation.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_bin: String,
}

impl GitCli {
    #[must_use]
    pub fn new(git_bin: impl Into<String>) -> Self {
        Self {
            git_bin: git_bin.into(),
        }
    }

    fn run(&self, repo: &Path, args: &[&str]) -> Result<StatusOutput> {
        let output = Command::new(&self.git_bin)
            .current_dir(repo)
            .args(args)
            .output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str(&stderr);
        }
        Ok(StatusOutput {
            exit_code: output.status.code().unwrap_or(-1),
            text,
        })
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl VcsStatus for GitCli {
    fn fetch(&self, repo: &Path) -> Result<StatusOutput> {
        self.run(repo, &["fetch", "origin"])
    }

    fn status(&self, repo: &Path) -> Result<StatusOutput> {
        self.run(repo, &["status", "--short", "--branch"])
    }

    fn annex_status(&self, repo: &Path) -> Result<StatusOutput> {
        self.run(repo, &["annex", "status"])
    }
}

// ---------------------------------------------------------------------------
// Repo state
// ---------------------------------------------------------------------------

fn branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^## .*?(?:\[(?:ahead (\d+))?(?:, )?(?:behind (\d+))?\])?$")
            .expect("valid regex")
    })
}

/// Sync state derived from `git status --short --branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RepoState {
    Synced,
    Ahead { commits: u32 },
    Behind { commits: u32 },
    Diverged { ahead: u32, behind: u32 },
    Conflicted,
    Unknown,
}

impl RepoState {
    #[must_use]
    pub fn parse(status_text: &str) -> Self {
        let mut ahead = 0u32;
        let mut behind = 0u32;
        let mut saw_branch = false;
        for line in status_text.lines() {
            if line.starts_with("## ") {
                saw_branch = true;
                if let Some(caps) = branch_re().captures(line) {
                    ahead = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                    behind = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                }
                continue;
            }
            let code = line.get(..2).unwrap_or_default();
            if matches!(code, "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU") {
                return Self::Conflicted;
            }
        }
        match (saw_branch, ahead, behind) {
            (false, _, _) => Self::Unknown,
            (true, 0, 0) => Self::Synced,
            (true, a, 0) => Self::Ahead { commits: a },
            (true, 0, b) => Self::Behind { commits: b },
            (true, a, b) => Self::Diverged {
                ahead: a,
                behind: b,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Result of a forced status refresh, persisted per collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub collection_id: String,
    pub checked_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status: StatusOutput,
    pub annex_status: StatusOutput,
    pub state: RepoState,
    /// Set once the collection was written after `checked_at`, or when
    /// served in place of a failed recomputation.
    #[serde(default)]
    pub stale: bool,
}

impl StatusSnapshot {
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.checked_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum StatusKind {
    Fetch,
    Status,
    AnnexStatus,
}

impl StatusKind {
    const ALL: [Self; 3] = [Self::Fetch, Self::Status, Self::AnnexStatus];

    const fn suffix(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Status => "status",
            Self::AnnexStatus => "annex_status",
        }
    }

    const fn command(self) -> &'static str {
        match self {
            Self::Fetch => "git fetch",
            Self::Status => "git status",
            Self::AnnexStatus => "git annex status",
        }
    }
}

/// Cache key of one status kind.
#[must_use]
pub fn status_key(collection_id: &str, kind: &str) -> String {
    format!("webui:collection:{collection_id}:{kind}")
}

pub struct RepoStatusStore {
    ctx: SchedulerContext,
    vcs: Arc<dyn VcsStatus>,
}

impl RepoStatusStore {
    #[must_use]
    pub fn new(ctx: SchedulerContext, vcs: Arc<dyn VcsStatus>) -> Self {
        Self { ctx, vcs }
    }

    fn ttl(&self, kind: StatusKind) -> Option<Duration> {
        let config = &self.ctx.config;
        ttl_from_secs(match kind {
            StatusKind::Fetch => config.repo_fetch_timeout,
            StatusKind::Status => config.repo_status_timeout,
            StatusKind::AnnexStatus => config.repo_annex_status_timeout,
        })
    }

    fn cached_or_run(
        &self,
        collection: &Collection,
        kind: StatusKind,
        force: bool,
    ) -> Result<StatusOutput> {
        let metrics = &global_metrics().cache;
        let key = status_key(&collection.id.id, kind.suffix());
        if !force {
            if let Some(raw) = self.ctx.cache.get(&key)? {
                match serde_json::from_str::<StatusOutput>(&raw) {
                    Ok(out) => {
                        metrics.status_hits_total.inc();
                        return Ok(out);
                    }
                    Err(e) => tracing::warn!(key = %key, "malformed status entry: {e}"),
                }
            }
        }
        metrics.status_misses_total.inc();

        let out = match kind {
            StatusKind::Fetch => self.vcs.fetch(&collection.path)?,
            StatusKind::Status => self.vcs.status(&collection.path)?,
            StatusKind::AnnexStatus => self.vcs.annex_status(&collection.path)?,
        };
        if !out.success() {
            return Err(Error::StatusCommand {
                command: kind.command().to_string(),
                code: out.exit_code,
                output: out.text,
            });
        }
        self.ctx
            .cache
            .set(&key, &serde_json::to_string(&out)?, self.ttl(kind))?;
        Ok(out)
    }

    pub fn repo_fetch(&self, collection: &Collection, force: bool) -> Result<StatusOutput> {
        self.cached_or_run(collection, StatusKind::Fetch, force)
    }

    pub fn repo_status(&self, collection: &Collection, force: bool) -> Result<StatusOutput> {
        self.cached_or_run(collection, StatusKind::Status, force)
    }

    pub fn repo_annex_status(&self, collection: &Collection, force: bool) -> Result<StatusOutput> {
        self.cached_or_run(collection, StatusKind::AnnexStatus, force)
    }

    /// Drop all three cached kinds and mark the persisted snapshot stale.
    /// Called after every write to the collection.
    ///
    /// A stale snapshot is due on the next tick regardless of its age.
    pub fn cache_delete(&self, collection_id: &str) -> Result<()> {
        for kind in StatusKind::ALL {
            self.ctx
                .cache
                .delete(&status_key(collection_id, kind.suffix()))?;
        }
        if let Some(mut snapshot) = self.read_snapshot(collection_id)? {
            if !snapshot.stale {
                snapshot.stale = true;
                write_json_atomic(&self.snapshot_path(collection_id), &snapshot)?;
            }
        }
        tracing::debug!(collection = collection_id, "status cache invalidated");
        Ok(())
    }

    /// Sync state from the (possibly cached) status output.
    pub fn repo_state(&self, collection: &Collection) -> Result<RepoState> {
        Ok(RepoState::parse(&self.repo_status(collection, false)?.text))
    }

    fn snapshot_path(&self, collection_id: &str) -> PathBuf {
        self.ctx.snapshot_dir().join(format!("{collection_id}.json"))
    }

    /// Last persisted snapshot, if any. Unreadable snapshots read as absent.
    pub fn read_snapshot(&self, collection_id: &str) -> Result<Option<StatusSnapshot>> {
        let path = self.snapshot_path(collection_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(path = %path.display(), "malformed status snapshot: {e}");
                Ok(None)
            }
        }
    }

    /// Recompute status and annex status, bypassing the cache, and persist
    /// the snapshot.
    pub fn refresh(&self, collection: &Collection) -> Result<StatusSnapshot> {
        if !collection.path.is_dir() {
            return Err(Error::CollectionNotFound(collection.path.display().to_string()));
        }
        let started = Instant::now();
        let status = self.repo_status(collection, true)?;
        let annex_status = self.repo_annex_status(collection, true)?;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let snapshot = StatusSnapshot {
            collection_id: collection.id.id.clone(),
            checked_at: Utc::now(),
            elapsed_ms,
            state: RepoState::parse(&status.text),
            status,
            annex_status,
            stale: false,
        };
        write_json_atomic(&self.snapshot_path(&collection.id.id), &snapshot)?;
        tracing::debug!(
            collection = %collection.id,
            elapsed_ms,
            state = ?snapshot.state,
            "status refreshed"
        );
        Ok(snapshot)
    }

    /// Status for display: cached values where live, recomputed on a miss,
    /// and the last snapshot (marked stale) if recomputation fails.
    pub fn current(&self, collection: &Collection) -> Result<StatusSnapshot> {
        let started = Instant::now();
        let fresh = self.repo_status(collection, false).and_then(|status| {
            let annex_status = self.repo_annex_status(collection, false)?;
            Ok((status, annex_status))
        });
        match fresh {
            Ok((status, annex_status)) => Ok(StatusSnapshot {
                collection_id: collection.id.id.clone(),
                checked_at: Utc::now(),
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                state: RepoState::parse(&status.text),
                status,
                annex_status,
                stale: false,
            }),
            Err(e) => match self.read_snapshot(&collection.id.id)? {
                Some(mut snapshot) => {
                    tracing::warn!(
                        collection = %collection.id,
                        "status unavailable, serving snapshot from {}: {e}",
                        snapshot.checked_at
                    );
                    global_metrics().cache.status_stale_fallbacks_total.inc();
                    snapshot.stale = true;
                    Ok(snapshot)
                }
                None => Err(e),
            },
        }
    }
}

//! Cached gitolite info: which repository namespaces the active SSH
//! identity may reach.
//!
//! Interactive callers read [`AccessCache::get_repos_orgs`], which only
//! queries the server on a cold cache. A periodic task calls
//! [`AccessCache::refresh`] to re-query once the entry is older than the
//! cutoff, well before the cache TTL would expire it.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use ddr_sync_core::{Error, Result, global_metrics, ttl_from_secs};

use crate::context::SchedulerContext;

/// Cache key of the gitolite info entry.
pub const GITOLITE_INFO_KEY: &str = "webui:gitolite_info";

/// Remote access-control endpoint.
pub trait AccessControl: Send + Sync {
    /// Identifier of the endpoint, recorded in the cached entry.
    fn endpoint(&self) -> &str;

    /// Raw info text. An empty string means the server returned no data.
    fn query(&self) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Gitolite over SSH
// ---------------------------------------------------------------------------

/// `ssh <server> info`, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct GitoliteSsh {
    server: String,
    timeout: Duration,
}

impl GitoliteSsh {
    #[must_use]
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

impl AccessControl for GitoliteSsh {
    fn endpoint(&self) -> &str {
        &self.server
    }

    fn query(&self) -> Result<String> {
        let connect_timeout = format!("ConnectTimeout={}", self.timeout.as_secs().max(1));
        let mut child = Command::new("ssh")
            .args(["-T", "-o", "BatchMode=yes", "-o", &connect_timeout])
            .arg(&self.server)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        // drain stdout on a thread so a chatty server cannot fill the pipe
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::AccessUnavailable(format!("{}: no stdout", self.server)))?;
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf);
            buf
        });

        let started = Instant::now();
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::AccessUnavailable(format!(
                    "{}: timed out after {}s",
                    self.server,
                    self.timeout.as_secs()
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        reader
            .join()
            .map_err(|_| Error::AccessUnavailable(format!("{}: reader panicked", self.server)))
    }
}

// ---------------------------------------------------------------------------
// Info parsing
// ---------------------------------------------------------------------------

fn banner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^hello ([^,\s]+), this is").expect("valid regex"))
}

fn org_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+-[a-z]+[a-z0-9]*$").expect("valid regex"))
}

fn collection_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+-[a-z]+[a-z0-9]*-\d+$").expect("valid regex"))
}

/// Parsed `info` output.
///
/// ```text
/// hello ddr, this is git@mits running gitolite3 v3.6.6 on git 2.1.4
///
///  R W C  ddr-densho-[0-9]+
///  R W    ddr-densho
///  R W    ddr-densho-10
///  R      ddr-testing
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitoliteInfo {
    pub username: Option<String>,
    /// `(permissions, pattern)` pairs in server order.
    pub repos: Vec<(String, String)>,
}

impl GitoliteInfo {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut info = Self::default();
        for line in raw.lines() {
            let line = line.trim();
            if let Some(caps) = banner_re().captures(line) {
                info.username = Some(caps[1].to_string());
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some((pattern, perms)) = tokens.split_last() else {
                continue;
            };
            if perms.is_empty() || !perms.iter().all(|p| matches!(*p, "R" | "W" | "C")) {
                continue;
            }
            info.repos.push((perms.join(" "), (*pattern).to_string()));
        }
        info
    }

    /// Whether the server greeted us.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.username.is_some()
    }

    fn writable_literals(&self) -> impl Iterator<Item = &str> {
        self.repos
            .iter()
            .filter(|(perms, _)| perms.contains('R') && perms.contains('W'))
            .map(|(_, pattern)| pattern.as_str())
    }

    /// Literal organization ids (`ddr-densho`). Wildcard and collection
    /// patterns are ignored.
    #[must_use]
    pub fn orgs(&self) -> Vec<String> {
        let mut orgs: Vec<String> = Vec::new();
        for pattern in self.writable_literals() {
            if org_re().is_match(pattern) && !orgs.iter().any(|o| o == pattern) {
                orgs.push(pattern.to_string());
            }
        }
        orgs
    }

    /// Literal collection repositories (`ddr-densho-10`).
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut repos: Vec<String> = Vec::new();
        for pattern in self.writable_literals() {
            if collection_re().is_match(pattern) && !repos.iter().any(|r| r == pattern) {
                repos.push(pattern.to_string());
            }
        }
        repos
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Stored gitolite info with the time and endpoint it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub raw_info: String,
}

impl AccessEntry {
    /// Whether this is a negative (no data) entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw_info.trim().is_empty()
    }

    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}

/// Result of a [`AccessCache::refresh`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Entry is younger than the cutoff; nothing queried.
    Fresh { age: Duration },
    /// Server was queried and the entry rewritten.
    Refreshed { orgs: usize },
}

pub struct AccessCache {
    ctx: SchedulerContext,
    endpoint: Arc<dyn AccessControl>,
}

impl AccessCache {
    #[must_use]
    pub fn new(ctx: SchedulerContext, endpoint: Arc<dyn AccessControl>) -> Self {
        Self { ctx, endpoint }
    }

    /// Cached entry, or `None` if absent or unparseable.
    pub fn cached_entry(&self) -> Result<Option<AccessEntry>> {
        let Some(raw) = self.ctx.cache.get(GITOLITE_INFO_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<AccessEntry>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("malformed gitolite info entry, treating as missing: {e}");
                Ok(None)
            }
        }
    }

    /// Store an entry with the regular TTL.
    pub fn store_entry(&self, entry: &AccessEntry) -> Result<()> {
        let ttl = ttl_from_secs(self.ctx.config.gitolite_info_cache_timeout);
        self.ctx
            .cache
            .set(GITOLITE_INFO_KEY, &serde_json::to_string(entry)?, ttl)
    }

    /// Query the endpoint and store the result.
    ///
    /// A failed or empty query is cached as an empty entry for the short
    /// negative TTL and reported as [`Error::AccessUnavailable`].
    fn query_and_store(&self) -> Result<AccessEntry> {
        let metrics = &global_metrics().cache;
        metrics.access_queries_total.inc();
        let source = self.endpoint.endpoint().to_string();
        let raw_info = match self.endpoint.query() {
            Ok(raw) if !raw.trim().is_empty() => raw,
            Ok(_) => {
                metrics.access_failures_total.inc();
                return Err(self.store_negative(&source, "no data returned"));
            }
            Err(e) => {
                metrics.access_failures_total.inc();
                return Err(self.store_negative(&source, &e.to_string()));
            }
        };
        let entry = AccessEntry {
            timestamp: Utc::now(),
            source,
            raw_info,
        };
        self.store_entry(&entry)?;
        tracing::info!(endpoint = %entry.source, "gitolite info refreshed");
        Ok(entry)
    }

    fn store_negative(&self, source: &str, reason: &str) -> Error {
        tracing::warn!(endpoint = %source, "gitolite info unavailable: {reason}");
        let entry = AccessEntry {
            timestamp: Utc::now(),
            source: source.to_string(),
            raw_info: String::new(),
        };
        let ttl = ttl_from_secs(self.ctx.config.gitolite_info_negative_ttl);
        let stored = serde_json::to_string(&entry)
            .map_err(Error::from)
            .and_then(|json| self.ctx.cache.set(GITOLITE_INFO_KEY, &json, ttl));
        if let Err(e) = stored {
            tracing::warn!("failed to cache negative gitolite info: {e}");
        }
        Error::AccessUnavailable(format!("{source}: {reason}"))
    }

    /// Parsed info, querying the server only on a cold cache.
    pub fn info(&self) -> Result<GitoliteInfo> {
        let entry = match self.cached_entry()? {
            Some(entry) => entry,
            None => self.query_and_store()?,
        };
        if entry.is_empty() {
            return Err(Error::AccessUnavailable(format!(
                "{}: no data (cached)",
                entry.source
            )));
        }
        Ok(GitoliteInfo::parse(&entry.raw_info))
    }

    /// Organization ids of the configured repository (`ddr-*`) the active
    /// credential may reach.
    pub fn get_repos_orgs(&self) -> Result<Vec<String>> {
        let prefix = format!("{}-", self.ctx.config.repo);
        Ok(self
            .info()?
            .orgs()
            .into_iter()
            .filter(|org| org.starts_with(&prefix))
            .collect())
    }

    /// Re-query if the entry is missing, malformed, negative or older than
    /// the cutoff.
    pub fn refresh(&self) -> Result<RefreshOutcome> {
        let cutoff = Duration::from_secs(self.ctx.config.gitolite_info_cache_cutoff);
        if let Some(entry) = self.cached_entry()? {
            let age = entry.age(Utc::now());
            if !entry.is_empty() && age <= cutoff {
                tracing::debug!(age_secs = age.as_secs(), "gitolite info still fresh");
                return Ok(RefreshOutcome::Fresh { age });
            }
        }
        let entry = self.query_and_store()?;
        Ok(RefreshOutcome::Refreshed {
            orgs: GitoliteInfo::parse(&entry.raw_info).orgs().len(),
        })
    }
}

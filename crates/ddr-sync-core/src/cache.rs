//! Shared key/value cache with per-key TTL.
//!
//! The web process and the background scheduler coordinate through this
//! store: it holds the gitolite info entry, the per-collection status
//! entries, and doubles as the scheduler mutex through the atomic
//! [`CacheStore::add`] and [`CacheStore::delete_if`].
//!
//! - [`MemoryCache`]: single-process, `RwLock<HashMap>` with expiry
//! - [`FileCache`]: one JSON file per key, shared across processes
//!
//! A TTL of `None` keeps the entry until it is deleted.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::Result;

/// Generic get/set/add-if-absent/delete store.
pub trait CacheStore: Send + Sync {
    /// Fetch a live value. Expired entries read as absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any existing entry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if no live entry exists. Returns `true` if stored.
    fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Remove an entry. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Remove the entry only if its live value is `expected`, atomically with
    /// respect to [`CacheStore::add`]. Returns `true` if removed.
    fn delete_if(&self, key: &str, expected: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    value: String,
    expires: Option<Instant>,
}

impl CacheEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process cache. Share it between threads behind an `Arc`.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let map = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.values().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.retain(|_, e| !e.is_expired());
        map.insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if map.get(key).is_some_and(|e| !e.is_expired()) {
            return Ok(false);
        }
        map.insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(key);
        Ok(())
    }

    fn delete_if(&self, key: &str, expected: &str) -> Result<bool> {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if map
            .get(key)
            .is_some_and(|e| !e.is_expired() && e.value == expected)
        {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// File-backed cache
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    key: String,
    expires_ts: Option<f64>,
    value: String,
}

impl FileEntry {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_ts.is_some_and(|at| now >= at)
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn sha1_hex(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory-backed cache shared between processes.
///
/// Entries are written to a temporary file and renamed into place, so readers
/// never observe a partial entry. `add` and `delete_if` run under an
/// exclusive `flock` on `<dir>/.cache.lock`.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Open (and create) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sha1_hex(key)))
    }

    fn read_entry(&self, key: &str) -> Result<Option<FileEntry>> {
        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<FileEntry>(&content) {
            Ok(entry) if entry.key == key => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::debug!(path = %path.display(), "unreadable cache entry: {e}");
                Ok(None)
            }
        }
    }

    fn write_entry(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = FileEntry {
            key: key.to_string(),
            expires_ts: ttl.map(|t| now_ts() + t.as_secs_f64()),
            value: value.to_string(),
        };
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            sha1_hex(key),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove_entry(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `f` under the exclusive `flock` on `<dir>/.cache.lock`.
    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        use fs2::FileExt;

        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(".cache.lock"))?;
        lock_file.lock_exclusive()?;
        let result = f();
        let _ = FileExt::unlock(&lock_file);
        result
    }
}

impl CacheStore for FileCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_ts();
        Ok(self
            .read_entry(key)?
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.write_entry(key, value, ttl)
    }

    fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.locked(|| {
            let now = now_ts();
            if self.read_entry(key)?.is_some_and(|e| !e.is_expired(now)) {
                return Ok(false);
            }
            self.write_entry(key, value, ttl)?;
            Ok(true)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.remove_entry(key)
    }

    fn delete_if(&self, key: &str, expected: &str) -> Result<bool> {
        self.locked(|| {
            let now = now_ts();
            let matches = self
                .read_entry(key)?
                .is_some_and(|e| !e.is_expired(now) && e.value == expected);
            if matches {
                self.remove_entry(key)?;
            }
            Ok(matches)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn exercise_basic(cache: &dyn CacheStore) {
        assert!(cache.get("k").unwrap().is_none());
        cache.set("k", "v1", None).unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v1"));
        cache.set("k", "v2", Some(Duration::from_secs(60))).unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v2"));
        cache.delete("k").unwrap();
        assert!(cache.get("k").unwrap().is_none());
        // deleting twice is fine
        cache.delete("k").unwrap();
    }

    fn exercise_add(cache: &dyn CacheStore) {
        assert!(cache.add("lock", "a", Some(Duration::from_secs(60))).unwrap());
        assert!(!cache.add("lock", "b", Some(Duration::from_secs(60))).unwrap());
        assert_eq!(cache.get("lock").unwrap().as_deref(), Some("a"));
        cache.delete("lock").unwrap();
        assert!(cache.add("lock", "c", None).unwrap());
    }

    fn exercise_delete_if(cache: &dyn CacheStore) {
        cache.set("owner", "token-a", None).unwrap();
        assert!(!cache.delete_if("owner", "token-b").unwrap());
        assert_eq!(cache.get("owner").unwrap().as_deref(), Some("token-a"));
        assert!(cache.delete_if("owner", "token-a").unwrap());
        assert!(cache.get("owner").unwrap().is_none());
        assert!(!cache.delete_if("owner", "token-a").unwrap());
    }

    fn exercise_expiry(cache: &dyn CacheStore) {
        cache
            .set("short", "x", Some(Duration::from_millis(20)))
            .unwrap();
        assert!(cache.get("short").unwrap().is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("short").unwrap().is_none());
        // an expired entry does not block add
        assert!(cache.add("short", "y", None).unwrap());
    }

    #[test]
    fn memory_cache_basic() {
        let cache = MemoryCache::new();
        exercise_basic(&cache);
        exercise_add(&cache);
        exercise_delete_if(&cache);
        exercise_expiry(&cache);
    }

    #[test]
    fn file_cache_basic() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path().join("cache")).unwrap();
        exercise_basic(&cache);
        exercise_add(&cache);
        exercise_delete_if(&cache);
        exercise_expiry(&cache);
    }

    #[test]
    fn file_cache_shared_between_handles() {
        let tmp = TempDir::new().unwrap();
        let a = FileCache::open(tmp.path()).unwrap();
        let b = FileCache::open(tmp.path()).unwrap();
        a.set("webui:gitolite_info", "info", None).unwrap();
        assert_eq!(
            b.get("webui:gitolite_info").unwrap().as_deref(),
            Some("info")
        );
    }

    #[test]
    fn file_cache_ignores_corrupt_entries() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        fs::write(cache.entry_path("k"), "{not json").unwrap();
        assert!(cache.get("k").unwrap().is_none());
        assert!(cache.add("k", "v", None).unwrap());
    }

    #[test]
    fn concurrent_add_has_single_winner() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(FileCache::open(tmp.path()).unwrap());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .add("gitstatus-lock", &i.to_string(), Some(Duration::from_secs(60)))
                        .unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

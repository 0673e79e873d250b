//! Advisory sentinel-file locks shared by foreground operations and the
//! background scheduler.
//!
//! Two kinds of sentinel live under `<base>/tmp`:
//! - `gitstatus-stop`: the global stop flag; while present the scheduler loop
//!   exits and single ticks do nothing.
//! - `locks/<name>.lock`: one sentinel per named operation
//!   (`collection_edit`, `entity_add_file`, `reindex`, ...). A name may be
//!   scoped to one collection as `<operation>@<collection_id>`.
//!
//! Presence is the only signal. File content is an RFC3339 timestamp for
//! humans. Sentinels survive process and cache restarts, so a crashed holder
//! leaves its lock in place until someone runs `unlock`.

use std::fs;
use std::io::{ErrorKind, Write as IoWrite};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use ddr_sync_core::{Error, Identifier, IdentifierKind, Result};

const STOP_FLAG: &str = "gitstatus-stop";
const LOCK_EXT: &str = "lock";

fn tmp_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("tmp")
}

/// Directory holding named operation sentinels.
#[must_use]
pub fn lock_dir(base_dir: &Path) -> PathBuf {
    tmp_dir(base_dir).join("locks")
}

/// Path of the global stop flag.
#[must_use]
pub fn stop_flag_path(base_dir: &Path) -> PathBuf {
    tmp_dir(base_dir).join(STOP_FLAG)
}

// ---------------------------------------------------------------------------
// Lock names
// ---------------------------------------------------------------------------

/// A validated lock name: an operation kind, optionally scoped to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockName {
    pub operation: String,
    pub collection_id: Option<String>,
}

impl LockName {
    /// Parse `operation` or `operation@collection_id`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (operation, scope) = match raw.split_once('@') {
            Some((op, scope)) => (op, Some(scope)),
            None => (raw, None),
        };
        let valid_op = !operation.is_empty()
            && operation
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid_op {
            return Err(Error::InvalidArgument(format!("invalid lock name: {raw:?}")));
        }
        let collection_id = match scope {
            None => None,
            Some(scope) => {
                let id = Identifier::parse(scope)?;
                if id.kind != IdentifierKind::Collection {
                    return Err(Error::InvalidArgument(format!(
                        "lock scope must be a collection id: {scope:?}"
                    )));
                }
                Some(id.id)
            }
        };
        Ok(Self {
            operation: operation.to_string(),
            collection_id,
        })
    }

    /// Lock scoped to a single collection.
    pub fn scoped(operation: &str, collection_id: &str) -> Result<Self> {
        Self::parse(&format!("{operation}@{collection_id}"))
    }

    /// Whether this lock keeps the scheduler away from `collection_id`.
    /// Unscoped locks block every collection.
    #[must_use]
    pub fn blocks(&self, collection_id: &str) -> bool {
        self.collection_id
            .as_deref()
            .is_none_or(|scope| scope == collection_id)
    }

    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.collection_id.is_some()
    }

    fn sentinel_path(&self, base_dir: &Path) -> PathBuf {
        lock_dir(base_dir).join(format!("{self}.{LOCK_EXT}"))
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.collection_id {
            Some(cid) => write!(f, "{}@{cid}", self.operation),
            None => f.write_str(&self.operation),
        }
    }
}

// ---------------------------------------------------------------------------
// Sentinel primitives
// ---------------------------------------------------------------------------

/// Create a sentinel exclusively. Returns `false` if it already existed.
fn create_sentinel(path: &Path) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            writeln!(file, "{}", Utc::now().to_rfc3339())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a sentinel. Returns `false` if it was not there.
fn remove_sentinel(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Set a named lock. Idempotent: locking a held lock is a no-op.
///
/// Returns `true` if this call created the sentinel.
pub fn lock(base_dir: &Path, name: &str) -> Result<bool> {
    let name = LockName::parse(name)?;
    let created = create_sentinel(&name.sentinel_path(base_dir))?;
    if created {
        tracing::debug!(lock = %name, "lock set");
    }
    Ok(created)
}

/// Clear a named lock. Idempotent: unlocking a free lock is a no-op.
///
/// Returns `true` if this call removed the sentinel.
pub fn unlock(base_dir: &Path, name: &str) -> Result<bool> {
    let name = LockName::parse(name)?;
    let removed = remove_sentinel(&name.sentinel_path(base_dir))?;
    if removed {
        tracing::debug!(lock = %name, "lock cleared");
    }
    Ok(removed)
}

/// Whether a named lock is currently held.
pub fn is_locked(base_dir: &Path, name: &str) -> Result<bool> {
    Ok(LockName::parse(name)?.sentinel_path(base_dir).exists())
}

/// Whether the global stop flag is present.
#[must_use]
pub fn locked(base_dir: &Path) -> bool {
    stop_flag_path(base_dir).exists()
}

/// Raise the global stop flag. Returns `true` if it was not already raised.
pub fn stop(base_dir: &Path) -> Result<bool> {
    let created = create_sentinel(&stop_flag_path(base_dir))?;
    if created {
        tracing::info!(base = %base_dir.display(), "gitstatus stop flag raised");
    }
    Ok(created)
}

/// Lower the global stop flag. Returns `true` if it was raised.
pub fn start(base_dir: &Path) -> Result<bool> {
    let removed = remove_sentinel(&stop_flag_path(base_dir))?;
    if removed {
        tracing::info!(base = %base_dir.display(), "gitstatus stop flag cleared");
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// A held lock, as reported for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub name: LockName,
    pub path: PathBuf,
    pub created: Option<DateTime<Utc>>,
}

/// List held named locks, sorted by name. Unparseable sentinels are skipped.
pub fn list_locks(base_dir: &Path) -> Result<Vec<LockInfo>> {
    let dir = lock_dir(base_dir);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut locks = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|e| e != LOCK_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(name) = LockName::parse(stem) else {
            tracing::warn!(path = %path.display(), "ignoring unrecognised lock sentinel");
            continue;
        };
        // content is informational only
        let created = fs::read_to_string(&path)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc));
        locks.push(LockInfo {
            name,
            path,
            created,
        });
    }
    locks.sort_by(|a, b| a.name.to_string().cmp(&b.name.to_string()));
    Ok(locks)
}

/// First held lock that keeps the scheduler away from `collection_id`.
///
/// With `None`, only unscoped (operation-wide) locks are considered.
pub fn blocking_lock(base_dir: &Path, collection_id: Option<&str>) -> Result<Option<LockName>> {
    Ok(list_locks(base_dir)?
        .into_iter()
        .map(|info| info.name)
        .find(|name| match collection_id {
            Some(cid) => name.blocks(cid),
            None => !name.is_scoped(),
        }))
}

// ---------------------------------------------------------------------------
// Scoped acquisition
// ---------------------------------------------------------------------------

/// Exclusive named lock released on drop.
///
/// Unlike [`lock`], acquisition fails if the sentinel already exists, so two
/// foreground operations of the same kind cannot overlap.
#[derive(Debug)]
pub struct NamedLock {
    name: LockName,
    path: PathBuf,
    held: bool,
}

impl NamedLock {
    pub fn new(base_dir: &Path, name: &str) -> Result<Self> {
        let name = LockName::parse(name)?;
        let path = name.sentinel_path(base_dir);
        Ok(Self {
            name,
            path,
            held: false,
        })
    }

    #[must_use]
    pub fn name(&self) -> &LockName {
        &self.name
    }

    /// Try to take the lock. Returns `false` if someone else holds it.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        self.held = create_sentinel(&self.path)?;
        Ok(self.held)
    }

    /// Take the lock or fail with [`Error::LockBusy`].
    pub fn acquire(&mut self) -> Result<()> {
        if self.try_acquire()? {
            Ok(())
        } else {
            Err(Error::LockBusy(self.name.to_string()))
        }
    }

    /// Release the lock if this handle holds it.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        remove_sentinel(&self.path)?;
        Ok(())
    }

    /// Whether the sentinel exists (held by anyone).
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(lock = %self.name, "failed to release lock: {e}");
        }
    }
}

/// Execute a closure while holding a named lock.
///
/// The lock is released on every exit path, including errors and panics.
pub fn with_lock<F, T>(base_dir: &Path, name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let mut lock = NamedLock::new(base_dir, name)?;
    lock.acquire()?;
    let result = f();
    lock.release()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();

        assert!(lock(base, "collection_edit").unwrap());
        assert!(!lock(base, "collection_edit").unwrap());
        assert!(is_locked(base, "collection_edit").unwrap());

        assert!(unlock(base, "collection_edit").unwrap());
        assert!(!is_locked(base, "collection_edit").unwrap());
    }

    #[test]
    fn unlock_absent_is_noop() {
        let tmp = TempDir::new().unwrap();
        assert!(!unlock(tmp.path(), "reindex").unwrap());
    }

    #[test]
    fn sentinel_contains_timestamp() {
        let tmp = TempDir::new().unwrap();
        lock(tmp.path(), "entity_add_file").unwrap();
        let locks = list_locks(tmp.path()).unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].name.operation, "entity_add_file");
        assert!(locks[0].created.is_some());
    }

    #[test]
    fn stop_flag_round_trip() {
        let tmp = TempDir::new().unwrap();
        assert!(!locked(tmp.path()));
        assert!(stop(tmp.path()).unwrap());
        assert!(!stop(tmp.path()).unwrap());
        assert!(locked(tmp.path()));
        assert!(start(tmp.path()).unwrap());
        assert!(!locked(tmp.path()));
        assert!(!start(tmp.path()).unwrap());
    }

    #[test]
    fn lock_names_are_validated() {
        let tmp = TempDir::new().unwrap();
        assert!(lock(tmp.path(), "../escape").is_err());
        assert!(lock(tmp.path(), "").is_err());
        assert!(lock(tmp.path(), "edit@ddr-test-123-4").is_err());
        assert!(lock(tmp.path(), "edit@ddr-test-123").unwrap());
    }

    #[test]
    fn scoped_locks_only_block_their_collection() {
        let name = LockName::parse("collection_edit@ddr-test-123").unwrap();
        assert!(name.blocks("ddr-test-123"));
        assert!(!name.blocks("ddr-test-124"));

        let coarse = LockName::parse("entity_add_file").unwrap();
        assert!(coarse.blocks("ddr-test-123"));
        assert!(coarse.blocks("ddr-test-124"));
    }

    #[test]
    fn blocking_lock_respects_scope() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        lock(base, "collection_edit@ddr-test-123").unwrap();

        assert_eq!(blocking_lock(base, None).unwrap(), None);
        assert!(blocking_lock(base, Some("ddr-test-124")).unwrap().is_none());
        let held = blocking_lock(base, Some("ddr-test-123")).unwrap().unwrap();
        assert_eq!(held.to_string(), "collection_edit@ddr-test-123");

        lock(base, "reindex").unwrap();
        assert_eq!(
            blocking_lock(base, None).unwrap().map(|n| n.to_string()),
            Some("reindex".to_string())
        );
    }

    #[test]
    fn named_lock_is_exclusive_and_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        {
            let mut first = NamedLock::new(base, "collection_sync").unwrap();
            first.acquire().unwrap();
            let mut second = NamedLock::new(base, "collection_sync").unwrap();
            assert!(matches!(second.acquire(), Err(Error::LockBusy(_))));
            // the loser must not remove the winner's sentinel on drop
        }
        assert!(!is_locked(base, "collection_sync").unwrap());
    }

    #[test]
    fn with_lock_releases_on_error() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        let result: Result<()> = with_lock(base, "collection_edit", || {
            assert!(is_locked(base, "collection_edit").unwrap());
            Err(Error::InvalidArgument("boom".into()))
        });
        assert!(result.is_err());
        assert!(!is_locked(base, "collection_edit").unwrap());
    }
}

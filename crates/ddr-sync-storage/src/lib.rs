//! Background repository synchronization and metadata inheritance for DDR
//! collections.
//!
//! - [`access`]: cached gitolite info (which orgs the SSH identity reaches)
//! - [`status`]: per-collection cached git / annex status
//! - [`queue`] + [`scheduler`]: the persisted work queue and the tick loop
//! - [`locks`] + [`operation`]: sentinel locks that pause the scheduler
//! - [`inherit`]: propagation of parent field values to descendants
//!
//! All coordination between the web process and the scheduler goes through
//! the filesystem and the shared [`ddr_sync_core::CacheStore`].

#![forbid(unsafe_code)]

pub mod access;
pub mod collection;
pub mod context;
pub mod inherit;
pub mod locks;
pub mod operation;
pub mod queue;
pub mod scheduler;
pub mod status;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use access::{AccessCache, AccessControl, AccessEntry, GitoliteInfo, GitoliteSsh};
pub use collection::{Collection, CollectionInventory, FsInventory};
pub use context::SchedulerContext;
pub use ddr_sync_core::{Error, Result};
pub use inherit::{ChangeSet, FieldSchema, InheritanceEngine, ModelKind};
pub use locks::{LockName, NamedLock};
pub use operation::OperationGuard;
pub use queue::SyncQueue;
pub use scheduler::{LoopExit, SyncScheduler, TickOutcome};
pub use status::{GitCli, RepoState, RepoStatusStore, StatusOutput, StatusSnapshot, VcsStatus};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write pretty JSON via a sibling temp file and rename, creating parent
/// directories as needed.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(&tmp, content)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

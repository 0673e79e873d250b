//! Scoped foreground write operations.
//!
//! An [`OperationGuard`] holds a named lock for the duration of an edit, sync
//! or file import. When it goes out of scope, on success or failure, it
//! invalidates the collection's status cache, moves the collection to the
//! front of the gitstatus queue and only then releases the lock, so the
//! scheduler never reads status from before the write.

use ddr_sync_core::Result;

use crate::collection::Collection;
use crate::locks::{LockName, NamedLock};
use crate::scheduler::SyncScheduler;

pub struct OperationGuard<'a> {
    scheduler: &'a SyncScheduler,
    collection: Collection,
    lock: NamedLock,
}

impl<'a> OperationGuard<'a> {
    /// Take the operation lock for `collection`.
    ///
    /// A scoped lock (`operation@collection_id`) only keeps the scheduler
    /// away from this collection; an unscoped one pauses it entirely.
    pub fn acquire(
        scheduler: &'a SyncScheduler,
        operation: &str,
        collection: &Collection,
        scoped: bool,
    ) -> Result<Self> {
        let name = if scoped {
            LockName::scoped(operation, &collection.id.id)?.to_string()
        } else {
            operation.to_string()
        };
        let mut lock = NamedLock::new(scheduler.context().base_dir(), &name)?;
        lock.acquire()?;
        tracing::debug!(lock = %name, collection = %collection.id, "operation started");
        Ok(Self {
            scheduler,
            collection: collection.clone(),
            lock,
        })
    }

    #[must_use]
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    #[must_use]
    pub fn lock_name(&self) -> &LockName {
        self.lock.name()
    }

    fn finish(&mut self) -> Result<()> {
        self.scheduler
            .status()
            .cache_delete(&self.collection.id.id)?;
        self.scheduler.queue().push_front(&self.collection.path)?;
        self.lock.release()
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(
                collection = %self.collection.id,
                lock = %self.lock.name(),
                "operation cleanup incomplete: {e}"
            );
        }
    }
}

/// Run `f` inside an [`OperationGuard`].
pub fn with_operation<F, T>(
    scheduler: &SyncScheduler,
    operation: &str,
    collection: &Collection,
    scoped: bool,
    f: F,
) -> Result<T>
where
    F: FnOnce(&Collection) -> Result<T>,
{
    let guard = OperationGuard::acquire(scheduler, operation, collection, scoped)?;
    f(guard.collection())
}

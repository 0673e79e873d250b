//! Persisted FIFO of collection paths awaiting a background status refresh.
//!
//! The queue file is a single JSON array of absolute path strings, read and
//! rewritten wholesale. It is the only source of truth: nothing is kept in
//! memory between calls, so a restarted scheduler resumes where it stopped.
//! Read-modify-write cycles run under an exclusive `flock` on a sibling
//! `.lock` file so the web process can enqueue while the scheduler pops.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use ddr_sync_core::{Result, global_metrics};

use crate::write_json_atomic;

#[derive(Debug, Clone)]
pub struct SyncQueue {
    path: PathBuf,
}

impl SyncQueue {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Run `f` on the current contents under the queue lock, persisting the
    /// returned list if it is `Some`.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Vec<PathBuf>) -> Result<(T, bool)>,
    ) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;

        let result = (|| -> Result<T> {
            let mut entries = match self.read()? {
                Some(entries) => entries,
                None => {
                    // first run: materialise the empty queue
                    write_json_atomic(&self.path, &Vec::<String>::new())?;
                    Vec::new()
                }
            };
            let (value, dirty) = f(&mut entries)?;
            if dirty {
                self.write(&entries)?;
            }
            global_metrics()
                .scheduler
                .queue_depth
                .set(entries.len() as u64);
            Ok(value)
        })();

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    /// Read the persisted list. `None` means the file does not exist; an
    /// unparseable file reads as empty.
    fn read(&self) -> Result<Option<Vec<PathBuf>>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Vec<String>>(&content) {
            Ok(paths) => Ok(Some(paths.into_iter().map(PathBuf::from).collect())),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "malformed queue file, treating as empty: {e}");
                Ok(Some(Vec::new()))
            }
        }
    }

    fn write(&self, entries: &[PathBuf]) -> Result<()> {
        let strings: Vec<String> = entries
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        write_json_atomic(&self.path, &strings)
    }

    /// Current contents, front first. A missing file reads as empty.
    pub fn load(&self) -> Result<Vec<PathBuf>> {
        Ok(self.read()?.unwrap_or_default())
    }

    /// Replace the whole queue.
    pub fn save(&self, entries: &[PathBuf]) -> Result<()> {
        self.update(|current| {
            current.clear();
            current.extend_from_slice(entries);
            Ok(((), true))
        })
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Pop the front entry without regenerating.
    pub fn pop_front(&self) -> Result<Option<PathBuf>> {
        self.update(|entries| {
            if entries.is_empty() {
                return Ok((None, false));
            }
            Ok((Some(entries.remove(0)), true))
        })
    }

    /// Pop the front entry, refilling the queue from `regenerate` first if it
    /// is empty. Returns `None` only when the regenerated inventory is empty.
    pub fn next_or_regenerate<F>(&self, regenerate: F) -> Result<Option<PathBuf>>
    where
        F: FnOnce() -> Result<Vec<PathBuf>>,
    {
        self.update(|entries| {
            let mut dirty = false;
            if entries.is_empty() {
                *entries = regenerate()?;
                global_metrics().scheduler.queue_regenerations_total.inc();
                tracing::info!(
                    path = %self.path.display(),
                    count = entries.len(),
                    "regenerated gitstatus queue"
                );
                dirty = true;
            }
            if entries.is_empty() {
                return Ok((None, dirty));
            }
            Ok((Some(entries.remove(0)), true))
        })
    }

    /// Schedule `path` to be checked next. An existing entry is moved up.
    pub fn push_front(&self, path: &Path) -> Result<()> {
        self.update(|entries| {
            entries.retain(|p| p != path);
            entries.insert(0, path.to_path_buf());
            Ok(((), true))
        })
    }

    /// Schedule `path` after everything else. An existing entry is moved down.
    pub fn push_back(&self, path: &Path) -> Result<()> {
        self.update(|entries| {
            entries.retain(|p| p != path);
            entries.push(path.to_path_buf());
            Ok(((), true))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/ddr/{n}"))).collect()
    }

    #[test]
    fn first_use_creates_empty_file() {
        let tmp = TempDir::new().unwrap();
        let queue = SyncQueue::new(tmp.path().join("tmp/gitstatus-queue.json"));
        assert!(queue.pop_front().unwrap().is_none());
        assert_eq!(fs::read_to_string(queue.path()).unwrap().trim(), "[]");
    }

    #[test]
    fn pops_in_enumeration_order() {
        let tmp = TempDir::new().unwrap();
        let queue = SyncQueue::new(tmp.path().join("q.json"));
        let original = paths(&["ddr-test-1", "ddr-test-2", "ddr-test-3"]);
        queue.save(&original).unwrap();

        let mut seen = Vec::new();
        while let Some(p) = queue.pop_front().unwrap() {
            seen.push(p);
        }
        assert_eq!(seen, original);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn regenerates_only_when_empty() {
        let tmp = TempDir::new().unwrap();
        let queue = SyncQueue::new(tmp.path().join("q.json"));
        queue.save(&paths(&["ddr-test-1"])).unwrap();

        let first = queue
            .next_or_regenerate(|| panic!("must not regenerate a non-empty queue"))
            .unwrap();
        assert_eq!(first, Some(PathBuf::from("/ddr/ddr-test-1")));

        let second = queue
            .next_or_regenerate(|| Ok(paths(&["ddr-test-7", "ddr-test-8"])))
            .unwrap();
        assert_eq!(second, Some(PathBuf::from("/ddr/ddr-test-7")));
        assert_eq!(queue.load().unwrap(), paths(&["ddr-test-8"]));
    }

    #[test]
    fn empty_inventory_yields_none() {
        let tmp = TempDir::new().unwrap();
        let queue = SyncQueue::new(tmp.path().join("q.json"));
        assert!(queue.next_or_regenerate(|| Ok(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn malformed_file_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("q.json");
        fs::write(&path, "{\"not\": \"a list\"").unwrap();
        let queue = SyncQueue::new(&path);
        let next = queue
            .next_or_regenerate(|| Ok(paths(&["ddr-test-1"])))
            .unwrap();
        assert_eq!(next, Some(PathBuf::from("/ddr/ddr-test-1")));
    }

    #[test]
    fn push_front_and_back_move_existing_entries() {
        let tmp = TempDir::new().unwrap();
        let queue = SyncQueue::new(tmp.path().join("q.json"));
        queue.save(&paths(&["a", "b", "c"])).unwrap();

        queue.push_front(Path::new("/ddr/c")).unwrap();
        assert_eq!(queue.load().unwrap(), paths(&["c", "a", "b"]));

        queue.push_back(Path::new("/ddr/c")).unwrap();
        assert_eq!(queue.load().unwrap(), paths(&["a", "b", "c"]));

        queue.push_front(Path::new("/ddr/d")).unwrap();
        assert_eq!(queue.len().unwrap(), 4);
    }
}

//! Locally present collection repositories.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ddr_sync_core::{Error, Identifier, IdentifierKind, Result};

/// Metadata file marking a directory as a collection repository.
pub const COLLECTION_JSON: &str = "collection.json";

/// A collection repository on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: Identifier,
    pub path: PathBuf,
}

impl Collection {
    /// Load the collection rooted at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let id = Identifier::from_path(path)?;
        if id.kind != IdentifierKind::Collection {
            return Err(Error::InvalidIdentifier(id.id));
        }
        if !path.join(COLLECTION_JSON).is_file() {
            return Err(Error::CollectionNotFound(path.display().to_string()));
        }
        Ok(Self {
            id,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn json_path(&self) -> PathBuf {
        self.path.join(COLLECTION_JSON)
    }
}

/// Enumerates collection repositories below a base path.
pub trait CollectionInventory: Send + Sync {
    /// Paths of the collections of `org` (e.g. `ddr-densho`) under `base_path`.
    fn list_collections(&self, base_path: &Path, repo: &str, org: &str) -> Result<Vec<PathBuf>>;
}

/// Directory scan of `base_path`: every `<org>-<n>` directory holding a
/// `collection.json`, ordered by collection number.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsInventory;

impl CollectionInventory for FsInventory {
    fn list_collections(&self, base_path: &Path, repo: &str, org: &str) -> Result<Vec<PathBuf>> {
        if !org.starts_with(&format!("{repo}-")) {
            return Ok(Vec::new());
        }
        let entries = match fs::read_dir(base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::StorageUnavailable(base_path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{org}-");
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(number) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.parse::<u64>().ok())
            else {
                continue;
            };
            if path.join(COLLECTION_JSON).is_file() {
                found.push((number, path));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }
}

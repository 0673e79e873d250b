//! DDR object identifiers.
//!
//! Identifiers are dash-separated: `ddr` (repository), `ddr-densho`
//! (organization), `ddr-densho-10` (collection), `ddr-densho-10-1` (entity),
//! `ddr-densho-10-1-2` (segment) and `ddr-densho-10-1-master-a1b2c3d4e5`
//! (file, `<entity>-<role>-<sha1 prefix>`).

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of object an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Repository,
    Organization,
    Collection,
    Entity,
    Segment,
    File,
}

impl IdentifierKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Organization => "organization",
            Self::Collection => "collection",
            Self::Entity => "entity",
            Self::Segment => "segment",
            Self::File => "file",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn file_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z]+-[a-z0-9]+-\d+(?:-\d+)+)-([a-z]+)-([0-9a-f]{10,40})$")
            .expect("valid regex")
    })
}

fn object_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z]+(?:-[a-z0-9]+(?:-\d+)*)?$")
            .expect("valid regex")
    })
}

/// A parsed DDR identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub id: String,
    pub kind: IdentifierKind,
}

impl Identifier {
    /// Parse an identifier string.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if file_id_re().is_match(id) {
            return Ok(Self {
                id: id.to_string(),
                kind: IdentifierKind::File,
            });
        }
        if !object_id_re().is_match(id) {
            return Err(Error::InvalidIdentifier(raw.to_string()));
        }
        let kind = match id.split('-').count() {
            1 => IdentifierKind::Repository,
            2 => IdentifierKind::Organization,
            3 => IdentifierKind::Collection,
            4 => IdentifierKind::Entity,
            _ => IdentifierKind::Segment,
        };
        Ok(Self {
            id: id.to_string(),
            kind,
        })
    }

    /// Parse the last component of a path as an identifier.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidIdentifier(path.display().to_string()))?;
        Self::parse(name)
    }

    /// Repository keyword (`ddr`).
    #[must_use]
    pub fn repo(&self) -> &str {
        self.id.split('-').next().unwrap_or_default()
    }

    /// Organization id (`ddr-densho`), if the identifier is below the repository.
    #[must_use]
    pub fn organization_id(&self) -> Option<String> {
        let parts: Vec<&str> = self.id.split('-').collect();
        (parts.len() >= 2).then(|| parts[..2].join("-"))
    }

    /// Collection id (`ddr-densho-10`) for collection-level and deeper identifiers.
    #[must_use]
    pub fn collection_id(&self) -> Option<String> {
        let parts: Vec<&str> = self.id.split('-').collect();
        (parts.len() >= 3).then(|| parts[..3].join("-"))
    }

    /// Entity id a file belongs to.
    #[must_use]
    pub fn file_entity_id(&self) -> Option<String> {
        if self.kind != IdentifierKind::File {
            return None;
        }
        file_id_re()
            .captures(&self.id)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// File role (`master`, `mezzanine`, ...).
    #[must_use]
    pub fn file_role(&self) -> Option<String> {
        file_id_re()
            .captures(&self.id)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str().to_string())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

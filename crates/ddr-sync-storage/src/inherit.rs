//! Propagation of inheritable field values from a parent object to the
//! metadata JSON of its descendants.
//!
//! Only fields flagged `inheritable` in the [`FieldSchema`] propagate, and
//! only the subset the caller selected (`<field>_inherit` form checkboxes).
//! A descendant is rewritten only if a value actually changed; descendants
//! that lack a field are left alone. The run is not transactional: the
//! caller commits exactly the returned [`ChangeSet::changed_files`], or the
//! `changed_files` of an [`Error::PartialWrite`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ddr_sync_core::{Error, Identifier, IdentifierKind, Result, global_metrics};

use crate::write_json_atomic;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Model type of a metadata object, fixed when its path is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Collection,
    Entity,
    Segment,
    File,
}

impl ModelKind {
    pub fn from_identifier(kind: IdentifierKind) -> Result<Self> {
        match kind {
            IdentifierKind::Collection => Ok(Self::Collection),
            IdentifierKind::Entity => Ok(Self::Entity),
            IdentifierKind::Segment => Ok(Self::Segment),
            IdentifierKind::File => Ok(Self::File),
            other => Err(Error::InvalidArgument(format!(
                "{other} objects carry no metadata"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub inheritable: bool,
}

impl FieldDescriptor {
    fn new(name: &str, inheritable: bool) -> Self {
        Self {
            name: name.to_string(),
            inheritable,
        }
    }
}

/// Ordered field tables per model type. Segments share the entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub collection: Vec<FieldDescriptor>,
    pub entity: Vec<FieldDescriptor>,
    pub file: Vec<FieldDescriptor>,
}

fn table(fields: &[(&str, bool)]) -> Vec<FieldDescriptor> {
    fields
        .iter()
        .map(|(name, inheritable)| FieldDescriptor::new(name, *inheritable))
        .collect()
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self {
            collection: table(&[
                ("id", false),
                ("record_created", false),
                ("record_lastmod", false),
                ("status", true),
                ("public", true),
                ("title", false),
                ("unitdateinclusive", false),
                ("unitdatebulk", false),
                ("creators", false),
                ("extent", false),
                ("language", false),
                ("contributor", false),
                ("description", false),
                ("notes", false),
                ("physloc", false),
                ("acqinfo", false),
                ("custodhist", false),
                ("accruals", false),
                ("processinfo", false),
                ("organization", true),
                ("rights", true),
                ("rights_statement", true),
                ("prefercite", false),
            ]),
            entity: table(&[
                ("id", false),
                ("record_created", false),
                ("record_lastmod", false),
                ("status", true),
                ("public", true),
                ("sort", false),
                ("title", false),
                ("description", false),
                ("creation", false),
                ("location", false),
                ("creators", false),
                ("language", false),
                ("genre", false),
                ("format", false),
                ("extent", false),
                ("contributor", false),
                ("organization", true),
                ("digitize_person", false),
                ("credit", false),
                ("rights", true),
                ("rights_statement", true),
                ("topics", false),
                ("persons", false),
                ("facility", false),
                ("chronology", false),
                ("geography", false),
                ("notes", false),
            ]),
            file: table(&[
                ("id", false),
                ("sha1", false),
                ("sha256", false),
                ("md5", false),
                ("size", false),
                ("basename_orig", false),
                ("label", false),
                ("public", true),
                ("rights", true),
                ("sort", false),
                ("thumb", false),
                ("mimetype", false),
                ("links", false),
            ]),
        }
    }
}

impl FieldSchema {
    /// Load a schema from a JSON file with `collection`, `entity` and `file`
    /// field tables.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::malformed(path.display().to_string(), e.to_string()))
    }

    #[must_use]
    pub fn fields(&self, kind: ModelKind) -> &[FieldDescriptor] {
        match kind {
            ModelKind::Collection => &self.collection,
            ModelKind::Entity | ModelKind::Segment => &self.entity,
            ModelKind::File => &self.file,
        }
    }

    #[must_use]
    pub fn defines(&self, kind: ModelKind, name: &str) -> bool {
        self.fields(kind).iter().any(|f| f.name == name)
    }

    /// Names of the fields of `kind` flagged inheritable, in schema order.
    #[must_use]
    pub fn inheritable_fields(&self, kind: ModelKind) -> Vec<String> {
        self.fields(kind)
            .iter()
            .filter(|f| f.inheritable)
            .map(|f| f.name.clone())
            .collect()
    }
}

/// Subset of `names` whose `<name>_inherit` flag is set in `form_selection`.
#[must_use]
pub fn selected_inheritables(names: &[String], form_selection: &HashMap<String, bool>) -> Vec<String> {
    names
        .iter()
        .filter(|name| {
            form_selection
                .get(&format!("{name}_inherit"))
                .copied()
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// On-disk metadata layout.
///
/// DDR writes a list of small objects (`[{"application": ...}, {"id": ...},
/// {"title": ...}]`); plain objects are accepted too. The layout is kept on
/// save.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataDocument {
    Pairs(Vec<Map<String, Value>>),
    Object(Map<String, Value>),
}

impl MetadataDocument {
    pub fn from_value(value: Value, location: &Path) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::Object(map)),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    _ => Err(Error::malformed(
                        location.display().to_string(),
                        "list entries must be objects",
                    )),
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::Pairs),
            _ => Err(Error::malformed(
                location.display().to_string(),
                "expected a list or an object",
            )),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Pairs(items) => Value::Array(items.iter().cloned().map(Value::Object).collect()),
            Self::Object(map) => Value::Object(map.clone()),
        }
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Self::Pairs(items) => items.iter().find_map(|m| m.get(field)),
            Self::Object(map) => map.get(field),
        }
    }

    #[must_use]
    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Set a field, adding it at the end if absent.
    pub fn set(&mut self, field: &str, value: Value) {
        match self {
            Self::Pairs(items) => {
                if let Some(slot) = items.iter_mut().find_map(|m| m.get_mut(field)) {
                    *slot = value;
                } else {
                    let mut entry = Map::new();
                    entry.insert(field.to_string(), value);
                    items.push(entry);
                }
            }
            Self::Object(map) => {
                map.insert(field.to_string(), value);
            }
        }
    }
}

/// A collection, entity, segment or file metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataObject {
    pub id: String,
    pub kind: ModelKind,
    pub path: PathBuf,
    pub doc: MetadataDocument,
}

impl MetadataObject {
    /// Load a metadata file, working out its kind from the file name:
    /// `collection.json`, `entity.json` (entity or segment by directory id)
    /// or `<file id>.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let kind = kind_for_path(path)
            .ok_or_else(|| Error::InvalidIdentifier(path.display().to_string()))?;
        Self::load_as(path, kind)
    }

    pub fn load_as(path: &Path, kind: ModelKind) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| Error::malformed(path.display().to_string(), e.to_string()))?;
        let doc = MetadataDocument::from_value(value, path)?;
        let id = match doc.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => id_for_path(path, kind)?,
        };
        Ok(Self {
            id,
            kind,
            path: path.to_path_buf(),
            doc,
        })
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.doc.to_value())
    }

    /// Directory holding this object's descendants. Files have none.
    #[must_use]
    pub fn descendant_root(&self) -> Option<&Path> {
        match self.kind {
            ModelKind::File => None,
            _ => self.path.parent(),
        }
    }
}

fn id_for_path(path: &Path, kind: ModelKind) -> Result<String> {
    let source = match kind {
        ModelKind::File => path.with_extension(""),
        _ => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    Ok(Identifier::from_path(&source)?.id)
}

/// Model kind for a metadata path, or `None` if it is not one.
#[must_use]
pub fn kind_for_path(path: &Path) -> Option<ModelKind> {
    let name = path.file_name()?.to_str()?;
    match name {
        "collection.json" => Some(ModelKind::Collection),
        "entity.json" => {
            let dir = Identifier::from_path(path.parent()?).ok()?;
            match ModelKind::from_identifier(dir.kind).ok()? {
                kind @ (ModelKind::Entity | ModelKind::Segment) => Some(kind),
                _ => None,
            }
        }
        _ => {
            let stem = name.strip_suffix(".json")?;
            let id = Identifier::parse(stem).ok()?;
            (id.kind == IdentifierKind::File).then_some(ModelKind::File)
        }
    }
}

// ---------------------------------------------------------------------------
// Descendant discovery
// ---------------------------------------------------------------------------

/// A metadata file beneath a parent, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descendant {
    pub path: PathBuf,
    pub kind: ModelKind,
}

/// Finds the metadata files beneath a parent object.
pub trait DescendantSource: Send + Sync {
    fn descendants(&self, parent: &MetadataObject) -> Result<Vec<Descendant>>;
}

/// Recursive directory walk. Dot-directories (`.git`, ...) and the parent's
/// own file are skipped; results are sorted by path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDescendants;

impl DescendantSource for FsDescendants {
    fn descendants(&self, parent: &MetadataObject) -> Result<Vec<Descendant>> {
        let Some(root) = parent.descendant_root() else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if hidden {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path == parent.path {
                    continue;
                }
                if let Some(kind) = kind_for_path(&path) {
                    found.push(Descendant { path, kind });
                }
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Result of an inheritance run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub child_ids: Vec<String>,
    pub changed_files: Vec<PathBuf>,
    /// Descendants whose metadata could not be read; left untouched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<PathBuf>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.child_ids.is_empty()
    }

    /// Wrap `source` so the files already rewritten are not lost.
    #[must_use]
    pub fn into_partial_write(self, source: Error) -> Error {
        Error::PartialWrite {
            child_ids: self.child_ids,
            changed_files: self.changed_files,
            source: Box::new(source),
        }
    }
}

pub struct InheritanceEngine {
    schema: FieldSchema,
    source: Arc<dyn DescendantSource>,
}

impl InheritanceEngine {
    #[must_use]
    pub fn new(schema: FieldSchema) -> Self {
        Self::with_source(schema, Arc::new(FsDescendants))
    }

    #[must_use]
    pub fn with_source(schema: FieldSchema, source: Arc<dyn DescendantSource>) -> Self {
        Self { schema, source }
    }

    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Push the selected inheritable fields of `parent` down to every
    /// descendant that defines them with a different value.
    ///
    /// Names the schema does not flag inheritable for the parent's kind are
    /// ignored. Unreadable descendants are skipped. If a save fails the run
    /// stops with [`Error::PartialWrite`], which carries the files already
    /// rewritten.
    pub fn update_inheritables(
        &self,
        parent: &MetadataObject,
        inheritable_field_names: &[String],
        form_selection: &HashMap<String, bool>,
    ) -> Result<ChangeSet> {
        let allowed = self.schema.inheritable_fields(parent.kind);
        let (selected, rejected): (Vec<String>, Vec<String>) =
            selected_inheritables(inheritable_field_names, form_selection)
                .into_iter()
                .partition(|name| allowed.contains(name));
        if !rejected.is_empty() {
            tracing::warn!(
                parent = %parent.id,
                fields = ?rejected,
                "ignoring fields not inheritable"
            );
        }
        if selected.is_empty() {
            return Ok(ChangeSet::default());
        }
        let values: Vec<(String, Value)> = selected
            .into_iter()
            .filter_map(|name| parent.doc.get(&name).cloned().map(|v| (name, v)))
            .collect();
        if values.is_empty() {
            return Ok(ChangeSet::default());
        }

        let metrics = &global_metrics().inherit;
        metrics.runs_total.inc();
        let mut changes = ChangeSet::default();
        for descendant in self.source.descendants(parent)? {
            metrics.files_scanned_total.inc();
            let mut child = match MetadataObject::load_as(&descendant.path, descendant.kind) {
                Ok(child) => child,
                Err(e) => {
                    metrics.files_skipped_total.inc();
                    tracing::warn!(path = %descendant.path.display(), "skipping descendant: {e}");
                    changes.skipped.push(descendant.path);
                    continue;
                }
            };
            let mut dirty = false;
            for (name, value) in &values {
                if !self.schema.defines(child.kind, name) {
                    continue;
                }
                match child.doc.get(name) {
                    Some(current) if current != value => {
                        child.doc.set(name, value.clone());
                        dirty = true;
                    }
                    _ => {}
                }
            }
            if dirty {
                if let Err(e) = child.save() {
                    tracing::warn!(
                        parent = %parent.id,
                        path = %child.path.display(),
                        written = changes.changed_files.len(),
                        "inheritance stopped: {e}"
                    );
                    return Err(changes.into_partial_write(e));
                }
                metrics.files_written_total.inc();
                changes.child_ids.push(child.id);
                changes.changed_files.push(child.path);
            }
        }
        tracing::info!(
            parent = %parent.id,
            changed = changes.child_ids.len(),
            skipped = changes.skipped.len(),
            "inheritable fields propagated"
        );
        Ok(changes)
    }

    /// Copy every inheritable field of `parent` into a new `child`.
    ///
    /// Returns the names of the fields that were set.
    pub fn inherit_into(&self, parent: &MetadataObject, child: &mut MetadataObject) -> Vec<String> {
        let mut set = Vec::new();
        for name in self.schema.inheritable_fields(parent.kind) {
            if !self.schema.defines(child.kind, &name) {
                continue;
            }
            if let Some(value) = parent.doc.get(&name) {
                if child.doc.get(&name) != Some(value) {
                    child.doc.set(&name, value.clone());
                    set.push(name);
                }
            }
        }
        set
    }
}

//! The merged source map.
//!
//! Built by walking the base directory (when the plan declares one) and
//! then the primary test directory; a test-directory entry replaces a
//! base entry at the same relative path. After the merge every relative
//! path maps to exactly one provenance entry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::PublishError;

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Base,
    Test,
}

/// Provenance for one relative path in the merged source set.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub abs_path: PathBuf,
    pub origin: Origin,
    pub is_dir: bool,
}

/// Relative path → provenance, keyed with `/` separators.
#[derive(Debug)]
pub struct SourceMap {
    entries: BTreeMap<String, SourceEntry>,
    template_suffix: String,
}

impl SourceMap {
    /// Walk base (if any) then the test directory.
    pub fn build(
        base: Option<&Path>,
        test_dir: &Path,
        template_suffix: &str,
    ) -> Result<Self, PublishError> {
        let mut entries = BTreeMap::new();
        if let Some(base) = base {
            walk(base, Path::new(""), Origin::Base, &mut entries)?;
        }
        walk(test_dir, Path::new(""), Origin::Test, &mut entries)?;
        Ok(Self {
            entries,
            template_suffix: template_suffix.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&SourceEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Top-level template-directory families: single-component directory
    /// entries whose name carries the template suffix.
    pub fn families(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(key, entry)| {
                entry.is_dir && !key.contains('/') && key.ends_with(&self.template_suffix)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether a family directory holds no files at all.
    pub fn family_is_empty(&self, family: &str) -> bool {
        let prefix = format!("{family}/");
        !self
            .entries
            .iter()
            .any(|(key, entry)| key.starts_with(&prefix) && !entry.is_dir)
    }

    /// Remove a family root and everything beneath it.
    pub fn remove_family(&mut self, family: &str) {
        let prefix = format!("{family}/");
        self.entries
            .retain(|key, _| key != family && !key.starts_with(&prefix));
    }

    /// Remove a single entry.
    pub fn remove_key(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recursive walk in name order, overlaying onto `entries`.
fn walk(
    root: &Path,
    rel: &Path,
    origin: Origin,
    entries: &mut BTreeMap<String, SourceEntry>,
) -> Result<(), PublishError> {
    let dir = root.join(rel);
    let mut children: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| PublishError::io(&dir, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| PublishError::io(&dir, e))?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let child_rel = rel.join(child.file_name());
        let key = rel_key(&child_rel);
        let file_type = child
            .file_type()
            .map_err(|e| PublishError::io(child.path(), e))?;
        entries.insert(
            key,
            SourceEntry {
                abs_path: child.path(),
                origin,
                is_dir: file_type.is_dir(),
            },
        );
        if file_type.is_dir() {
            walk(root, &child_rel, origin, entries)?;
        }
    }
    Ok(())
}

/// Relative path as a `/`-separated key.
fn rel_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

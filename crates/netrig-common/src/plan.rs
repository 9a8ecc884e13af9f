//! The test plan: a declarative description of one test.
//!
//! A plan names the test, optionally inherits a base directory, declares
//! test-wide overlays (scalar, index-keyed list, or CSV-backed), and a
//! `templates` block with the index range and the template files and
//! directories to instantiate per index.
//!
//! Parsing is an explicit boundary: `TestPlan::from_file` returns a typed
//! `PlanError`, never a default on missing files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::value::OverlayValue;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("cannot read test plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse test plan {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("overlay {name} declared more than once in the test plan")]
    DuplicateOverlay { name: String },

    #[error("bad overlay CSV {path} line {line}: {reason}")]
    Csv {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// A parsed test plan plus the directory it was loaded from.
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Base directory to inherit files from, absolute or relative to the
    /// test directory.
    pub base: Option<PathBuf>,
    /// Test-wide scalar overlays.
    pub overlays: BTreeMap<String, OverlayValue>,
    /// Test-wide index-keyed overlay lists, one value per index of the
    /// `templates` block, in declaration order.
    pub overlay_lists: BTreeMap<String, Vec<OverlayValue>>,
    /// CSV-backed overlay columns, keyed by overlay name then index value.
    pub csv_overlays: BTreeMap<String, BTreeMap<u32, OverlayValue>>,
    pub templates: Option<TemplatesDecl>,
    /// Directory containing the plan file.
    pub source_dir: PathBuf,
    /// The plan file itself.
    pub file_path: PathBuf,
}

/// The `[templates]` block.
#[derive(Debug, Clone)]
pub struct TemplatesDecl {
    /// Index range spec, e.g. `"1-4,7"`.
    pub indices: String,
    pub files: Vec<TemplateFileDecl>,
    pub directories: Vec<TemplateDirectoryDecl>,
}

/// One `[[templates.file]]` element.
#[derive(Debug, Clone)]
pub struct TemplateFileDecl {
    /// Source file name relative to the merged test directory, including
    /// the template suffix (e.g. `node.tpl`).
    pub name: String,
    /// Optional proper subset of the block's indices.
    pub indices: Option<String>,
    /// Host-naming format; falls back to the config default.
    pub hostname_format: Option<String>,
    /// Output file name; defaults to the source name with the template
    /// suffix stripped.
    pub output_file_name: Option<String>,
    pub overlays: BTreeMap<String, OverlayValue>,
    pub overlay_lists: BTreeMap<String, Vec<OverlayValue>>,
}

/// One `[[templates.directory]]` element.
#[derive(Debug, Clone)]
pub struct TemplateDirectoryDecl {
    /// Source directory name relative to the merged test directory,
    /// including the template suffix.
    pub name: String,
    pub indices: Option<String>,
    pub hostname_format: Option<String>,
    pub overlays: BTreeMap<String, OverlayValue>,
    pub overlay_lists: BTreeMap<String, Vec<OverlayValue>>,
}

// ── Raw on-disk forms ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawPlan {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    base: Option<PathBuf>,
    #[serde(default)]
    overlays: BTreeMap<String, OverlayValue>,
    /// Comma-separated value lists keyed by overlay name.
    #[serde(default)]
    overlay_lists: BTreeMap<String, String>,
    overlay_csv: Option<String>,
    templates: Option<RawTemplates>,
}

#[derive(Debug, Deserialize)]
struct RawTemplates {
    indices: String,
    #[serde(default, rename = "file")]
    files: Vec<RawTemplateFile>,
    #[serde(default, rename = "directory")]
    directories: Vec<RawTemplateDirectory>,
}

#[derive(Debug, Deserialize)]
struct RawTemplateFile {
    name: String,
    indices: Option<String>,
    hostname_format: Option<String>,
    output_file_name: Option<String>,
    #[serde(default)]
    overlays: BTreeMap<String, OverlayValue>,
    #[serde(default)]
    overlay_lists: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawTemplateDirectory {
    name: String,
    indices: Option<String>,
    hostname_format: Option<String>,
    #[serde(default)]
    overlays: BTreeMap<String, OverlayValue>,
    #[serde(default)]
    overlay_lists: BTreeMap<String, String>,
}

// ── Parsing ─────────────────────────────────────────────────────────

impl TestPlan {
    /// Load a plan file, resolving its CSV-backed overlays relative to
    /// the plan's directory.
    pub fn from_file(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawPlan = toml::from_str(&text).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let overlays: BTreeMap<String, OverlayValue> = raw
            .overlays
            .into_iter()
            .map(|(k, v)| (k, v.normalize()))
            .collect();

        let overlay_lists: BTreeMap<String, Vec<OverlayValue>> = raw
            .overlay_lists
            .into_iter()
            .map(|(k, v)| (k, parse_value_list(&v)))
            .collect();

        for name in overlay_lists.keys() {
            if overlays.contains_key(name) {
                return Err(PlanError::DuplicateOverlay { name: name.clone() });
            }
        }

        let csv_overlays = match raw.overlay_csv {
            Some(ref rel) => {
                let csv_path = source_dir.join(rel);
                let columns = parse_overlay_csv(&csv_path)?;
                tracing::debug!(
                    path = %csv_path.display(),
                    columns = columns.len(),
                    "loaded overlay CSV"
                );
                for name in columns.keys() {
                    if overlays.contains_key(name) || overlay_lists.contains_key(name) {
                        return Err(PlanError::DuplicateOverlay { name: name.clone() });
                    }
                }
                columns
            }
            None => BTreeMap::new(),
        };

        let templates = raw.templates.map(|t| TemplatesDecl {
            indices: t.indices,
            files: t
                .files
                .into_iter()
                .map(|f| TemplateFileDecl {
                    name: f.name,
                    indices: f.indices,
                    hostname_format: f.hostname_format,
                    output_file_name: f.output_file_name,
                    overlays: normalize_map(f.overlays),
                    overlay_lists: f
                        .overlay_lists
                        .into_iter()
                        .map(|(k, v)| (k, parse_value_list(&v)))
                        .collect(),
                })
                .collect(),
            directories: t
                .directories
                .into_iter()
                .map(|d| TemplateDirectoryDecl {
                    name: d.name,
                    indices: d.indices,
                    hostname_format: d.hostname_format,
                    overlays: normalize_map(d.overlays),
                    overlay_lists: d
                        .overlay_lists
                        .into_iter()
                        .map(|(k, v)| (k, parse_value_list(&v)))
                        .collect(),
                })
                .collect(),
        });

        Ok(TestPlan {
            name: raw.name,
            description: raw.description,
            tags: raw.tags,
            base: raw.base,
            overlays,
            overlay_lists,
            csv_overlays,
            templates,
            source_dir,
            file_path: path.to_path_buf(),
        })
    }

    /// Resolve the declared base directory against the test directory.
    /// Returns `None` if no base is declared.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.base.as_ref().map(|b| {
            if b.is_absolute() {
                b.clone()
            } else {
                self.source_dir.join(b)
            }
        })
    }

    /// Names of every declared template artifact (files and directories).
    pub fn template_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if let Some(t) = &self.templates {
            names.extend(t.files.iter().map(|f| f.name.as_str()));
            names.extend(t.directories.iter().map(|d| d.name.as_str()));
        }
        names
    }
}

fn normalize_map(map: BTreeMap<String, OverlayValue>) -> BTreeMap<String, OverlayValue> {
    map.into_iter().map(|(k, v)| (k, v.normalize())).collect()
}

/// Split a comma-separated declaration into typed values.
fn parse_value_list(s: &str) -> Vec<OverlayValue> {
    s.split(',')
        .map(|tok| OverlayValue::from_str_typed(tok.trim()))
        .collect()
}

/// Parse an overlay CSV: a header row naming the index column then one
/// overlay per column, followed by one row per index.
fn parse_overlay_csv(
    path: &Path,
) -> Result<BTreeMap<String, BTreeMap<u32, OverlayValue>>, PlanError> {
    let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

    let (header_line, header) = match lines.next() {
        Some(h) => h,
        None => return Ok(BTreeMap::new()),
    };
    let names: Vec<&str> = header.split(',').map(str::trim).collect();
    if names.len() < 2 {
        return Err(PlanError::Csv {
            path: path.to_path_buf(),
            line: header_line,
            reason: "header must name the index column and at least one overlay".to_string(),
        });
    }

    let mut columns: BTreeMap<String, BTreeMap<u32, OverlayValue>> = names[1..]
        .iter()
        .map(|n| (n.to_string(), BTreeMap::new()))
        .collect();

    for (line_no, line) in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != names.len() {
            return Err(PlanError::Csv {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("expected {} fields, found {}", names.len(), fields.len()),
            });
        }
        let index: u32 = fields[0].parse().map_err(|_| PlanError::Csv {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("bad index value {:?}", fields[0]),
        })?;
        for (name, value) in names[1..].iter().zip(&fields[1..]) {
            let column = columns
                .get_mut(*name)
                .ok_or_else(|| PlanError::Csv {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: format!("unknown column {name}"),
                })?;
            column.insert(index, OverlayValue::from_str_typed(value));
        }
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_plan(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join(crate::TEST_FILE_NAME);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn parse_minimal_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(dir.path(), "name = \"smoke\"\n");
        let plan = TestPlan::from_file(&path).unwrap();
        assert_eq!(plan.name, "smoke");
        assert!(plan.templates.is_none());
        assert!(plan.base_dir().is_none());
    }

    #[test]
    fn parse_full_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
name = "mgen-flood"
description = "flood the rf segment"
tags = ["rf", "smoke"]
base = "../base.test"

[overlays]
FREQ = "900"
LABEL = "alpha"

[overlay_lists]
TXPOWER = "10, 12, 14, 16"

[templates]
indices = "1-4"

[[templates.file]]
name = "node.tpl"
indices = "1-2"
hostname_format = "node-${rig_index}"
output_file_name = "node.conf"

[templates.file.overlays]
RATE = "2.5"

[[templates.directory]]
name = "cfg.tpl"
"#,
        );
        let plan = TestPlan::from_file(&path).unwrap();
        assert_eq!(plan.tags, vec!["rf", "smoke"]);
        assert_eq!(plan.overlays.get("FREQ"), Some(&OverlayValue::Int(900)));
        assert_eq!(
            plan.overlay_lists.get("TXPOWER").unwrap(),
            &vec![
                OverlayValue::Int(10),
                OverlayValue::Int(12),
                OverlayValue::Int(14),
                OverlayValue::Int(16),
            ]
        );

        let templates = plan.templates.as_ref().unwrap();
        assert_eq!(templates.indices, "1-4");
        assert_eq!(templates.files.len(), 1);
        assert_eq!(templates.files[0].indices.as_deref(), Some("1-2"));
        assert_eq!(
            templates.files[0].overlays.get("RATE"),
            Some(&OverlayValue::Float(2.5))
        );
        assert_eq!(templates.directories[0].name, "cfg.tpl");
        assert_eq!(
            plan.base_dir().unwrap(),
            dir.path().join("../base.test")
        );
        assert_eq!(plan.template_names(), vec!["node.tpl", "cfg.tpl"]);
    }

    #[test]
    fn duplicate_overlay_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
name = "dup"
[overlays]
FREQ = "900"
[overlay_lists]
FREQ = "1,2"
"#,
        );
        assert!(matches!(
            TestPlan::from_file(&path),
            Err(PlanError::DuplicateOverlay { .. })
        ));
    }

    #[test]
    fn csv_columns_keyed_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = std::fs::File::create(dir.path().join("overlays.csv")).unwrap();
        writeln!(csv, "index,FREQ,POWER").unwrap();
        writeln!(csv, "1,900,10").unwrap();
        writeln!(csv, "2,901,12.5").unwrap();

        let path = write_plan(
            dir.path(),
            r#"
name = "csv"
overlay_csv = "overlays.csv"
"#,
        );
        let plan = TestPlan::from_file(&path).unwrap();
        let freq = plan.csv_overlays.get("FREQ").unwrap();
        assert_eq!(freq.get(&1), Some(&OverlayValue::Int(900)));
        assert_eq!(freq.get(&2), Some(&OverlayValue::Int(901)));
        let power = plan.csv_overlays.get("POWER").unwrap();
        assert_eq!(power.get(&2), Some(&OverlayValue::Float(12.5)));
    }

    #[test]
    fn csv_row_width_checked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("overlays.csv"), "index,FREQ\n1,900,extra\n").unwrap();
        let path = write_plan(
            dir.path(),
            "name = \"csv\"\noverlay_csv = \"overlays.csv\"\n",
        );
        assert!(matches!(
            TestPlan::from_file(&path),
            Err(PlanError::Csv { line: 2, .. })
        ));
    }
}

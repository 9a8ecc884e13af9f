//! Harness configuration.
//!
//! The config is parsed once at process start and passed by reference to
//! every component that needs it. There is no ambient global: a component
//! that wants a setting takes `&Config`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::value::OverlayValue;

/// Top-level directories a work root may live under.
const ALLOWED_WORK_ROOTS: &[&str] = &["tmp", "opt", "home", "var", "mnt"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("bad work root {path}: {reason}")]
    BadWorkRoot { path: PathBuf, reason: String },
}

/// Harness configuration, resolved from a TOML file plus defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for published trees and collected results.
    /// Must be absolute, at least two levels deep, and rooted under one
    /// of `tmp`, `opt`, `home`, `var`, `mnt`.
    pub work_root: PathBuf,
    /// Suffix marking template files and template directories.
    pub template_suffix: String,
    /// Zero-pad width applied to `rig_index` during hostname derivation.
    pub index_pad_width: usize,
    /// Environment variable names opted in as overlays.
    pub env_overlays: Vec<String>,
    /// Default host-naming format when a template declares none.
    pub hostname_format: String,
    /// Lowest-precedence default overlays.
    pub default_overlays: BTreeMap<String, OverlayValue>,
}

/// Raw on-disk form. Every key is optional; missing keys take defaults.
#[derive(Debug, Deserialize)]
struct RawConfig {
    work_root: Option<PathBuf>,
    template_suffix: Option<String>,
    index_pad_width: Option<usize>,
    /// Colon-separated environment variable names.
    env_overlays: Option<String>,
    hostname_format: Option<String>,
    #[serde(default)]
    overlays: BTreeMap<String, OverlayValue>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/tmp/netrig"),
            template_suffix: ".tpl".to_string(),
            index_pad_width: 2,
            env_overlays: Vec::new(),
            hostname_format: "node-${rig_index}".to_string(),
            default_overlays: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let defaults = Config::default();
        let config = Config {
            work_root: raw.work_root.unwrap_or(defaults.work_root),
            template_suffix: raw.template_suffix.unwrap_or(defaults.template_suffix),
            index_pad_width: raw.index_pad_width.unwrap_or(defaults.index_pad_width),
            env_overlays: raw
                .env_overlays
                .map(|s| {
                    s.split(':')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            hostname_format: raw.hostname_format.unwrap_or(defaults.hostname_format),
            default_overlays: raw
                .overlays
                .into_iter()
                .map(|(k, v)| (k, v.normalize()))
                .collect(),
        };
        config.validate()?;
        tracing::debug!(path = %path.display(), work_root = %config.work_root.display(), "loaded config");
        Ok(config)
    }

    /// Enforce the work-root rules: absolute, depth of at least two
    /// components, first component in the allow-list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let path = &self.work_root;
        if !path.is_absolute() {
            return Err(ConfigError::BadWorkRoot {
                path: path.clone(),
                reason: "must be an absolute path".to_string(),
            });
        }

        let parts: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        if parts.len() < 2 {
            return Err(ConfigError::BadWorkRoot {
                path: path.clone(),
                reason: "must be at least two levels deep".to_string(),
            });
        }

        if !ALLOWED_WORK_ROOTS.contains(&parts[0]) {
            return Err(ConfigError::BadWorkRoot {
                path: path.clone(),
                reason: format!(
                    "must be rooted under one of {}",
                    ALLOWED_WORK_ROOTS.join(", ")
                ),
            });
        }

        Ok(())
    }
}

//! The host list: the roster of hosts a test targets.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("cannot read host list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse host list {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("host {name} listed more than once")]
    DuplicateHost { name: String },
}

/// Parsed `hosts.toml`.
///
/// The optional `[overrides]` table carries per-host publish-time
/// settings; it is stripped from the copy placed in the published tree.
#[derive(Debug, Clone, Deserialize)]
pub struct HostList {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub overrides: std::collections::BTreeMap<String, toml::Value>,
}

impl HostList {
    pub fn from_file(path: &Path) -> Result<Self, HostsError> {
        let text = std::fs::read_to_string(path).map_err(|source| HostsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let list: HostList = toml::from_str(&text).map_err(|source| HostsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut seen = std::collections::BTreeSet::new();
        for host in &list.hosts {
            if !seen.insert(host.as_str()) {
                return Err(HostsError::DuplicateHost { name: host.clone() });
            }
        }
        Ok(list)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.iter().any(|h| h == name)
    }
}

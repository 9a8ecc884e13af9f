//! Archive packing and collision-aware unpacking.
//!
//! Unpacking refuses to overwrite existing entries unless clobbering is
//! requested, and even then refuses when the destination path is
//! shallower than the minimum clobber depth. The rail exists so a bad
//! destination argument can never wipe a shallow system directory.
//!
//! Collision and depth checks are pure; only packing and extraction
//! shell out to `tar`.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

/// Minimum number of path components a destination must have before a
/// clobbering unpack is allowed.
pub const DEFAULT_MIN_CLOBBER_DEPTH: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("refusing to overwrite existing entries in {dest}: {}", .entries.join(", "))]
    WouldClobber { dest: PathBuf, entries: Vec<String> },

    #[error("destination {dest} is {depth} level(s) deep, below the minimum clobber depth {min_depth}")]
    ClobberTooShallow {
        dest: PathBuf,
        depth: usize,
        min_depth: usize,
    },

    #[error("tar failed on {path}: {detail}")]
    Archive { path: PathBuf, detail: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unpack policy.
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// Allow overwriting colliding entries.
    pub clobber: bool,
    /// Depth rail applied when clobbering.
    pub min_clobber_depth: usize,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            clobber: false,
            min_clobber_depth: DEFAULT_MIN_CLOBBER_DEPTH,
        }
    }
}

/// Number of normal components in a path. `/tmp` is 1, `/tmp/a/b` is 3.
pub fn path_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Top-level entry names of an archive listing, normalized: `./` prefix
/// stripped, directory markers dropped, deduplicated.
pub fn top_level_entries(entries: &[String]) -> Vec<String> {
    let mut tops = BTreeSet::new();
    for entry in entries {
        let entry = entry.trim_start_matches("./").trim_end_matches('/');
        if entry.is_empty() {
            continue;
        }
        let top = entry.split('/').next().unwrap_or(entry);
        tops.insert(top.to_string());
    }
    tops.into_iter().collect()
}

/// The collision / clobber-depth policy, applied before any extraction.
pub fn check_clobber(
    dest: &Path,
    entries: &[String],
    opts: &UnpackOptions,
) -> Result<(), UnpackError> {
    let collisions: Vec<String> = top_level_entries(entries)
        .into_iter()
        .filter(|top| dest.join(top).exists())
        .collect();
    if collisions.is_empty() {
        return Ok(());
    }

    if !opts.clobber {
        return Err(UnpackError::WouldClobber {
            dest: dest.to_path_buf(),
            entries: collisions,
        });
    }

    // A colliding destination necessarily exists; resolve it so the
    // depth is measured on the real path.
    let resolved = dest
        .canonicalize()
        .map_err(|source| UnpackError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
    let depth = path_depth(&resolved);
    if depth < opts.min_clobber_depth {
        return Err(UnpackError::ClobberTooShallow {
            dest: resolved,
            depth,
            min_depth: opts.min_clobber_depth,
        });
    }

    tracing::warn!(
        dest = %dest.display(),
        entries = collisions.len(),
        "clobbering existing entries"
    );
    Ok(())
}

/// Stage a directory's contents into a tar archive.
pub fn pack(src_dir: &Path, archive: &Path) -> Result<(), UnpackError> {
    let output = Command::new("tar")
        .arg("-C")
        .arg(src_dir)
        .arg("-cf")
        .arg(archive)
        .arg(".")
        .output()
        .map_err(|source| UnpackError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(UnpackError::Archive {
            path: archive.to_path_buf(),
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// List an archive's entry names.
pub fn list_entries(archive: &Path) -> Result<Vec<String>, UnpackError> {
    let output = Command::new("tar")
        .arg("-tf")
        .arg(archive)
        .output()
        .map_err(|source| UnpackError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(UnpackError::Archive {
            path: archive.to_path_buf(),
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Unpack an archive into `dest`, enforcing the collision policy first.
pub fn unpack(archive: &Path, dest: &Path, opts: &UnpackOptions) -> Result<(), UnpackError> {
    let entries = list_entries(archive)?;
    check_clobber(dest, &entries, opts)?;

    std::fs::create_dir_all(dest).map_err(|source| UnpackError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    let output = Command::new("tar")
        .arg("-C")
        .arg(dest)
        .arg("-xf")
        .arg(archive)
        .output()
        .map_err(|source| UnpackError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(UnpackError::Archive {
            path: archive.to_path_buf(),
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

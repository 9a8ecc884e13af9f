//! Publish-time error taxonomy.
//!
//! Fatal conditions surface as typed variants; soft conditions (existing
//! rendered file overwritten, referenced-but-empty template directory)
//! are logged as warnings by the code that hits them and never appear
//! here. Nothing in this crate retries.

use std::path::PathBuf;

use crate::indices::RangeError;
use crate::overlay::OverlayError;
use crate::template::RenderError;
use netrig_common::hosts::HostsError;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("destination {0} already exists (pass overwrite to replace it)")]
    DestinationExists(PathBuf),

    #[error("base directory {0} does not exist")]
    MissingBaseDirectory(PathBuf),

    #[error("template directory {name} is declared but missing from the test sources")]
    MissingTemplateDirectory { name: String },

    #[error("template file {name} is declared but missing from the test sources")]
    MissingTemplateFile { name: String },

    #[error("undefined overlay ${name} referenced by {file}")]
    UndefinedOverlay { file: PathBuf, name: String },

    #[error("malformed template {file}: {detail}")]
    MalformedTemplate { file: PathBuf, detail: String },

    #[error("bad hostname format {format:?}: {source}")]
    HostnameFormat {
        format: String,
        #[source]
        source: RenderError,
    },

    #[error("overlay list {name} has {found} values but the index set has {expected}")]
    OverlayListMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("cannot rewrite reserved file {file}: {detail}")]
    ReservedRewrite { file: PathBuf, detail: String },

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PublishError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PublishError::Io {
            path: path.into(),
            source,
        }
    }

    /// Attribute a render failure to the file being rendered.
    pub(crate) fn render(file: impl Into<PathBuf>, err: RenderError) -> Self {
        match err {
            RenderError::Undefined { name } => PublishError::UndefinedOverlay {
                file: file.into(),
                name,
            },
            RenderError::Malformed { detail } => PublishError::MalformedTemplate {
                file: file.into(),
                detail,
            },
        }
    }
}

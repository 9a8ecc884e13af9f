//! Template rendering and per-index instantiation.
//!
//! Substitution is strict: `${name}` (or `$name`) must resolve through
//! the scope chain or rendering fails naming the variable. `$$` renders
//! a literal `$`. Rendering is a pure function of source text plus scope
//! chain; all filesystem effects live in the instantiators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use netrig_common::value::OverlayValue;
use netrig_common::RIG_INDEX;

use crate::error::PublishError;
use crate::overlay::{Scope, ScopeChain};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("undefined overlay ${name}")]
    Undefined { name: String },

    #[error("{detail}")]
    Malformed { detail: String },
}

/// Render template text against a scope chain.
pub fn render_str(text: &str, chain: &ScopeChain) -> Result<String, RenderError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(RenderError::Malformed {
                        detail: format!("unterminated ${{ at byte {pos}"),
                    });
                }
                if !is_identifier(&name) {
                    return Err(RenderError::Malformed {
                        detail: format!("bad placeholder name {name:?} at byte {pos}"),
                    });
                }
                out.push_str(&resolve(chain, &name)?);
            }
            Some((_, c)) if is_identifier_start(c) => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if is_identifier_char(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&resolve(chain, &name)?);
            }
            _ => {
                return Err(RenderError::Malformed {
                    detail: format!("stray $ at byte {pos}"),
                });
            }
        }
    }

    Ok(out)
}

fn resolve(chain: &ScopeChain, name: &str) -> Result<String, RenderError> {
    chain
        .get(name)
        .map(OverlayValue::render)
        .ok_or_else(|| RenderError::Undefined {
            name: name.to_string(),
        })
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_identifier_start(c) => chars.all(is_identifier_char),
        _ => false,
    }
}

/// Derive a host name from a format string.
///
/// The format renders against a reduced chain: the index (zero-padded to
/// `pad_width`) plus the lower scopes. Reserved overlays other than the
/// index are not visible here; they only exist once the hostname is
/// known.
pub fn derive_hostname(
    format: &str,
    index: u32,
    pad_width: usize,
    lower: Vec<Scope>,
) -> Result<String, PublishError> {
    let mut reserved = BTreeMap::new();
    reserved.insert(
        RIG_INDEX.to_string(),
        OverlayValue::Str(format!("{index:0pad_width$}")),
    );
    let chain = ScopeChain::build(Scope::new("reserved", reserved), lower)?;
    render_str(format, &chain).map_err(|source| PublishError::HostnameFormat {
        format: format.to_string(),
        source,
    })
}

// ── Template artifacts ──────────────────────────────────────────────

/// A template file: rendered once per index into
/// `<publish_root>/<hostname>/<output_name>`.
#[derive(Debug, Clone)]
pub struct TemplateFile {
    /// Source key: the relative source path, including the suffix.
    pub key: String,
    /// Absolute source path.
    pub src: PathBuf,
    pub indices: Vec<u32>,
    pub hostname_format: String,
    pub output_name: String,
    pub overlays: BTreeMap<String, OverlayValue>,
    /// Index-keyed lists, positional over `indices`.
    pub overlay_lists: BTreeMap<String, Vec<OverlayValue>>,
}

/// A template directory: its whole subtree is rendered once per index
/// directly under `<publish_root>/<hostname>/`, preserving relative
/// structure.
#[derive(Debug, Clone)]
pub struct TemplateDirectory {
    /// Source key: the directory name, including the suffix.
    pub key: String,
    pub src: PathBuf,
    pub indices: Vec<u32>,
    pub hostname_format: String,
    pub overlays: BTreeMap<String, OverlayValue>,
    pub overlay_lists: BTreeMap<String, Vec<OverlayValue>>,
}

/// Either kind of template artifact.
#[derive(Debug, Clone)]
pub enum TemplateArtifact {
    File(TemplateFile),
    Directory(TemplateDirectory),
}

impl TemplateArtifact {
    pub fn key(&self) -> &str {
        match self {
            TemplateArtifact::File(f) => &f.key,
            TemplateArtifact::Directory(d) => &d.key,
        }
    }

    pub fn indices(&self) -> &[u32] {
        match self {
            TemplateArtifact::File(f) => &f.indices,
            TemplateArtifact::Directory(d) => &d.indices,
        }
    }

    pub fn hostname_format(&self) -> &str {
        match self {
            TemplateArtifact::File(f) => &f.hostname_format,
            TemplateArtifact::Directory(d) => &d.hostname_format,
        }
    }

    fn scalars(&self) -> &BTreeMap<String, OverlayValue> {
        match self {
            TemplateArtifact::File(f) => &f.overlays,
            TemplateArtifact::Directory(d) => &d.overlays,
        }
    }

    fn lists(&self) -> &BTreeMap<String, Vec<OverlayValue>> {
        match self {
            TemplateArtifact::File(f) => &f.overlay_lists,
            TemplateArtifact::Directory(d) => &d.overlay_lists,
        }
    }

    /// Every overlay name the artifact declares locally.
    pub fn local_overlay_names(&self) -> impl Iterator<Item = &str> {
        self.scalars()
            .keys()
            .chain(self.lists().keys())
            .map(String::as_str)
    }

    /// The artifact's two local scope levels for the index at position
    /// `pos` in its index list: index-keyed list values first, scalars
    /// below them.
    pub fn local_scopes(&self, pos: usize) -> Result<Vec<Scope>, PublishError> {
        let mut list_values = BTreeMap::new();
        for (name, values) in self.lists() {
            if values.len() != self.indices().len() {
                return Err(PublishError::OverlayListMismatch {
                    name: name.clone(),
                    expected: self.indices().len(),
                    found: values.len(),
                });
            }
            list_values.insert(name.clone(), values[pos].clone());
        }
        Ok(vec![
            Scope::new("template overlay lists", list_values),
            Scope::new("template overlays", self.scalars().clone()),
        ])
    }

    /// Render this artifact for one host into the publish root.
    ///
    /// Returns the paths written. An existing destination file is
    /// overwritten with a warning.
    pub fn instantiate(
        &self,
        hostname: &str,
        chain: &ScopeChain,
        publish_root: &Path,
    ) -> Result<Vec<PathBuf>, PublishError> {
        let host_root = publish_root.join(hostname);
        match self {
            TemplateArtifact::File(f) => {
                let dest = host_root.join(&f.output_name);
                render_file(&f.src, &dest, chain).map(|p| vec![p])
            }
            TemplateArtifact::Directory(d) => {
                std::fs::create_dir_all(&host_root)
                    .map_err(|e| PublishError::io(&host_root, e))?;
                let mut written = Vec::new();
                render_tree(&d.src, &host_root, chain, &mut written)?;
                Ok(written)
            }
        }
    }
}

/// Render one source file to one destination path.
fn render_file(src: &Path, dest: &Path, chain: &ScopeChain) -> Result<PathBuf, PublishError> {
    let text = std::fs::read_to_string(src).map_err(|e| PublishError::io(src, e))?;
    let rendered = render_str(&text, chain).map_err(|e| PublishError::render(src, e))?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PublishError::io(parent, e))?;
    }
    if dest.exists() {
        tracing::warn!(dest = %dest.display(), "overwriting existing rendered file");
    }
    std::fs::write(dest, rendered).map_err(|e| PublishError::io(dest, e))?;
    Ok(dest.to_path_buf())
}

/// Recursively render every file under `src` into `dest`, preserving
/// relative structure. Entries are visited in name order.
fn render_tree(
    src: &Path,
    dest: &Path,
    chain: &ScopeChain,
    written: &mut Vec<PathBuf>,
) -> Result<(), PublishError> {
    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| PublishError::io(src, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| PublishError::io(src, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| PublishError::io(&path, e))?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| PublishError::io(&target, e))?;
            render_tree(&path, &target, chain, written)?;
        } else {
            written.push(render_file(&path, &target, chain)?);
        }
    }
    Ok(())
}

// ── Prune bookkeeping ───────────────────────────────────────────────

/// Reference counts per template source key.
///
/// Initialized with the total number of pending instantiations for each
/// key (summed across artifacts sharing it); each instantiation
/// decrements once. [`PruneCounter::decrement`] reports `true` exactly
/// at the transition to zero, so the shared source entry is pruned once
/// regardless of instantiation order.
#[derive(Debug, Default)]
pub struct PruneCounter {
    counts: BTreeMap<String, usize>,
}

impl PruneCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, pending: usize) {
        *self.counts.entry(key.to_string()).or_insert(0) += pending;
    }

    /// Decrement the count for `key`; returns `true` when it reaches
    /// zero (prune now).
    pub fn decrement(&mut self, key: &str) -> bool {
        match self.counts.get_mut(key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count == 0
            }
            _ => false,
        }
    }
}

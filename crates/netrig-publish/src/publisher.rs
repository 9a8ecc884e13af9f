//! The publish operation: expand a test plan into a per-host tree.
//!
//! A publish walks the merged sources, prunes stale template artifacts,
//! assembles the overlay scope chain, instantiates every declared
//! template artifact across its index set, then copies the remaining
//! files with strict substitution. Any failure aborts the publish; no
//! partial output beyond what was already written is promised, and
//! nothing is retried.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use netrig_common::config::Config;
use netrig_common::hosts::HostList;
use netrig_common::plan::TestPlan;
use netrig_common::value::OverlayValue;
use netrig_common::{DOC_SUBDIR, HOSTS_FILE_NAME, RIG_HOSTNAME, RIG_INDEX, RIG_LOGDIR, STEPS_FILE_NAME, TEST_FILE_NAME};

use crate::error::PublishError;
use crate::indices::{check_subset, expand_indices};
use crate::overlay::{OverlayError, Scope, ScopeChain};
use crate::srcmap::SourceMap;
use crate::template::{
    derive_hostname, render_str, PruneCounter, TemplateArtifact, TemplateDirectory, TemplateFile,
};

/// Keys stripped from `test.toml` on the reserved-file rewrite.
const TEST_FILE_STRIP: &[&str] = &["base", "templates", "overlay_csv"];

/// Keys stripped from `hosts.toml` on the reserved-file rewrite.
const HOSTS_FILE_STRIP: &[&str] = &["overrides"];

/// Caller-supplied knobs for one publish.
#[derive(Debug, Default)]
pub struct PublishOptions {
    /// Recursively remove an existing destination instead of failing.
    pub overwrite: bool,
    /// Highest-precedence non-reserved overlays.
    pub runtime_overlays: BTreeMap<String, OverlayValue>,
    /// Per-host log directory root; populates `rig_logdir`.
    pub logdir: Option<PathBuf>,
    /// Extra files copied verbatim to destination-relative paths, after
    /// everything else.
    pub extra_files: Vec<ExtraFile>,
}

/// One caller-supplied extra file.
#[derive(Debug, Clone)]
pub struct ExtraFile {
    pub src: PathBuf,
    /// Destination path relative to the publish root.
    pub dest: String,
}

/// What a publish produced.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Every derived host name.
    pub hostnames: BTreeSet<String>,
    /// Files written by template instantiation.
    pub rendered: Vec<PathBuf>,
    /// Files written by the generic copy pass.
    pub copied: Vec<PathBuf>,
}

/// Publishes one test plan. Owns nothing shared: each call to
/// [`Publisher::publish`] builds its own source map and scopes.
pub struct Publisher<'a> {
    plan: &'a TestPlan,
    config: &'a Config,
}

impl<'a> Publisher<'a> {
    pub fn new(plan: &'a TestPlan, config: &'a Config) -> Self {
        Self { plan, config }
    }

    /// Expand the plan into `dest`.
    pub fn publish(
        &self,
        dest: &Path,
        opts: &PublishOptions,
    ) -> Result<PublishReport, PublishError> {
        if dest.exists() {
            if !opts.overwrite {
                return Err(PublishError::DestinationExists(dest.to_path_buf()));
            }
            tracing::info!(dest = %dest.display(), "removing existing destination");
            std::fs::remove_dir_all(dest).map_err(|e| PublishError::io(dest, e))?;
        }
        std::fs::create_dir_all(dest).map_err(|e| PublishError::io(dest, e))?;

        let base = self.plan.base_dir();
        if let Some(ref base) = base {
            if !base.is_dir() {
                return Err(PublishError::MissingBaseDirectory(base.clone()));
            }
        }

        let mut map = SourceMap::build(
            base.as_deref(),
            &self.plan.source_dir,
            &self.config.template_suffix,
        )?;

        self.prune_stale_templates(&mut map);
        self.check_declared_templates(&map)?;

        let parent_indices = match self.plan.templates {
            Some(ref t) => expand_indices(&t.indices)?,
            None => Vec::new(),
        };
        for (name, values) in &self.plan.overlay_lists {
            if values.len() != parent_indices.len() {
                return Err(PublishError::OverlayListMismatch {
                    name: name.clone(),
                    expected: parent_indices.len(),
                    found: values.len(),
                });
            }
        }

        let artifacts = self.build_artifacts(&map, &parent_indices)?;
        self.check_reserved_declarations(opts, &artifacts)?;

        let runtime = Scope::new("runtime", opts.runtime_overlays.clone());
        let environment = env_scope(&self.config.env_overlays);
        let test_scalars = Scope::new("test overlays", self.plan.overlays.clone());
        let config_defaults = Scope::new("config defaults", self.config.default_overlays.clone());

        let mut counter = PruneCounter::new();
        for artifact in &artifacts {
            counter.add(artifact.key(), artifact.indices().len());
        }

        let mut report = PublishReport::default();

        // Instantiate every artifact across its index set, pruning each
        // shared source key as its last instantiation completes.
        for artifact in &artifacts {
            for (pos, &index) in artifact.indices().iter().enumerate() {
                let mut lower = vec![runtime.clone(), environment.clone()];
                lower.extend(artifact.local_scopes(pos)?);
                lower.push(self.test_list_scope(&parent_indices, index));
                lower.push(test_scalars.clone());
                lower.push(config_defaults.clone());

                let hostname = derive_hostname(
                    artifact.hostname_format(),
                    index,
                    self.config.index_pad_width,
                    lower.clone(),
                )?;

                let reserved = self.reserved_scope(Some(index), &hostname, opts);
                let chain = ScopeChain::build(reserved, lower)?;

                let written = artifact.instantiate(&hostname, &chain, dest)?;
                report.rendered.extend(written);
                report.hostnames.insert(hostname);

                if counter.decrement(artifact.key()) {
                    tracing::debug!(key = artifact.key(), "pruning instantiated template source");
                    match artifact {
                        TemplateArtifact::File(_) => map.remove_key(artifact.key()),
                        TemplateArtifact::Directory(_) => map.remove_family(artifact.key()),
                    }
                }
            }
        }

        // Host set for per-host scope injection: derived names plus the
        // host list, when the test carries one.
        let mut host_set = report.hostnames.clone();
        if let Some(entry) = map.get(HOSTS_FILE_NAME) {
            let list = HostList::from_file(&entry.abs_path)?;
            host_set.extend(list.hosts);
        }

        self.copy_pass(
            &map,
            dest,
            opts,
            &host_set,
            &[&runtime, &environment, &test_scalars, &config_defaults],
            &mut report,
        )?;

        for extra in &opts.extra_files {
            let target = dest.join(&extra.dest);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PublishError::io(parent, e))?;
            }
            std::fs::copy(&extra.src, &target).map_err(|e| PublishError::io(&extra.src, e))?;
            report.copied.push(target);
        }

        tracing::info!(
            dest = %dest.display(),
            hosts = report.hostnames.len(),
            rendered = report.rendered.len(),
            copied = report.copied.len(),
            "publish complete"
        );
        Ok(report)
    }

    /// Drop template artifacts that no declaration references. Protects
    /// against stale generated files lingering from prior runs.
    fn prune_stale_templates(&self, map: &mut SourceMap) {
        let declared: BTreeSet<&str> = self.plan.template_names().into_iter().collect();

        for family in map.families() {
            if !declared.contains(family.as_str()) {
                tracing::debug!(family = %family, "pruning unreferenced template directory");
                map.remove_family(&family);
            }
        }

        let stale_files: Vec<String> = map
            .iter()
            .filter(|(key, entry)| {
                !entry.is_dir
                    && key.ends_with(&self.config.template_suffix)
                    && !declared.contains(*key)
            })
            .map(|(key, _)| key.to_string())
            .collect();
        for key in stale_files {
            tracing::debug!(key = %key, "pruning unreferenced template file");
            map.remove_key(&key);
        }
    }

    /// Declared template sources must exist; empty directories are a
    /// warning only.
    fn check_declared_templates(&self, map: &SourceMap) -> Result<(), PublishError> {
        let templates = match self.plan.templates {
            Some(ref t) => t,
            None => return Ok(()),
        };
        for file in &templates.files {
            match map.get(&file.name) {
                Some(entry) if !entry.is_dir => {}
                _ => {
                    return Err(PublishError::MissingTemplateFile {
                        name: file.name.clone(),
                    })
                }
            }
        }
        for dir in &templates.directories {
            match map.get(&dir.name) {
                Some(entry) if entry.is_dir => {
                    if map.family_is_empty(&dir.name) {
                        tracing::warn!(name = %dir.name, "referenced template directory is empty");
                    }
                }
                _ => {
                    return Err(PublishError::MissingTemplateDirectory {
                        name: dir.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Turn the plan's template declarations into concrete artifacts.
    fn build_artifacts(
        &self,
        map: &SourceMap,
        parent_indices: &[u32],
    ) -> Result<Vec<TemplateArtifact>, PublishError> {
        let templates = match self.plan.templates {
            Some(ref t) => t,
            None => return Ok(Vec::new()),
        };
        let mut artifacts = Vec::new();

        for file in &templates.files {
            let indices = self.artifact_indices(&file.name, file.indices.as_deref(), parent_indices)?;
            let entry = map.get(&file.name).ok_or_else(|| PublishError::MissingTemplateFile {
                name: file.name.clone(),
            })?;
            artifacts.push(TemplateArtifact::File(TemplateFile {
                key: file.name.clone(),
                src: entry.abs_path.clone(),
                indices,
                hostname_format: file
                    .hostname_format
                    .clone()
                    .unwrap_or_else(|| self.config.hostname_format.clone()),
                output_name: output_name(
                    &file.name,
                    file.output_file_name.as_deref(),
                    &self.config.template_suffix,
                ),
                overlays: file.overlays.clone(),
                overlay_lists: file.overlay_lists.clone(),
            }));
        }

        for dir in &templates.directories {
            let indices = self.artifact_indices(&dir.name, dir.indices.as_deref(), parent_indices)?;
            let entry = map.get(&dir.name).ok_or_else(|| PublishError::MissingTemplateDirectory {
                name: dir.name.clone(),
            })?;
            artifacts.push(TemplateArtifact::Directory(TemplateDirectory {
                key: dir.name.clone(),
                src: entry.abs_path.clone(),
                indices,
                hostname_format: dir
                    .hostname_format
                    .clone()
                    .unwrap_or_else(|| self.config.hostname_format.clone()),
                overlays: dir.overlays.clone(),
                overlay_lists: dir.overlay_lists.clone(),
            }));
        }

        Ok(artifacts)
    }

    fn artifact_indices(
        &self,
        name: &str,
        subset: Option<&str>,
        parent: &[u32],
    ) -> Result<Vec<u32>, PublishError> {
        match subset {
            Some(spec) => {
                let child = expand_indices(spec)?;
                check_subset(&child, parent, name)?;
                Ok(child)
            }
            None => Ok(parent.to_vec()),
        }
    }

    /// Reject reserved overlay names in any author-controlled source
    /// before the first chain is even built.
    fn check_reserved_declarations(
        &self,
        opts: &PublishOptions,
        artifacts: &[TemplateArtifact],
    ) -> Result<(), PublishError> {
        let mut offenders = BTreeSet::new();
        let mut note = |name: &str| {
            if netrig_common::is_reserved_overlay(name) {
                offenders.insert(name.to_string());
            }
        };

        opts.runtime_overlays.keys().for_each(|k| note(k));
        self.config.env_overlays.iter().for_each(|k| note(k));
        self.config.default_overlays.keys().for_each(|k| note(k));
        self.plan.overlays.keys().for_each(|k| note(k));
        self.plan.overlay_lists.keys().for_each(|k| note(k));
        self.plan.csv_overlays.keys().for_each(|k| note(k));
        for artifact in artifacts {
            artifact.local_overlay_names().for_each(&mut note);
        }

        if offenders.is_empty() {
            Ok(())
        } else {
            Err(PublishError::Overlay(OverlayError::ReservedCollision {
                keys: offenders.into_iter().collect(),
            }))
        }
    }

    /// The test-wide index-keyed scope for one index: positional lists
    /// zipped against the block's index order, plus CSV columns keyed by
    /// index value.
    fn test_list_scope(&self, parent_indices: &[u32], index: u32) -> Scope {
        let mut values = BTreeMap::new();
        if let Some(pos) = parent_indices.iter().position(|&i| i == index) {
            for (name, list) in &self.plan.overlay_lists {
                values.insert(name.clone(), list[pos].clone());
            }
        }
        for (name, column) in &self.plan.csv_overlays {
            if let Some(value) = column.get(&index) {
                values.insert(name.clone(), value.clone());
            }
        }
        Scope::new("test overlay lists", values)
    }

    /// The reserved scope for one rendered unit. `index` is `None` for
    /// non-template files inside a host's subdirectory.
    fn reserved_scope(&self, index: Option<u32>, hostname: &str, opts: &PublishOptions) -> Scope {
        let mut values = BTreeMap::new();
        if let Some(index) = index {
            values.insert(RIG_INDEX.to_string(), OverlayValue::Int(i64::from(index)));
        }
        values.insert(
            RIG_HOSTNAME.to_string(),
            OverlayValue::Str(hostname.to_string()),
        );
        if let Some(ref logdir) = opts.logdir {
            values.insert(
                RIG_LOGDIR.to_string(),
                OverlayValue::Str(logdir.join(hostname).display().to_string()),
            );
        }
        Scope::new("reserved", values)
    }

    /// Copy every remaining source entry: reserved files through the
    /// schema-stripping rewrite, everything else through strict
    /// substitution (with per-host scope injection under host
    /// directories), directories as-is to preserve empty ones.
    fn copy_pass(
        &self,
        map: &SourceMap,
        dest: &Path,
        opts: &PublishOptions,
        host_set: &BTreeSet<String>,
        shared: &[&Scope],
        report: &mut PublishReport,
    ) -> Result<(), PublishError> {
        for (key, entry) in map.iter() {
            let first = key.split('/').next().unwrap_or(key);
            if first == DOC_SUBDIR {
                continue;
            }

            let target = dest.join(key);
            if entry.is_dir {
                std::fs::create_dir_all(&target).map_err(|e| PublishError::io(&target, e))?;
                continue;
            }

            match key {
                TEST_FILE_NAME => {
                    rewrite_reserved_file(&entry.abs_path, &target, TEST_FILE_STRIP)?;
                    report.copied.push(target);
                    continue;
                }
                HOSTS_FILE_NAME => {
                    rewrite_reserved_file(&entry.abs_path, &target, HOSTS_FILE_STRIP)?;
                    report.copied.push(target);
                    continue;
                }
                STEPS_FILE_NAME => {
                    copy_verbatim(&entry.abs_path, &target)?;
                    report.copied.push(target);
                    continue;
                }
                _ => {}
            }

            let lower: Vec<Scope> = shared.iter().map(|s| (*s).clone()).collect();
            let chain = if host_set.contains(first) {
                ScopeChain::build(self.reserved_scope(None, first, opts), lower)?
            } else {
                ScopeChain::without_reserved(lower)?
            };

            let bytes = std::fs::read(&entry.abs_path)
                .map_err(|e| PublishError::io(&entry.abs_path, e))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PublishError::io(parent, e))?;
            }
            match String::from_utf8(bytes) {
                Ok(text) => {
                    let rendered = render_str(&text, &chain)
                        .map_err(|e| PublishError::render(&entry.abs_path, e))?;
                    if target.exists() {
                        tracing::warn!(dest = %target.display(), "overwriting existing file in copy pass");
                    }
                    std::fs::write(&target, rendered).map_err(|e| PublishError::io(&target, e))?;
                }
                Err(not_utf8) => {
                    tracing::debug!(src = %entry.abs_path.display(), "copying non-text file verbatim");
                    std::fs::write(&target, not_utf8.into_bytes())
                        .map_err(|e| PublishError::io(&target, e))?;
                }
            }
            report.copied.push(target);
        }
        Ok(())
    }
}

/// Environment-derived overlays: only allow-listed variable names opt in.
fn env_scope(allow: &[String]) -> Scope {
    let mut values = BTreeMap::new();
    for name in allow {
        if let Ok(value) = std::env::var(name) {
            values.insert(name.clone(), OverlayValue::from_str_typed(&value));
        }
    }
    Scope::new("environment", values)
}

/// Default output name: the source base name with the template suffix
/// stripped.
fn output_name(decl_name: &str, custom: Option<&str>, suffix: &str) -> String {
    if let Some(custom) = custom {
        return custom.to_string();
    }
    let base = decl_name.rsplit('/').next().unwrap_or(decl_name);
    base.strip_suffix(suffix).unwrap_or(base).to_string()
}

/// Re-emit a reserved TOML file without its publish-only declarations.
fn rewrite_reserved_file(src: &Path, dest: &Path, strip: &[&str]) -> Result<(), PublishError> {
    let text = std::fs::read_to_string(src).map_err(|e| PublishError::io(src, e))?;
    let mut table: toml::Table =
        toml::from_str(&text).map_err(|e| PublishError::ReservedRewrite {
            file: src.to_path_buf(),
            detail: e.to_string(),
        })?;
    for key in strip {
        table.remove(*key);
    }
    let out = toml::to_string_pretty(&table).map_err(|e| PublishError::ReservedRewrite {
        file: src.to_path_buf(),
        detail: e.to_string(),
    })?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PublishError::io(parent, e))?;
    }
    std::fs::write(dest, out).map_err(|e| PublishError::io(dest, e))?;
    Ok(())
}

fn copy_verbatim(src: &Path, dest: &Path) -> Result<(), PublishError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PublishError::io(parent, e))?;
    }
    std::fs::copy(src, dest).map_err(|e| PublishError::io(src, e))?;
    Ok(())
}

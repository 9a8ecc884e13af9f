//! The step sequencer.
//!
//! A step file declares an ordered list of named steps, each invoking
//! zero or more wrappers tagged `run` or `stop`. Execution walks the
//! declared order; a pre/post-check failure aborts that wrapper for
//! that step without touching the other wrappers in the step, unless
//! `fail_fast` is set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::wrapper::{WrapperContext, WrapperRegistry};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("cannot read step file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse step file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("duplicate step name {name}")]
    DuplicateStep { name: String },

    #[error("step {step} invokes unknown wrapper {wrapper}")]
    UnknownWrapper { step: String, wrapper: String },

    #[error("unknown step {name} in step selection")]
    UnknownStep { name: String },

    #[error("step {step}, wrapper {wrapper}: {detail}")]
    WrapperFailed {
        step: String,
        wrapper: String,
        detail: String,
    },
}

/// Which lifecycle a step invocation drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationTag {
    Run,
    Stop,
}

impl std::fmt::Display for InvocationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationTag::Run => write!(f, "run"),
            InvocationTag::Stop => write!(f, "stop"),
        }
    }
}

/// One wrapper invocation within a step.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub wrapper: String,
    pub tag: InvocationTag,
    pub args: BTreeMap<String, String>,
}

/// One named step.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub invocations: Vec<Invocation>,
}

/// The parsed step schedule.
#[derive(Debug, Clone)]
pub struct StepFile {
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct RawStepFile {
    #[serde(default, rename = "step")]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default)]
    run: Vec<RawInvocation>,
    #[serde(default)]
    stop: Vec<RawInvocation>,
}

#[derive(Debug, Deserialize)]
struct RawInvocation {
    wrapper: String,
    #[serde(default)]
    args: BTreeMap<String, String>,
}

impl StepFile {
    pub fn from_file(path: &Path) -> Result<Self, StepError> {
        let text = std::fs::read_to_string(path).map_err(|source| StepError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawStepFile = toml::from_str(&text).map_err(|source| StepError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut seen = BTreeSet::new();
        let mut steps = Vec::with_capacity(raw.steps.len());
        for step in raw.steps {
            if !seen.insert(step.name.clone()) {
                return Err(StepError::DuplicateStep { name: step.name });
            }
            let mut invocations = Vec::new();
            for inv in step.run {
                invocations.push(Invocation {
                    wrapper: inv.wrapper,
                    tag: InvocationTag::Run,
                    args: inv.args,
                });
            }
            for inv in step.stop {
                invocations.push(Invocation {
                    wrapper: inv.wrapper,
                    tag: InvocationTag::Stop,
                    args: inv.args,
                });
            }
            steps.push(Step {
                name: step.name,
                invocations,
            });
        }
        Ok(StepFile { steps })
    }
}

/// Step selection and failure policy.
#[derive(Debug, Default, Clone)]
pub struct StepOptions {
    /// First step to execute (inclusive); defaults to the first declared.
    pub from_step: Option<String>,
    /// Last step to execute (inclusive); defaults to the last declared.
    pub to_step: Option<String>,
    /// Steps whose names start with any of these prefixes are skipped.
    pub exclude_prefixes: Vec<String>,
    /// Abort the whole sequence on the first wrapper failure instead of
    /// recording it and continuing.
    pub fail_fast: bool,
}

/// Per-wrapper outcome of one step.
#[derive(Debug)]
pub struct WrapperOutcome {
    pub step: String,
    pub wrapper: String,
    pub tag: InvocationTag,
    /// `Err` holds the failure detail, including which lifecycle call
    /// failed.
    pub result: Result<(), String>,
}

/// Everything the sequencer executed, in order.
#[derive(Debug, Default)]
pub struct StepReport {
    pub outcomes: Vec<WrapperOutcome>,
}

impl StepReport {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &WrapperOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Executes a step schedule against a wrapper registry.
pub struct StepSequencer<'a> {
    file: &'a StepFile,
    registry: &'a WrapperRegistry,
}

impl<'a> StepSequencer<'a> {
    pub fn new(file: &'a StepFile, registry: &'a WrapperRegistry) -> Self {
        Self { file, registry }
    }

    /// Execute the selected window of steps in declared order.
    pub fn run(
        &self,
        ctx: &WrapperContext,
        opts: &StepOptions,
    ) -> Result<StepReport, StepError> {
        let window = self.select(opts)?;

        // Unknown wrappers are a structural error: detect before any
        // wrapper runs.
        for step in &window {
            for inv in &step.invocations {
                if !self.registry.contains(&inv.wrapper) {
                    return Err(StepError::UnknownWrapper {
                        step: step.name.clone(),
                        wrapper: inv.wrapper.clone(),
                    });
                }
            }
        }

        let mut report = StepReport::default();
        for step in window {
            tracing::info!(step = %step.name, "executing step");
            for inv in &step.invocations {
                let result = self.invoke(inv, ctx);
                if let Err(ref detail) = result {
                    tracing::warn!(
                        step = %step.name,
                        wrapper = %inv.wrapper,
                        detail = %detail,
                        "wrapper failed"
                    );
                    if opts.fail_fast {
                        return Err(StepError::WrapperFailed {
                            step: step.name.clone(),
                            wrapper: inv.wrapper.clone(),
                            detail: detail.clone(),
                        });
                    }
                }
                report.outcomes.push(WrapperOutcome {
                    step: step.name.clone(),
                    wrapper: inv.wrapper.clone(),
                    tag: inv.tag,
                    result,
                });
            }
        }
        Ok(report)
    }

    fn invoke(&self, inv: &Invocation, base_ctx: &WrapperContext) -> Result<(), String> {
        let wrapper = match self.registry.create(&inv.wrapper) {
            Some(w) => w,
            None => return Err(format!("wrapper {} not registered", inv.wrapper)),
        };
        let ctx = WrapperContext {
            args: inv.args.clone(),
            ..base_ctx.clone()
        };

        match inv.tag {
            InvocationTag::Run => {
                wrapper
                    .prerun(&ctx)
                    .map_err(|e| format!("prerun: {e:#}"))?;
                wrapper.run(&ctx).map_err(|e| format!("run: {e:#}"))?;
                wrapper
                    .postrun(&ctx)
                    .map_err(|e| format!("postrun: {e:#}"))?;
                Ok(())
            }
            InvocationTag::Stop => wrapper.stop(&ctx).map_err(|e| format!("stop: {e:#}")),
        }
    }

    /// Resolve from/to slicing and prefix exclusion into the list of
    /// steps to execute.
    fn select(&self, opts: &StepOptions) -> Result<Vec<&'a Step>, StepError> {
        let position = |name: &str| -> Result<usize, StepError> {
            self.file
                .steps
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| StepError::UnknownStep {
                    name: name.to_string(),
                })
        };

        let from = match opts.from_step {
            Some(ref name) => position(name)?,
            None => 0,
        };
        let to = match opts.to_step {
            Some(ref name) => position(name)?,
            None => self.file.steps.len().saturating_sub(1),
        };

        Ok(self
            .file
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| *i >= from && *i <= to)
            .map(|(_, s)| s)
            .filter(|s| {
                let excluded = opts
                    .exclude_prefixes
                    .iter()
                    .any(|p| s.name.starts_with(p.as_str()));
                if excluded {
                    tracing::debug!(step = %s.name, "step excluded by prefix");
                }
                !excluded
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::Wrapper;
    use std::sync::{Arc, Mutex};

    /// Records every lifecycle call; fails where instructed.
    struct Probe {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl Probe {
        fn record(&self, call: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("{}.{call}", self.name));
            if self.fail_on == Some(call) {
                anyhow::bail!("{call} rigged to fail");
            }
            Ok(())
        }
    }

    impl Wrapper for Probe {
        fn prerun(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
            self.record("prerun")
        }
        fn run(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
            self.record("run")
        }
        fn postrun(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
            self.record("postrun")
        }
        fn stop(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
            self.record("stop")
        }
    }

    fn registry_with(
        calls: &Arc<Mutex<Vec<String>>>,
        fail_on: &[(&'static str, &'static str)],
    ) -> WrapperRegistry {
        let mut registry = WrapperRegistry::new();
        for name in ["emane", "mgen", "olsr"] {
            let calls = calls.clone();
            let fail = fail_on
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, call)| *call);
            registry
                .register(name, move || {
                    Box::new(Probe {
                        name: match name {
                            "emane" => "emane",
                            "mgen" => "mgen",
                            _ => "olsr",
                        },
                        calls: calls.clone(),
                        fail_on: fail,
                    })
                })
                .unwrap();
        }
        registry
    }

    fn ctx() -> WrapperContext {
        WrapperContext {
            test_dir: "/tmp/netrig/current_test".into(),
            logdir: "/tmp/netrig/logs".into(),
            args: BTreeMap::new(),
        }
    }

    fn parse(text: &str) -> StepFile {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.toml");
        std::fs::write(&path, text).unwrap();
        StepFile::from_file(&path).unwrap()
    }

    const SCHEDULE: &str = r#"
[[step]]
name = "start-emane"
[[step.run]]
wrapper = "emane"

[[step]]
name = "start-mgen"
[[step.run]]
wrapper = "mgen"

[[step]]
name = "stop-all"
[[step.stop]]
wrapper = "mgen"
[[step.stop]]
wrapper = "emane"
"#;

    #[test]
    fn runs_declared_order_with_full_lifecycle() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&calls, &[]);
        let file = parse(SCHEDULE);

        let report = StepSequencer::new(&file, &registry)
            .run(&ctx(), &StepOptions::default())
            .unwrap();
        assert!(report.all_ok());

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "emane.prerun",
                "emane.run",
                "emane.postrun",
                "mgen.prerun",
                "mgen.run",
                "mgen.postrun",
                "mgen.stop",
                "emane.stop",
            ]
        );
    }

    #[test]
    fn precheck_failure_isolated_to_one_wrapper() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&calls, &[("emane", "prerun")]);
        let file = parse(
            r#"
[[step]]
name = "start"
[[step.run]]
wrapper = "emane"
[[step.run]]
wrapper = "mgen"
"#,
        );

        let report = StepSequencer::new(&file, &registry)
            .run(&ctx(), &StepOptions::default())
            .unwrap();

        assert!(!report.all_ok());
        assert_eq!(report.failures().count(), 1);

        let calls = calls.lock().unwrap();
        // emane never reaches run/postrun; mgen is unaffected.
        assert_eq!(
            *calls,
            vec!["emane.prerun", "mgen.prerun", "mgen.run", "mgen.postrun"]
        );
    }

    #[test]
    fn fail_fast_aborts_the_sequence() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&calls, &[("emane", "run")]);
        let file = parse(SCHEDULE);

        let opts = StepOptions {
            fail_fast: true,
            ..Default::default()
        };
        let err = StepSequencer::new(&file, &registry)
            .run(&ctx(), &opts)
            .unwrap_err();
        assert!(matches!(err, StepError::WrapperFailed { .. }));

        // Nothing past the failing wrapper ran.
        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec!["emane.prerun", "emane.run"]);
    }

    #[test]
    fn duplicate_step_name_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.toml");
        std::fs::write(
            &path,
            r#"
[[step]]
name = "start"
[[step]]
name = "start"
"#,
        )
        .unwrap();
        assert!(matches!(
            StepFile::from_file(&path),
            Err(StepError::DuplicateStep { .. })
        ));
    }

    #[test]
    fn from_to_window_and_prefix_exclusion() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&calls, &[]);
        let file = parse(SCHEDULE);

        let opts = StepOptions {
            from_step: Some("start-mgen".to_string()),
            to_step: Some("stop-all".to_string()),
            exclude_prefixes: vec!["stop-".to_string()],
            ..Default::default()
        };
        let report = StepSequencer::new(&file, &registry)
            .run(&ctx(), &opts)
            .unwrap();
        assert!(report.all_ok());

        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec!["mgen.prerun", "mgen.run", "mgen.postrun"]);
    }

    #[test]
    fn unknown_selection_and_wrapper_rejected() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&calls, &[]);
        let file = parse(SCHEDULE);
        let sequencer = StepSequencer::new(&file, &registry);

        let opts = StepOptions {
            from_step: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            sequencer.run(&ctx(), &opts),
            Err(StepError::UnknownStep { .. })
        ));

        let bad = parse(
            r#"
[[step]]
name = "start"
[[step.run]]
wrapper = "nonesuch"
"#,
        );
        assert!(matches!(
            StepSequencer::new(&bad, &registry).run(&ctx(), &StepOptions::default()),
            Err(StepError::UnknownWrapper { .. })
        ));
        // Nothing executed.
        assert!(calls.lock().unwrap().is_empty());
    }
}

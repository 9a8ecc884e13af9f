//! Wrapper programs and their registry.
//!
//! A wrapper adapts one real network application (emulator, traffic
//! generator, routing daemon) to the harness lifecycle. Implementations
//! are selected by name through an explicit registry populated by
//! registration calls at startup; there is no runtime discovery.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// What a wrapper invocation sees.
#[derive(Debug, Clone)]
pub struct WrapperContext {
    /// The host-local published test directory.
    pub test_dir: PathBuf,
    /// Where the wrapper writes its logs.
    pub logdir: PathBuf,
    /// Arguments declared on the invocation.
    pub args: BTreeMap<String, String>,
}

/// Lifecycle of one wrapped application.
///
/// A `run` invocation drives `prerun`, `run`, `postrun` in order; a
/// `stop` invocation drives only `stop`. The default pre/post checks
/// accept.
pub trait Wrapper {
    fn prerun(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&self, ctx: &WrapperContext) -> anyhow::Result<()>;

    fn postrun(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self, ctx: &WrapperContext) -> anyhow::Result<()>;
}

type WrapperFactory = Box<dyn Fn() -> Box<dyn Wrapper> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[error("wrapper {name} registered twice")]
pub struct DuplicateWrapper {
    pub name: String,
}

/// Name → factory mapping for wrapper implementations.
#[derive(Default)]
pub struct WrapperRegistry {
    factories: BTreeMap<String, WrapperFactory>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name. Registering the same name twice
    /// is a programming error and is rejected.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), DuplicateWrapper>
    where
        F: Fn() -> Box<dyn Wrapper> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(DuplicateWrapper {
                name: name.to_string(),
            });
        }
        self.factories.insert(name.to_string(), Box::new(factory));
        Ok(())
    }

    /// Instantiate the wrapper registered under `name`.
    pub fn create(&self, name: &str) -> Option<Box<dyn Wrapper>> {
        self.factories.get(name).map(|f| f())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Wrapper for Nop {
        fn run(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop(&self, _ctx: &WrapperContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_create() {
        let mut registry = WrapperRegistry::new();
        registry.register("nop", || Box::new(Nop)).unwrap();
        assert!(registry.contains("nop"));
        assert!(registry.create("nop").is_some());
        assert!(registry.create("missing").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = WrapperRegistry::new();
        registry.register("nop", || Box::new(Nop)).unwrap();
        let err = registry.register("nop", || Box::new(Nop)).unwrap_err();
        assert_eq!(err.name, "nop");
    }
}

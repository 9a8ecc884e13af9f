//! Test-directory publishing and templating engine.
//!
//! Expands a declarative test plan into a concrete, per-host directory
//! tree: merges a base directory with the test directory, resolves
//! layered overlay scopes, instantiates template files and directories
//! once per index, and copies everything else with strict substitution.
//!
//! The whole crate is single-threaded and synchronous. A publish owns its
//! source map and overlay scopes exclusively; nothing here is shared
//! across concurrent publishes.

pub mod error;
pub mod indices;
pub mod overlay;
pub mod publisher;
pub mod srcmap;
pub mod template;

pub use error::PublishError;
pub use publisher::{PublishOptions, PublishReport, Publisher};

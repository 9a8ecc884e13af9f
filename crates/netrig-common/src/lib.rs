//! Shared types for the netrig harness.
//!
//! This crate contains:
//! - **Config**: the harness configuration file, parsed once at startup
//!   and passed by reference to every component
//! - **Test plan**: the declarative test description (overlays, templates,
//!   index ranges, base-directory inheritance)
//! - **Host list**: the per-test roster of target hosts
//! - **Overlay values**: the typed scalar values substituted into templates

pub mod config;
pub mod hosts;
pub mod plan;
pub mod value;

/// Reserved overlay: the per-index ordinal of the instance being rendered.
pub const RIG_INDEX: &str = "rig_index";

/// Reserved overlay: the derived host name of the instance being rendered.
pub const RIG_HOSTNAME: &str = "rig_hostname";

/// Reserved overlay: the derived per-host log directory.
pub const RIG_LOGDIR: &str = "rig_logdir";

/// Overlay names computed by the harness itself. A test author declaring
/// any of these is a fatal configuration error.
pub const RESERVED_OVERLAYS: &[&str] = &[RIG_INDEX, RIG_HOSTNAME, RIG_LOGDIR];

/// The test definition file. Copied through a schema-stripping rewrite
/// rather than template substitution.
pub const TEST_FILE_NAME: &str = "test.toml";

/// The host list file. Copied through a schema-stripping rewrite rather
/// than template substitution.
pub const HOSTS_FILE_NAME: &str = "hosts.toml";

/// The step schedule file. Copied verbatim.
pub const STEPS_FILE_NAME: &str = "steps.toml";

/// Documentation subdirectory, excluded from publishing.
pub const DOC_SUBDIR: &str = "doc";

/// Returns `true` if `name` is one of the reserved overlay names.
pub fn is_reserved_overlay(name: &str) -> bool {
    RESERVED_OVERLAYS.contains(&name)
}

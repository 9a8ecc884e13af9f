//! Remote transport for the netrig harness.
//!
//! Ships published artifacts to remote hosts and executes commands
//! there, one thread per host per in-flight command. Remote output is
//! drained line by line; a sentinel pair brackets a trailing JSON
//! payload carrying the structured result. Archive unpacking on the
//! receiving side is collision-aware with a minimum-clobber-depth rail.

pub mod remote;
pub mod unpack;

pub use remote::{CommandResult, HostReport, HostStatus, InterruptHandle, RemoteRunner};
pub use unpack::{UnpackOptions, DEFAULT_MIN_CLOBBER_DEPTH};

//! Test execution for published trees.
//!
//! This crate contains:
//! - **Wrapper registry**: explicit name-to-factory mapping for the
//!   wrapper programs a step can invoke
//! - **Step sequencer**: walks the declared step schedule in order,
//!   driving each wrapper's run/stop lifecycle
//! - **EEL sequencer**: blocks until scheduled event times arrive and
//!   yields the events of a line-oriented event file

pub mod eel;
pub mod steps;
pub mod wrapper;

pub use steps::{StepFile, StepOptions, StepReport, StepSequencer};
pub use wrapper::{Wrapper, WrapperContext, WrapperRegistry};

//! Domain types for the experiment runner.
//!
//! - Run: descriptors, launch parameters and outcomes
//! - Events: progress notifications and run statuses

pub mod events;
pub mod run;

// Re-export commonly used types
pub use events::{ProgressEvent, RunStatus};
pub use run::{
    LaunchParameters, PromptSource, RunDescriptor, RunOutcome, Termination, FAILURE_EXIT_CODE,
};

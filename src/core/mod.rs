//! Core orchestration logic.
//!
//! This module contains:
//! - Orchestrator: expands an experiment and drives its runs
//! - Workspace: per-run scratch directories
//! - Progress: best-effort lifecycle events and their reporter

pub mod orchestrator;
pub mod progress;
pub mod workspace;

pub use orchestrator::{ExperimentError, ExperimentOrchestrator, ExperimentReport};
pub use progress::{
    ActivitySink, ExperimentState, LogSink, ProgressReporter, ProgressSender, ProgressSink,
    RunState,
};
pub use workspace::WorkspaceManager;

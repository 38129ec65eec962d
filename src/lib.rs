//! act - Agent comparison tool
//!
//! Runs the same coding task through several AI agent configurations, each
//! run in its own container, and collects the results into an inspectable
//! directory.
//!
//! # Architecture
//!
//! An experiment expands into `agents x runs_per_agent` run descriptors:
//! - Every descriptor gets a private workspace and one isolated execution
//! - Runs are drained by a bounded worker pool (or one at a time)
//! - Every descriptor ends with exactly one outcome and one metrics record,
//!   whether it succeeded, failed, timed out or was interrupted
//! - Workspaces and containers are released on every exit path
//!
//! # Modules
//!
//! - `adapters`: Execution backends (Docker)
//! - `core`: Orchestration logic (Orchestrator, Workspace, Progress)
//! - `domain`: Data structures (RunDescriptor, RunOutcome, ProgressEvent)
//! - `metrics`: Per-run metrics extraction
//! - `analysis`: Post-hoc reviewer and per-agent summary
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run an experiment
//! act run experiment.yaml
//!
//! # Compare the agents
//! act summary results/planning-shootout-2026-01-05-101500
//! ```

pub mod adapters;
pub mod analysis;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod metrics;

// Re-export main types at crate root for convenience
pub use adapters::{BackendError, DockerBackend, DockerContext, ExecutionBackend};
pub use config::{BenchmarkConfig, ConfigError};
pub use crate::core::{ExperimentError, ExperimentOrchestrator, ExperimentReport, WorkspaceManager};
pub use domain::{LaunchParameters, ProgressEvent, RunDescriptor, RunOutcome, RunStatus, Termination};
pub use metrics::RunMetrics;

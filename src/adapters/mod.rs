//! Execution backends.
//!
//! A backend turns [`LaunchParameters`] into one isolated, time-bounded
//! execution and reports how it ended. It owns every execution handle it
//! creates and must release each one on every exit path.

pub mod activity;
pub mod docker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::progress::ActivitySink;
use crate::domain::{LaunchParameters, RunOutcome, Termination};

pub use activity::parse_activity_line;
pub use docker::{DockerBackend, DockerContext};

/// Timeout for the post-hoc analysis execution
pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(600);

/// Failures a backend could not fold into an outcome itself
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Execution image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("Failed to launch execution: {0}")]
    Launch(String),

    #[error("Execution failed: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Termination recorded for a run that failed with this error
    pub fn termination(&self) -> Termination {
        match self {
            Self::ImageUnavailable(_) | Self::Launch(_) => Termination::LaunchFailed,
            Self::Runtime(_) | Self::Io(_) => Termination::Crashed,
        }
    }
}

/// One-shot reviewer execution over a finished experiment
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    /// Results directory, mounted read-write
    pub results_path: PathBuf,
    /// Generated instruction file, mounted read-only
    pub instructions_file: PathBuf,
    pub model: String,
    pub prompt: String,
    pub timeout: Duration,
}

/// Result of the analysis execution
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub exit_code: i64,
    pub output: String,
    pub error: Option<String>,
    pub termination: Termination,
}

impl AnalysisOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Isolation mechanism that runs the workload
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Make sure the execution image exists. Runs at most once per backend.
    async fn prepare(&self) -> Result<(), BackendError>;

    /// Run one workload to completion.
    ///
    /// Failures after the execution was requested come back as an outcome
    /// with `error` set. `Err` is reserved for failures before that point.
    async fn launch(
        &self,
        params: &LaunchParameters,
        activity: Option<ActivitySink>,
    ) -> Result<RunOutcome, BackendError>;

    /// Run the post-hoc analysis execution. With `echo`, output is mirrored
    /// to stdout as it streams.
    async fn launch_analysis(
        &self,
        request: &AnalysisRequest,
        echo: bool,
    ) -> Result<AnalysisOutcome, BackendError>;

    /// Force-remove every execution handle still alive. Never fails.
    async fn cleanup(&self);
}

//! Run descriptors and outcomes.
//!
//! A [`RunDescriptor`] is created once per (agent, run number) pair when an
//! experiment is expanded and never changes afterwards. Every descriptor ends
//! with exactly one [`RunOutcome`], whatever happened to the run.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit code recorded when a run could not be attributed a real one
pub const FAILURE_EXIT_CODE: i64 = 1;

/// One scheduled execution of the workload
#[derive(Debug, Clone, PartialEq)]
pub struct RunDescriptor {
    /// `{agent_id}-{run_number}`, unique within an experiment
    pub run_id: String,

    /// Agent this run belongs to
    pub agent_id: String,

    /// 1-based run number for the agent
    pub run_number: u32,

    /// Everything the execution backend needs to start the run
    pub parameters: LaunchParameters,
}

impl RunDescriptor {
    /// Build the run id for an agent and run number
    pub fn run_id_for(agent_id: &str, run_number: u32) -> String {
        format!("{}-{}", agent_id, run_number)
    }
}

/// Where the workload reads its prompt from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    /// Path to a prompt file inside the target repository
    File(String),
    /// Inline prompt text
    Text(String),
}

/// Per-run launch parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParameters {
    pub run_id: String,
    pub repo_url: String,
    pub repo_commit: Option<String>,
    pub prompt: PromptSource,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    pub workspace: PathBuf,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The workload exited on its own (any exit code)
    #[default]
    Exited,
    /// Wall-clock timeout expired before the workload exited
    TimedOut,
    /// Killed by the backend for exceeding its memory ceiling
    OutOfMemory,
    /// The isolated environment could not be started
    LaunchFailed,
    /// The backend failed while the run was in flight
    Crashed,
    /// The experiment was interrupted before the run reported
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::TimedOut => "timed_out",
            Self::OutOfMemory => "out_of_memory",
            Self::LaunchFailed => "launch_failed",
            Self::Crashed => "crashed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of a single run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,

    /// Exit code of the workload, or [`FAILURE_EXIT_CODE`] when none exists
    pub exit_code: i64,

    /// Combined stdout/stderr of the run
    pub output: String,

    /// The run's private workspace
    pub workspace: PathBuf,

    /// Set when the run has no meaningful exit code of its own
    pub error: Option<String>,

    pub termination: Termination,

    /// Wall-clock time from launch to classification
    pub duration: Duration,
}

impl RunOutcome {
    /// A run that exited with its own exit code
    pub fn exited(params: &LaunchParameters, exit_code: i64, output: String) -> Self {
        Self {
            run_id: params.run_id.clone(),
            exit_code,
            output,
            workspace: params.workspace.clone(),
            error: None,
            termination: Termination::Exited,
            duration: Duration::ZERO,
        }
    }

    /// A run that failed without an exit code of its own
    pub fn failed(
        run_id: &str,
        workspace: PathBuf,
        termination: Termination,
        error: impl Into<String>,
        output: String,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            exit_code: FAILURE_EXIT_CODE,
            output,
            workspace,
            error: Some(error.into()),
            termination,
            duration: Duration::ZERO,
        }
    }

    /// Placeholder for a descriptor that never reported back
    pub fn cancelled(descriptor: &RunDescriptor, reason: impl Into<String>) -> Self {
        Self::failed(
            &descriptor.run_id,
            descriptor.parameters.workspace.clone(),
            Termination::Cancelled,
            reason,
            String::new(),
        )
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

//! Progress events emitted while an experiment runs.
//!
//! Events flow one way, from the orchestrator and the execution backend to
//! the progress reporter. They are best-effort: a dropped event never changes
//! the outcome of a run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TimeoutStatus;

use super::run::{RunOutcome, Termination};

/// A lifecycle notification for the progress reporter
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The experiment expanded into `total_runs` runs
    ExperimentStarted { name: String, total_runs: usize },

    /// A run descriptor was created
    RunRegistered {
        run_id: String,
        agent_id: String,
        run_number: u32,
    },

    /// A worker picked the run up
    RunStarted { run_id: String },

    /// Tool activity line observed in the run's output
    Activity { run_id: String, line: String },

    /// The run has an outcome
    RunFinished {
        run_id: String,
        status: RunStatus,
        duration: Duration,
        error: Option<String>,
    },
}

impl ProgressEvent {
    /// Run this event refers to (if any)
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::ExperimentStarted { .. } => None,
            Self::RunRegistered { run_id, .. }
            | Self::RunStarted { run_id }
            | Self::Activity { run_id, .. }
            | Self::RunFinished { run_id, .. } => Some(run_id),
        }
    }
}

/// Reported status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Registered, not yet started
    #[default]
    Pending,

    /// Executing
    Running,

    /// Exited with code 0
    Completed,

    /// Non-zero exit or backend failure
    Failed,

    /// Timed out (only under `TimeoutStatus::Timeout`)
    Timeout,

    /// Interrupted before it reported
    Cancelled,
}

impl RunStatus {
    /// Classify a finished run
    pub fn classify(outcome: &RunOutcome, policy: TimeoutStatus) -> Self {
        match outcome.termination {
            Termination::Cancelled => Self::Cancelled,
            Termination::TimedOut if policy == TimeoutStatus::Timeout => Self::Timeout,
            _ if outcome.is_success() => Self::Completed,
            _ => Self::Failed,
        }
    }

    /// Whether the run has reached a final status
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

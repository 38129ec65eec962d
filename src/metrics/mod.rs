//! Per-run metrics extraction.
//!
//! Every extractor degrades to zero or empty values. Nothing in this module
//! returns an error for bad input: a run with broken artifacts still gets a
//! complete [`RunMetrics`] record.

pub mod git;
pub mod plan;
pub mod tokens;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{RunOutcome, RunStatus, Termination};

pub use git::{collect_git_metrics, parse_diff_stat, GitDiffStats};
pub use plan::{collect_plan_metrics, PlanMetrics};
pub use tokens::{usage_from_output, usage_from_session, TokenUsage};

/// File name of the persisted metrics record
pub const METRICS_FILE: &str = "metrics.json";

/// Permanent record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub termination: Termination,
    pub exit_code: i64,
    pub duration_seconds: f64,
    #[serde(default)]
    pub has_commits: bool,
    #[serde(default)]
    pub git_diff: GitDiffStats,
    #[serde(default)]
    pub plan: PlanMetrics,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunMetrics {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Metrics the workload wrote about itself, or an empty map.
///
/// Looks at `<workspace>/metrics.json` first, then
/// `<workspace>/.benchmark/metrics.json`. Missing or malformed files are
/// skipped.
pub fn load_backend_metrics(workspace: &Path) -> Map<String, Value> {
    for candidate in [
        workspace.join(METRICS_FILE),
        workspace.join(".benchmark").join(METRICS_FILE),
    ] {
        let Ok(content) = std::fs::read_to_string(&candidate) else {
            continue;
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => return map,
            Ok(_) => debug!(path = %candidate.display(), "Backend metrics is not an object"),
            Err(e) => debug!(path = %candidate.display(), error = %e, "Malformed backend metrics"),
        }
    }
    Map::new()
}

/// Build the metrics record for a finished run
pub async fn collect_run_metrics(agent_id: &str, outcome: &RunOutcome, status: RunStatus) -> RunMetrics {
    let workspace = outcome.workspace.as_path();

    let duration_seconds = load_backend_metrics(workspace)
        .get("duration_seconds")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| outcome.duration.as_secs_f64());

    let (has_commits, git_diff) = collect_git_metrics(&workspace.join("repo")).await;
    let plan = collect_plan_metrics(workspace);
    let token_usage =
        usage_from_session(workspace).unwrap_or_else(|| usage_from_output(&outcome.output));

    RunMetrics {
        run_id: outcome.run_id.clone(),
        agent_id: agent_id.to_string(),
        status,
        termination: outcome.termination,
        exit_code: outcome.exit_code,
        duration_seconds,
        has_commits,
        git_diff,
        plan,
        token_usage,
        error: outcome.error.clone(),
    }
}

/// Write `metrics` as pretty JSON to `path`, creating parent directories
pub fn save_metrics(metrics: &RunMetrics, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(metrics)?;
    std::fs::write(path, json)
}

/// Read a persisted metrics record
pub fn load_metrics(path: &Path) -> anyhow::Result<RunMetrics> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

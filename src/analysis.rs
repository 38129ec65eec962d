//! Post-hoc analysis of a finished experiment.
//!
//! Two views over a results directory: a reviewer execution that writes a
//! qualitative report next to the results, and a per-agent numeric summary
//! computed from the persisted metrics records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, instrument};

use crate::adapters::{AnalysisRequest, ExecutionBackend, ANALYSIS_TIMEOUT};
use crate::config::{AnalysisConfig, BenchmarkConfig};
use crate::core::orchestrator::CONFIG_FILE;
use crate::metrics::{load_metrics, RunMetrics, METRICS_FILE};

/// Instructions given to the reviewer before the operator's criteria
pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are analyzing AI coding agent benchmark results.

## Directory Structure
Your working directory is /workspace/results which contains:
- config.yaml: Original benchmark configuration
- {agent-id}-{run-number}/: Individual run directories containing:
  - metrics.json: Quantitative metrics (status, duration, exit_code, plan stats, token usage)
  - output.log: Captured agent output
  - repo/: Repository state after agent execution

## Metrics Available
Each run's metrics.json contains:
- run_id, agent_id: Identifiers
- status, termination: How the run ended
- exit_code: 0 = success
- duration_seconds: Execution time
- has_commits: Whether the agent made git commits
- git_diff: files_changed, insertions, deletions
- plan: total_lines, sections, tasks, files_referenced
- token_usage: Token counts per category

## Your Approach
1. List all run directories to understand what needs to be analyzed
2. Create a todo list with one task per run directory
3. For each run directory, read metrics.json and the generated plan, and note key observations
4. Synthesize your findings across runs and agents
5. Write the output files, iterating until complete

## Output Files
1. /workspace/results/analysis.md: a markdown report with an executive summary,
   agent-by-agent analysis, comparative rankings and notable observations.
2. /workspace/results/stats.json: key statistics (experiment_name, total_runs,
   per-agent stats, rankings).

## User Criteria
The user will provide specific criteria to evaluate. Focus your analysis on those criteria.
"#;

/// File name of the instruction file mounted into the reviewer
const INSTRUCTIONS_FILE: &str = "system-prompt.txt";

/// Run the reviewer over `results_path`.
///
/// Fails when the execution could not run, reported an error, or exited
/// non-zero.
#[instrument(skip(backend, analysis), fields(results = %results_path.display()))]
pub async fn run_ai_analysis(
    backend: &dyn ExecutionBackend,
    results_path: &Path,
    analysis: &AnalysisConfig,
) -> Result<()> {
    let results_path = results_path
        .canonicalize()
        .with_context(|| format!("Results directory not found: {}", results_path.display()))?;

    let scratch = tempfile::Builder::new()
        .prefix("act-analysis-")
        .tempdir()
        .context("Failed to create analysis scratch directory")?;
    let instructions_file = scratch.path().join(INSTRUCTIONS_FILE);
    std::fs::write(&instructions_file, ANALYSIS_SYSTEM_PROMPT)
        .context("Failed to write analysis instructions")?;

    let request = AnalysisRequest {
        results_path,
        instructions_file,
        model: analysis.model.clone(),
        prompt: analysis.prompt.clone(),
        timeout: ANALYSIS_TIMEOUT,
    };

    info!(model = %request.model, "Starting analysis");
    let outcome = backend.launch_analysis(&request, true).await;
    backend.cleanup().await;
    let outcome = outcome.context("Analysis execution could not start")?;

    if let Some(error) = &outcome.error {
        bail!("AI analysis failed: {}", error);
    }
    if outcome.exit_code != 0 {
        bail!("AI analysis failed with exit code {}", outcome.exit_code);
    }

    info!("Analysis complete");
    Ok(())
}

/// Aggregate statistics for one agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSummary {
    pub agent_id: String,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    /// Means over successful runs (zero when there are none)
    pub avg_duration: f64,
    pub avg_plan_lines: f64,
    pub avg_plan_sections: f64,
    /// Summed over all runs
    pub total_tokens: u64,
}

/// Numeric view of a results directory
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSummary {
    pub experiment_name: String,
    pub results_path: PathBuf,
    /// Keyed by agent id
    pub agents: BTreeMap<String, AgentSummary>,
    /// Every readable metrics record, sorted by run id
    pub runs: Vec<RunMetrics>,
}

/// Total token count of a run, whichever accounting produced it
fn total_tokens(metrics: &RunMetrics) -> u64 {
    metrics
        .token_usage
        .get("total")
        .or_else(|| metrics.token_usage.get("total_tokens"))
        .copied()
        .unwrap_or(0)
}

fn mean(values: impl Iterator<Item = f64>, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    values.sum::<f64>() / count as f64
}

impl AgentSummary {
    fn from_runs(agent_id: &str, runs: &[&RunMetrics]) -> Self {
        let successful: Vec<&RunMetrics> = runs.iter().copied().filter(|r| r.is_success()).collect();
        let n = successful.len();

        Self {
            agent_id: agent_id.to_string(),
            total_runs: runs.len(),
            successful_runs: n,
            failed_runs: runs.len() - n,
            avg_duration: mean(successful.iter().map(|r| r.duration_seconds), n),
            avg_plan_lines: mean(successful.iter().map(|r| r.plan.total_lines as f64), n),
            avg_plan_sections: mean(successful.iter().map(|r| r.plan.sections as f64), n),
            total_tokens: runs.iter().map(|r| total_tokens(r)).sum(),
        }
    }
}

/// Read every `*/metrics.json` under `results_path` and group it by agent.
/// Unreadable records are skipped.
pub fn summarize_results(results_path: &Path) -> Result<ExperimentSummary> {
    let entries = std::fs::read_dir(results_path)
        .with_context(|| format!("Failed to read results directory {}", results_path.display()))?;

    let experiment_name = BenchmarkConfig::from_file(&results_path.join(CONFIG_FILE))
        .map(|config| config.experiment.name)
        .unwrap_or_else(|_| {
            results_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

    let mut runs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path().join(METRICS_FILE);
        if !entry.path().is_dir() || !path.exists() {
            continue;
        }
        match load_metrics(&path) {
            Ok(metrics) => runs.push(metrics),
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable metrics"),
        }
    }
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));

    let mut by_agent: BTreeMap<&str, Vec<&RunMetrics>> = BTreeMap::new();
    for metrics in &runs {
        by_agent.entry(metrics.agent_id.as_str()).or_default().push(metrics);
    }
    let agents = by_agent
        .into_iter()
        .map(|(agent_id, agent_runs)| {
            (agent_id.to_string(), AgentSummary::from_runs(agent_id, &agent_runs))
        })
        .collect();

    Ok(ExperimentSummary {
        experiment_name,
        results_path: results_path.to_path_buf(),
        agents,
        runs,
    })
}

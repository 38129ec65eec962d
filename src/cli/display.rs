//! Terminal output for experiments and their results.

use crate::analysis::ExperimentSummary;
use crate::config::BenchmarkConfig;
use crate::core::ExperimentState;
use crate::metrics::RunMetrics;

/// Longest error or activity text shown in the progress table
const DETAIL_WIDTH: usize = 60;

fn truncate(text: &str, width: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= width {
        return first_line.to_string();
    }
    let kept: String = first_line.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Experiment overview printed before the runs start
pub fn print_header(config: &BenchmarkConfig) {
    let settings = &config.settings;
    println!("Experiment: {}", config.experiment.name);
    if !config.experiment.description.is_empty() {
        println!("Description: {}", config.experiment.description);
    }
    println!("Target: {}", config.target.repo);
    println!(
        "Agents: {}",
        config
            .agents
            .iter()
            .map(|agent| agent.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Runs: {} per agent, {} total",
        settings.runs_per_agent,
        config.total_runs()
    );
    println!(
        "Mode: {} ({} worker(s)), timeout {} min",
        if settings.parallel { "parallel" } else { "sequential" },
        settings.worker_count(config.total_runs()),
        settings.timeout_minutes
    );
    println!();
}

/// Final status of every run, as seen by the progress reporter
pub fn print_progress(state: &ExperimentState) {
    if state.runs.is_empty() {
        return;
    }

    println!();
    println!("{:<28} {:<10} {:>10}  {}", "RUN", "STATUS", "DURATION", "DETAIL");
    println!("{}", "-".repeat(110));
    for run in &state.runs {
        let detail = run
            .error
            .as_deref()
            .or(run.activity.as_deref())
            .map(|text| truncate(text, DETAIL_WIDTH))
            .unwrap_or_default();
        println!(
            "{:<28} {:<10} {:>9.1}s  {}",
            run.run_id,
            run.status,
            run.duration.as_secs_f64(),
            detail
        );
    }
    println!(
        "\n{}/{} runs finished, {} successful",
        state.finished_runs(),
        state.total_runs,
        state.successful_runs()
    );
}

/// Per-agent aggregate table
pub fn print_summary(summary: &ExperimentSummary) {
    println!("\nSummary: {}", summary.experiment_name);
    println!(
        "{:<20} {:>5} {:>5} {:>7} {:>12} {:>11} {:>10} {:>12}",
        "AGENT", "RUNS", "OK", "FAILED", "AVG DURATION", "AVG LINES", "AVG SECT", "TOKENS"
    );
    println!("{}", "-".repeat(90));
    for agent in summary.agents.values() {
        println!(
            "{:<20} {:>5} {:>5} {:>7} {:>11.1}s {:>11.1} {:>10.1} {:>12}",
            agent.agent_id,
            agent.total_runs,
            agent.successful_runs,
            agent.failed_runs,
            agent.avg_duration,
            agent.avg_plan_lines,
            agent.avg_plan_sections,
            agent.total_tokens
        );
    }
}

/// Metrics of a single run
pub fn print_run(metrics: &RunMetrics) {
    println!("Run ID: {}", metrics.run_id);
    println!("Agent: {}", metrics.agent_id);
    println!("Status: {}", metrics.status);
    println!("Termination: {}", metrics.termination.as_str());
    println!("Exit code: {}", metrics.exit_code);
    println!("Duration: {:.1}s", metrics.duration_seconds);
    if let Some(error) = &metrics.error {
        println!("Error: {}", error);
    }

    println!("\nGit:");
    println!("  has commits: {}", metrics.has_commits);
    println!(
        "  diff: {} files changed, {} insertions(+), {} deletions(-)",
        metrics.git_diff.files_changed, metrics.git_diff.insertions, metrics.git_diff.deletions
    );

    println!("\nPlan:");
    println!("  lines: {}", metrics.plan.total_lines);
    println!("  sections: {}", metrics.plan.sections);
    println!("  tasks: {}", metrics.plan.tasks);
    if !metrics.plan.files_referenced.is_empty() {
        println!("  files referenced: {}", metrics.plan.files_referenced.join(", "));
    }

    if !metrics.token_usage.is_empty() {
        println!("\nTokens:");
        for (category, count) in &metrics.token_usage {
            println!("  {}: {}", category, count);
        }
    }
}

//! Command-line interface for act.
//!
//! Provides commands for running experiments, analyzing their results,
//! and browsing result directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::adapters::docker::{default_auth_file, DEFAULT_IMAGE};
use crate::adapters::{DockerBackend, DockerContext, ExecutionBackend};
use crate::analysis::{run_ai_analysis, summarize_results};
use crate::config::BenchmarkConfig;
use crate::core::orchestrator::{CONFIG_FILE, OUTPUT_LOG};
use crate::core::progress::PROGRESS_CHANNEL_CAPACITY;
use crate::core::{ExperimentOrchestrator, ExperimentReport, LogSink, ProgressReporter, ProgressSender};
use crate::metrics::{load_metrics, METRICS_FILE};

pub mod display;

/// Bytes of the run log printed by `show`
const LOG_PREVIEW_BYTES: usize = 2000;

/// act - run AI coding agents side by side and compare the results
#[derive(Parser, Debug)]
#[command(name = "act")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub docker: DockerArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Host-side container settings
#[derive(Args, Debug, Clone)]
pub struct DockerArgs {
    /// Docker CLI binary
    #[arg(long, global = true, env = "ACT_DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Image used for every run
    #[arg(long, global = true, env = "ACT_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Build context used when the image is missing
    #[arg(long, global = true, env = "ACT_DOCKER_DIR", default_value = "docker")]
    pub docker_dir: PathBuf,

    /// Credential file mounted read-only into each container
    /// (defaults to ~/.local/share/opencode/auth.json)
    #[arg(long, global = true, env = "ACT_AUTH_FILE")]
    pub auth_file: Option<PathBuf>,
}

impl DockerArgs {
    fn context(&self, memory_limit: &str) -> DockerContext {
        DockerContext {
            binary: self.docker_bin.clone(),
            image: self.image.clone(),
            build_dir: self.docker_dir.clone(),
            memory_limit: memory_limit.to_string(),
            auth_file: self.auth_file.clone().or_else(default_auth_file),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a benchmark experiment
    Run {
        /// Experiment config (YAML)
        config: PathBuf,

        /// Directory that receives the results
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Run one agent execution at a time
        #[arg(long)]
        no_parallel: bool,
    },

    /// Run the AI reviewer over an experiment's results
    Analyze {
        /// Experiment results directory
        results_dir: PathBuf,
    },

    /// Run an experiment, then analyze it
    RunAndAnalyze {
        /// Experiment config (YAML)
        config: PathBuf,

        /// Directory that receives the results
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Run one agent execution at a time
        #[arg(long)]
        no_parallel: bool,
    },

    /// List experiment result directories
    List {
        /// Directory holding experiment results
        #[arg(short = 'd', long, default_value = "results")]
        results_dir: PathBuf,
    },

    /// Show the metrics and log of a single run
    Show {
        /// Run directory (results/<experiment>/<run-id>)
        run_dir: PathBuf,
    },

    /// Show per-agent statistics for an experiment
    Summary {
        /// Experiment results directory
        results_dir: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                output,
                no_parallel,
            } => {
                run_experiment(&config, &output, no_parallel, &self.docker).await?;
                Ok(())
            }
            Commands::Analyze { results_dir } => analyze(&results_dir, &self.docker).await,
            Commands::RunAndAnalyze {
                config,
                output,
                no_parallel,
            } => run_and_analyze(&config, &output, no_parallel, &self.docker).await,
            Commands::List { results_dir } => list_experiments(&results_dir),
            Commands::Show { run_dir } => show_run(&run_dir),
            Commands::Summary { results_dir } => show_summary(&results_dir),
        }
    }
}

fn load_config(path: &Path) -> Result<BenchmarkConfig> {
    BenchmarkConfig::from_file(path)
        .with_context(|| format!("Invalid experiment config {}", path.display()))
}

/// Run an experiment with live progress, cancelled by Ctrl+C
async fn run_experiment(
    config_path: &Path,
    output: &Path,
    no_parallel: bool,
    docker: &DockerArgs,
) -> Result<ExperimentReport> {
    let mut config = load_config(config_path)?;
    if no_parallel {
        config.settings.parallel = false;
    }
    display::print_header(&config);

    let backend: Arc<dyn ExecutionBackend> =
        Arc::new(DockerBackend::new(docker.context(&config.settings.memory_limit)));

    let (progress, progress_rx) = ProgressSender::channel(PROGRESS_CHANNEL_CAPACITY);
    let reporter = ProgressReporter::new(Box::new(LogSink)).spawn(progress_rx);

    let cancel = CancellationToken::new();
    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, cleaning up...");
                cancel.cancel();
            }
        })
    };

    let orchestrator = ExperimentOrchestrator::new(config, backend, output)?.with_progress(progress);
    let result = orchestrator.run(cancel).await;
    signal.abort();
    drop(orchestrator);

    let state = reporter.await.context("Progress reporter failed")?;
    display::print_progress(&state);

    let report = result?;
    println!("\nResults saved to: {}", report.results_path.display());
    match summarize_results(&report.results_path) {
        Ok(summary) => display::print_summary(&summary),
        Err(e) => eprintln!("Could not summarize results: {:#}", e),
    }

    Ok(report)
}

/// Run the reviewer over a results directory
async fn analyze(results_dir: &Path, docker: &DockerArgs) -> Result<()> {
    let config_path = results_dir.join(CONFIG_FILE);
    let config = load_config(&config_path)?;
    let Some(analysis) = config.analysis_with_prompt() else {
        bail!(
            "No analysis prompt configured. Add an 'analysis' block with a 'prompt' to {}",
            config_path.display()
        );
    };

    let backend = DockerBackend::new(docker.context(&config.settings.memory_limit));
    run_ai_analysis(&backend, results_dir, analysis).await?;

    println!(
        "\nAnalysis written to: {}",
        results_dir.join("analysis.md").display()
    );
    Ok(())
}

async fn run_and_analyze(
    config_path: &Path,
    output: &Path,
    no_parallel: bool,
    docker: &DockerArgs,
) -> Result<()> {
    let config = load_config(config_path)?;
    if config.analysis_with_prompt().is_none() {
        bail!(
            "No analysis prompt configured. Add an 'analysis' block with a 'prompt' to {}",
            config_path.display()
        );
    }

    let report = run_experiment(config_path, output, no_parallel, docker).await?;
    analyze(&report.results_path, docker).await
}

/// List experiment directories, newest first
fn list_experiments(results_dir: &Path) -> Result<()> {
    if !results_dir.exists() {
        println!("No results found in {}", results_dir.display());
        return Ok(());
    }

    let mut experiments: Vec<PathBuf> = std::fs::read_dir(results_dir)
        .with_context(|| format!("Failed to read {}", results_dir.display()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    experiments.sort();
    experiments.reverse();

    if experiments.is_empty() {
        println!("No experiments found");
        return Ok(());
    }

    println!("{:<48} {:<28} {:>5}", "DIRECTORY", "EXPERIMENT", "RUNS");
    println!("{}", "-".repeat(83));

    for path in experiments {
        let directory = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = BenchmarkConfig::from_file(&path.join(CONFIG_FILE))
            .map(|config| config.experiment.name)
            .unwrap_or_else(|_| "-".to_string());
        let runs = std::fs::read_dir(&path)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|entry| entry.path().join(METRICS_FILE).exists())
                    .count()
            })
            .unwrap_or(0);

        println!("{:<48} {:<28} {:>5}", directory, name, runs);
    }

    Ok(())
}

/// Print one run's metrics and the head of its log
fn show_run(run_dir: &Path) -> Result<()> {
    let metrics_path = run_dir.join(METRICS_FILE);
    let metrics = load_metrics(&metrics_path)
        .with_context(|| format!("No readable metrics at {}", metrics_path.display()))?;
    display::print_run(&metrics);

    let log = [
        run_dir.join(".benchmark").join("run.log"),
        run_dir.join("run.log"),
        run_dir.join(OUTPUT_LOG),
    ]
    .into_iter()
    .find(|path| path.exists());

    match log {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let head = &bytes[..bytes.len().min(LOG_PREVIEW_BYTES)];
            println!("\nRun log ({}):", path.display());
            println!("{}", String::from_utf8_lossy(head));
            if bytes.len() > LOG_PREVIEW_BYTES {
                println!("... ({} more bytes)", bytes.len() - LOG_PREVIEW_BYTES);
            }
        }
        None => println!("\nNo log file found"),
    }

    Ok(())
}

fn show_summary(results_dir: &Path) -> Result<()> {
    let summary = summarize_results(results_dir)?;
    if summary.runs.is_empty() {
        println!("No run metrics found in {}", results_dir.display());
        return Ok(());
    }
    display::print_summary(&summary);
    Ok(())
}

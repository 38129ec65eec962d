//! Experiment orchestrator.
//!
//! Expands a config into run descriptors, drives them through an
//! [`ExecutionBackend`] with a fixed pool of workers, and produces exactly one
//! outcome and one metrics record per descriptor. Per-run failures become
//! data; only configuration errors and operator interrupts reach the caller.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Local;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::ExecutionBackend;
use crate::config::{BenchmarkConfig, ConfigError, TimeoutStatus};
use crate::domain::{
    LaunchParameters, ProgressEvent, PromptSource, RunDescriptor, RunOutcome, RunStatus,
    Termination,
};
use crate::metrics::{collect_run_metrics, save_metrics, RunMetrics, METRICS_FILE};

use super::progress::ProgressSender;
use super::workspace::WorkspaceManager;

/// Resolved config stored with the results
pub const CONFIG_FILE: &str = "config.yaml";

/// Captured output stored with each run
pub const OUTPUT_LOG: &str = "output.log";

/// Errors that end an experiment
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(
        "Experiment interrupted after {completed}/{total} runs, partial results in {}",
        .results_path.display()
    )]
    Interrupted {
        results_path: PathBuf,
        completed: usize,
        total: usize,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> ExperimentError {
    let context = context.into();
    move |source| ExperimentError::Io { context, source }
}

/// Everything an experiment produced
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    pub results_path: PathBuf,
    /// One per descriptor, in completion order
    pub outcomes: Vec<RunOutcome>,
    /// One per descriptor, in descriptor order
    pub metrics: Vec<RunMetrics>,
}

impl ExperimentReport {
    pub fn successful_runs(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }
}

/// Drives one experiment from config to persisted results
pub struct ExperimentOrchestrator {
    config: BenchmarkConfig,
    backend: Arc<dyn ExecutionBackend>,
    output_base: PathBuf,
    workspace_parent: Option<PathBuf>,
    progress: Option<ProgressSender>,
}

impl ExperimentOrchestrator {
    /// Create an orchestrator for a config. The config is validated here so an
    /// invalid one never schedules a run.
    pub fn new(
        config: BenchmarkConfig,
        backend: Arc<dyn ExecutionBackend>,
        output_base: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            output_base: output_base.into(),
            workspace_parent: None,
            progress: None,
        })
    }

    /// Put the experiment temp root under `dir` instead of the system temp dir
    pub fn with_workspace_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_parent = Some(dir.into());
        self
    }

    /// Publish lifecycle events on `sender`
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.emit(event);
        }
    }

    /// Run the experiment until every descriptor has an outcome or `cancel`
    /// fires. Teardown of workspaces and executions runs on every path.
    #[instrument(skip(self, cancel), fields(experiment = %self.config.experiment.name))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExperimentReport, ExperimentError> {
        let results_path = self.create_results_dir()?;
        self.save_config(&results_path)?;
        info!(results = %results_path.display(), "Starting experiment");

        let workspaces = match &self.workspace_parent {
            Some(parent) => WorkspaceManager::new_in(parent),
            None => WorkspaceManager::new(),
        }
        .map_err(io_error("Failed to create workspace root"))?;

        let result = self.drive(&workspaces, &results_path, &cancel).await;

        self.backend.cleanup().await;
        workspaces.cleanup();
        debug!("Teardown complete");

        let (report, completed) = result?;
        if cancel.is_cancelled() && completed < report.metrics.len() {
            warn!(completed, total = report.metrics.len(), "Experiment interrupted");
            return Err(ExperimentError::Interrupted {
                results_path,
                completed,
                total: report.metrics.len(),
            });
        }

        info!(
            total = report.metrics.len(),
            successful = report.successful_runs(),
            "Experiment complete"
        );
        Ok(report)
    }

    /// Everything between workspace creation and teardown. Returns the report
    /// and the number of runs that reported on their own.
    async fn drive(
        &self,
        workspaces: &WorkspaceManager,
        results_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(ExperimentReport, usize), ExperimentError> {
        let descriptors = self.expand(workspaces)?;

        self.emit(ProgressEvent::ExperimentStarted {
            name: self.config.experiment.name.clone(),
            total_runs: descriptors.len(),
        });
        for descriptor in &descriptors {
            self.emit(ProgressEvent::RunRegistered {
                run_id: descriptor.run_id.clone(),
                agent_id: descriptor.agent_id.clone(),
                run_number: descriptor.run_number,
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            prepared = self.backend.prepare() => {
                if let Err(e) = prepared {
                    warn!(backend = self.backend.name(), error = %e, "Backend preparation failed");
                }
            }
        }

        let mut outcomes = self.execute(&descriptors, cancel).await;
        let completed = outcomes.len();

        let reported: HashSet<String> = outcomes.iter().map(|o| o.run_id.clone()).collect();
        for descriptor in &descriptors {
            if !reported.contains(&descriptor.run_id) {
                outcomes.push(self.unreported(descriptor, cancel.is_cancelled()));
            }
        }

        info!("Collecting results");
        let mut metrics = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            if let Some(outcome) = outcomes.iter().find(|o| o.run_id == descriptor.run_id) {
                metrics.push(
                    self.collect(descriptor, outcome, workspaces, results_path)
                        .await,
                );
            }
        }

        Ok((
            ExperimentReport {
                results_path: results_path.to_path_buf(),
                outcomes,
                metrics,
            },
            completed,
        ))
    }

    /// `<output>/<name>-<YYYY-MM-DD-HHMMSS>`
    fn create_results_dir(&self) -> Result<PathBuf, ExperimentError> {
        let timestamp = Local::now().format("%Y-%m-%d-%H%M%S");
        let path = self
            .output_base
            .join(format!("{}-{}", self.config.experiment.name, timestamp));
        fs::create_dir_all(&path).map_err(io_error(format!(
            "Failed to create results directory {}",
            path.display()
        )))?;
        Ok(path)
    }

    fn save_config(&self, results_path: &Path) -> Result<(), ExperimentError> {
        let yaml = self.config.to_yaml()?;
        fs::write(results_path.join(CONFIG_FILE), yaml)
            .map_err(io_error("Failed to save experiment config"))
    }

    /// Agents in config order, run numbers 1..=runs_per_agent
    fn expand(&self, workspaces: &WorkspaceManager) -> Result<Vec<RunDescriptor>, ExperimentError> {
        let config = &self.config;
        let prompt = match (&config.prompt.file, &config.prompt.text) {
            (Some(file), _) => PromptSource::File(file.clone()),
            (None, Some(text)) => PromptSource::Text(text.clone()),
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "Either 'prompt.file' or 'prompt.text' must be provided".into(),
                )
                .into())
            }
        };

        let mut descriptors = Vec::with_capacity(config.total_runs());
        for agent in &config.agents {
            for run_number in 1..=config.settings.runs_per_agent {
                let run_id = RunDescriptor::run_id_for(&agent.id, run_number);
                let workspace = workspaces
                    .create(&run_id)
                    .map_err(io_error(format!("Failed to create workspace for {}", run_id)))?;

                descriptors.push(RunDescriptor {
                    run_id: run_id.clone(),
                    agent_id: agent.id.clone(),
                    run_number,
                    parameters: LaunchParameters {
                        run_id,
                        repo_url: config.target.repo.clone(),
                        repo_commit: config.target.commit.clone(),
                        prompt: prompt.clone(),
                        model: agent.model.clone(),
                        extra_args: agent.extra_args.clone(),
                        timeout: config.settings.timeout(),
                        workspace,
                    },
                });
            }
        }

        Ok(descriptors)
    }

    /// Run every descriptor through the worker pool. Returns the outcomes
    /// that were reported, in completion order.
    async fn execute(
        &self,
        descriptors: &[RunDescriptor],
        cancel: &CancellationToken,
    ) -> Vec<RunOutcome> {
        let workers = self.config.settings.worker_count(descriptors.len());
        info!(
            runs = descriptors.len(),
            workers,
            parallel = self.config.settings.parallel,
            "Scheduling runs"
        );

        let queue = Arc::new(Mutex::new(descriptors.iter().cloned().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = RunExecutor {
            backend: Arc::clone(&self.backend),
            progress: self.progress.clone(),
            timeout_status: self.config.settings.timeout_status,
        };

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let worker = Worker {
                runner: runner.clone(),
                queue: Arc::clone(&queue),
                cancel: cancel.clone(),
                tx: tx.clone(),
            };
            pool.spawn(worker.run());
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(descriptors.len());
        let mut interrupted = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                received = rx.recv() => match received {
                    Some(outcome) => outcomes.push(outcome),
                    None => break,
                },
            }
        }

        if interrupted {
            while let Ok(outcome) = rx.try_recv() {
                outcomes.push(outcome);
            }
            info!(
                completed = outcomes.len(),
                in_flight = pool.len(),
                "Interrupted, cancelling in-flight runs"
            );
            pool.abort_all();
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Run worker panicked");
                }
            }
        }

        // A worker that was mid-poll at abort time can still have reported
        if interrupted {
            while let Ok(outcome) = rx.try_recv() {
                outcomes.push(outcome);
            }
        }

        outcomes
    }

    /// Outcome for a descriptor that never reported back
    fn unreported(&self, descriptor: &RunDescriptor, interrupted: bool) -> RunOutcome {
        let outcome = if interrupted {
            RunOutcome::cancelled(descriptor, "interrupted before completion")
        } else {
            RunOutcome::failed(
                &descriptor.run_id,
                descriptor.parameters.workspace.clone(),
                Termination::Crashed,
                "run did not report an outcome",
                String::new(),
            )
        };

        self.emit(ProgressEvent::RunFinished {
            run_id: descriptor.run_id.clone(),
            status: RunStatus::classify(&outcome, self.config.settings.timeout_status),
            duration: outcome.duration,
            error: outcome.error.clone(),
        });
        outcome
    }

    /// Copy a run's workspace into the results and persist its metrics.
    /// Failures are logged and never abort collection of other runs.
    async fn collect(
        &self,
        descriptor: &RunDescriptor,
        outcome: &RunOutcome,
        workspaces: &WorkspaceManager,
        results_path: &Path,
    ) -> RunMetrics {
        let run_id = descriptor.run_id.as_str();
        let run_path = results_path.join(run_id);
        if let Err(e) = fs::create_dir_all(&run_path) {
            warn!(%run_id, error = %e, "Failed to create run results directory");
        }

        let copied = workspaces.copy_results(run_id, &run_path);
        debug!(%run_id, files = copied, "Copied workspace");

        // A nested .git would be picked up as a submodule when results are committed
        let repo_git = run_path.join("repo").join(".git");
        if repo_git.exists() {
            if let Err(e) = fs::remove_dir_all(&repo_git) {
                warn!(%run_id, error = %e, "Failed to strip nested .git");
            }
        }

        if !outcome.output.is_empty() {
            if let Err(e) = fs::write(run_path.join(OUTPUT_LOG), &outcome.output) {
                warn!(%run_id, error = %e, "Failed to save run output");
            }
        }

        let status = RunStatus::classify(outcome, self.config.settings.timeout_status);
        let metrics = collect_run_metrics(&descriptor.agent_id, outcome, status).await;
        if let Err(e) = save_metrics(&metrics, &run_path.join(METRICS_FILE)) {
            warn!(%run_id, error = %e, "Failed to save metrics");
        }
        metrics
    }
}

/// Per-run execution shared by all workers
#[derive(Clone)]
struct RunExecutor {
    backend: Arc<dyn ExecutionBackend>,
    progress: Option<ProgressSender>,
    timeout_status: TimeoutStatus,
}

impl RunExecutor {
    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.emit(event);
        }
    }

    /// Launch one run. Never fails: backend errors become an outcome.
    #[instrument(skip(self, descriptor), fields(run_id = %descriptor.run_id, agent_id = %descriptor.agent_id))]
    async fn execute_run(&self, descriptor: &RunDescriptor) -> RunOutcome {
        self.emit(ProgressEvent::RunStarted {
            run_id: descriptor.run_id.clone(),
        });
        info!("Run started");

        let started = Instant::now();
        let activity = self
            .progress
            .as_ref()
            .map(|progress| progress.activity_sink(&descriptor.run_id));

        let outcome = match self.backend.launch(&descriptor.parameters, activity).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Launch failed");
                RunOutcome::failed(
                    &descriptor.run_id,
                    descriptor.parameters.workspace.clone(),
                    e.termination(),
                    e.to_string(),
                    String::new(),
                )
            }
        }
        .with_duration(started.elapsed());

        let status = RunStatus::classify(&outcome, self.timeout_status);
        info!(
            %status,
            exit_code = outcome.exit_code,
            termination = outcome.termination.as_str(),
            duration_secs = outcome.duration.as_secs_f64(),
            "Run finished"
        );
        self.emit(ProgressEvent::RunFinished {
            run_id: descriptor.run_id.clone(),
            status,
            duration: outcome.duration,
            error: outcome.error.clone(),
        });

        outcome
    }
}

/// One member of the worker pool
struct Worker {
    runner: RunExecutor,
    queue: Arc<Mutex<VecDeque<RunDescriptor>>>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<RunOutcome>,
}

impl Worker {
    fn next(&self) -> Option<RunDescriptor> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    /// Take descriptors off the queue until it is empty or the experiment is
    /// cancelled
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            let Some(descriptor) = self.next() else {
                break;
            };
            let outcome = self.runner.execute_run(&descriptor).await;
            if self.tx.send(outcome).is_err() {
                break;
            }
        }
    }
}

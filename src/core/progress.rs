//! Live progress reporting.
//!
//! Workers never touch the progress state directly. They emit
//! [`ProgressEvent`]s on a bounded channel with `try_send`; a single reporter
//! task owns [`ExperimentState`] and folds events into it, the same way run
//! state is rebuilt from an event log. A full channel drops the event instead
//! of stalling the run.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{ProgressEvent, RunStatus};

/// Default capacity of the progress channel
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Sending half of the progress channel
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Create a progress channel with the given capacity
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Emit an event without waiting. Dropped if the channel is full or closed.
    pub fn emit(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(run_id = ?event.run_id(), "Progress channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Sink that tags activity lines with a run id
    pub fn activity_sink(&self, run_id: &str) -> ActivitySink {
        ActivitySink {
            run_id: run_id.to_string(),
            sender: self.clone(),
        }
    }
}

/// Where the execution backend forwards activity lines for one run
#[derive(Debug, Clone)]
pub struct ActivitySink {
    run_id: String,
    sender: ProgressSender,
}

impl ActivitySink {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, line: String) {
        self.sender.emit(ProgressEvent::Activity {
            run_id: self.run_id.clone(),
            line,
        });
    }
}

/// Progress view of a single run
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub agent_id: String,
    pub run_number: u32,
    pub status: RunStatus,
    pub duration: Duration,
    /// Most recent activity line
    pub activity: Option<String>,
    pub error: Option<String>,
}

/// Progress view of the whole experiment. Display only: final results come
/// from the outcome list, never from here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentState {
    pub name: String,
    pub total_runs: usize,
    /// Runs in registration order
    pub runs: Vec<RunState>,
}

impl ExperimentState {
    /// Look up a run by id
    pub fn run(&self, run_id: &str) -> Option<&RunState> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    fn run_mut(&mut self, run_id: &str) -> Option<&mut RunState> {
        self.runs.iter_mut().find(|r| r.run_id == run_id)
    }

    /// Fold one event into the state. Last writer wins per run.
    pub fn apply_event(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ExperimentStarted { name, total_runs } => {
                self.name = name.clone();
                self.total_runs = *total_runs;
            }
            ProgressEvent::RunRegistered {
                run_id,
                agent_id,
                run_number,
            } => {
                if self.run(run_id).is_none() {
                    self.runs.push(RunState {
                        run_id: run_id.clone(),
                        agent_id: agent_id.clone(),
                        run_number: *run_number,
                        status: RunStatus::Pending,
                        duration: Duration::ZERO,
                        activity: None,
                        error: None,
                    });
                }
            }
            ProgressEvent::RunStarted { run_id } => {
                if let Some(run) = self.run_mut(run_id) {
                    run.status = RunStatus::Running;
                }
            }
            ProgressEvent::Activity { run_id, line } => {
                if let Some(run) = self.run_mut(run_id) {
                    run.activity = Some(line.clone());
                }
            }
            ProgressEvent::RunFinished {
                run_id,
                status,
                duration,
                error,
            } => {
                if let Some(run) = self.run_mut(run_id) {
                    run.status = *status;
                    run.duration = *duration;
                    run.error = error.clone();
                }
            }
        }
    }

    /// Runs that reached a final status
    pub fn finished_runs(&self) -> usize {
        self.runs.iter().filter(|r| r.status.is_finished()).count()
    }

    /// Runs that completed with exit code 0
    pub fn successful_runs(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .count()
    }
}

/// Subscriber notified of every event after it has been applied
pub trait ProgressSink: Send {
    fn on_event(&mut self, event: &ProgressEvent, state: &ExperimentState);
}

/// Sink that writes progress through `tracing`
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_event(&mut self, event: &ProgressEvent, state: &ExperimentState) {
        match event {
            ProgressEvent::ExperimentStarted { name, total_runs } => {
                info!(experiment = %name, total_runs, "Experiment started");
            }
            ProgressEvent::RunRegistered { .. } => {}
            ProgressEvent::RunStarted { run_id } => {
                info!(%run_id, "Run started");
            }
            ProgressEvent::Activity { run_id, line } => {
                debug!(%run_id, activity = %line);
            }
            ProgressEvent::RunFinished {
                run_id,
                status,
                duration,
                error,
            } => {
                let finished = state.finished_runs();
                let total = state.total_runs;
                match error {
                    Some(error) => warn!(
                        %run_id,
                        %status,
                        duration_secs = duration.as_secs_f64(),
                        %error,
                        "Run finished ({}/{})",
                        finished,
                        total
                    ),
                    None => info!(
                        %run_id,
                        %status,
                        duration_secs = duration.as_secs_f64(),
                        "Run finished ({}/{})",
                        finished,
                        total
                    ),
                }
            }
        }
    }
}

/// Owner of the experiment's progress state
pub struct ProgressReporter {
    state: ExperimentState,
    sink: Box<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(sink: Box<dyn ProgressSink>) -> Self {
        Self {
            state: ExperimentState::default(),
            sink,
        }
    }

    /// Drain `rx` on a background task until every sender is dropped, then
    /// hand back the final state.
    pub fn spawn(self, rx: mpsc::Receiver<ProgressEvent>) -> JoinHandle<ExperimentState> {
        tokio::spawn(self.run(rx))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ProgressEvent>) -> ExperimentState {
        while let Some(event) = rx.recv().await {
            self.state.apply_event(&event);
            self.sink.on_event(&event, &self.state);
        }
        self.state
    }
}

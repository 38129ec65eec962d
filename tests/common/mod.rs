//! Scripted in-memory execution backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use act::adapters::{AnalysisOutcome, AnalysisRequest, BackendError, ExecutionBackend};
use act::core::ActivitySink;
use act::domain::{LaunchParameters, RunOutcome, Termination};
use act::BenchmarkConfig;
use async_trait::async_trait;

/// What a scripted run does
#[derive(Debug, Clone)]
pub enum Script {
    /// Exit with the given code after the backend delay
    Exit(i64),
    /// Fail before the execution starts
    LaunchError,
    /// Report a timeout
    TimedOut,
    /// Never finish
    Hang,
    /// Hold the worker thread without yielding, then exit 0
    Blocking(Duration),
}

#[derive(Default)]
pub struct ScriptedBackend {
    pub scripts: HashMap<String, Script>,
    pub delay: Duration,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub launched: Mutex<Vec<String>>,
    pub cleaned: AtomicBool,
    pub analysis_requests: Mutex<Vec<(AnalysisRequest, String)>>,
    pub analysis_exit_code: i64,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(mut self, run_id: &str, script: Script) -> Self {
        self.scripts.insert(run_id.to_string(), script);
        self
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn was_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

/// Tracks one in-flight run, also when the run future is dropped
struct ActiveRun<'a>(&'a AtomicUsize);

impl<'a> ActiveRun<'a> {
    fn enter(active: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn prepare(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn launch(
        &self,
        params: &LaunchParameters,
        activity: Option<ActivitySink>,
    ) -> Result<RunOutcome, BackendError> {
        self.launched.lock().unwrap().push(params.run_id.clone());
        let script = self
            .scripts
            .get(&params.run_id)
            .cloned()
            .unwrap_or(Script::Exit(0));

        if let Script::LaunchError = script {
            return Err(BackendError::Launch(format!("no capacity for {}", params.run_id)));
        }

        let _active = ActiveRun::enter(&self.active, &self.max_active);
        if let Some(sink) = &activity {
            sink.emit(format!("→ Read {}/README.md", params.run_id));
        }

        // What a real agent leaves behind
        let repo = params.workspace.join("repo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::write(repo.join(".git").join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(repo.join("PLAN.md"), "# Plan\n- [ ] Edit `src/lib.rs`\n").unwrap();
        std::fs::write(
            params.workspace.join("metrics.json"),
            r#"{"duration_seconds": 42.5}"#,
        )
        .unwrap();

        match script {
            Script::Hang => std::future::pending::<()>().await,
            Script::Blocking(hold) => std::thread::sleep(hold),
            _ => tokio::time::sleep(self.delay).await,
        }

        let outcome = match script {
            Script::TimedOut => RunOutcome::failed(
                &params.run_id,
                params.workspace.clone(),
                Termination::TimedOut,
                "timed out after 60s",
                "partial output\n".to_string(),
            ),
            Script::Blocking(_) => RunOutcome::exited(params, 0, String::new()),
            Script::Exit(code) => RunOutcome::exited(
                params,
                code,
                format!("working on {}\ninput_tokens: 120\noutput_tokens: 30\n", params.run_id),
            ),
            Script::LaunchError | Script::Hang => unreachable!(),
        };
        Ok(outcome)
    }

    async fn launch_analysis(
        &self,
        request: &AnalysisRequest,
        _echo: bool,
    ) -> Result<AnalysisOutcome, BackendError> {
        let instructions = std::fs::read_to_string(&request.instructions_file).unwrap_or_default();
        self.analysis_requests
            .lock()
            .unwrap()
            .push((request.clone(), instructions));

        Ok(AnalysisOutcome {
            exit_code: self.analysis_exit_code,
            output: String::new(),
            error: None,
            termination: Termination::Exited,
        })
    }

    async fn cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

/// Config with the given agents and settings block
pub fn config(agents: &[&str], runs_per_agent: u32, parallel: bool) -> BenchmarkConfig {
    let agents: String = agents
        .iter()
        .map(|id| format!("  - id: {}\n    model: provider/{}\n", id, id))
        .collect();

    BenchmarkConfig::from_yaml(&format!(
        r#"
experiment:
  name: shootout
target:
  repo: https://example.com/repo.git
prompt:
  text: Write an implementation plan
settings:
  runs_per_agent: {}
  parallel: {}
  timeout_minutes: 1
agents:
{}
analysis:
  prompt: Rank the plans
"#,
        runs_per_agent, parallel, agents
    ))
    .unwrap()
}

/// Names of the entries in a directory, sorted
pub fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn run_ids(agents: &[&str], runs: u32) -> HashSet<String> {
    agents
        .iter()
        .flat_map(|agent| (1..=runs).map(move |n| format!("{}-{}", agent, n)))
        .collect()
}

//! Docker execution backend.
//!
//! Drives the `docker` CLI as a subprocess. Each run is one detached
//! container: started with its environment and mounts, optionally followed
//! through `docker logs -f`, waited on under the run's timeout, then
//! force-removed. Every container is tracked by a [`ContainerGuard`] so it is
//! removed on every exit path, including when the owning task is aborted.
//! `docker run` itself and removals fired from `Drop` run on tracked
//! housekeeping tasks that [`ExecutionBackend::cleanup`] waits for.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, OnceCell};
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::activity::parse_activity_line;
use super::{AnalysisOutcome, AnalysisRequest, BackendError, ExecutionBackend};
use crate::core::progress::ActivitySink;
use crate::domain::{LaunchParameters, PromptSource, RunOutcome, Termination, FAILURE_EXIT_CODE};

/// Default image tag
pub const DEFAULT_IMAGE: &str = "agent-benchmark-opencode";

/// In-container path of the run workspace
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// In-container path of the agent credential file
pub const AUTH_MOUNT: &str = "/root/.local/share/opencode/auth.json";

/// In-container path of the results directory during analysis
pub const RESULTS_MOUNT: &str = "/workspace/results";

/// In-container path of the analysis instruction file
pub const INSTRUCTIONS_MOUNT: &str = "/workspace/system-prompt.txt";

/// Entrypoint of the analysis execution
pub const ANALYSIS_ENTRYPOINT: &str = "/analyze-entrypoint.sh";

/// Agent-selector environment variables
pub const MODEL_ENV: &str = "OPENCODE_MODEL";
pub const EXTRA_ARGS_ENV: &str = "OPENCODE_EXTRA_ARGS";

/// Upper bound for housekeeping commands (logs, inspect, rm)
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

/// Host-side Docker settings, created once per process
#[derive(Debug, Clone, PartialEq)]
pub struct DockerContext {
    /// Docker CLI binary
    pub binary: String,
    /// Image every run starts from
    pub image: String,
    /// Build context used when the image is missing
    pub build_dir: PathBuf,
    /// `--memory` ceiling per container
    pub memory_limit: String,
    /// Host credential file, mounted read-only when it exists
    pub auth_file: Option<PathBuf>,
}

impl Default for DockerContext {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            build_dir: PathBuf::from("docker"),
            memory_limit: "4g".to_string(),
            auth_file: default_auth_file(),
        }
    }
}

/// `~/.local/share/opencode/auth.json`
pub fn default_auth_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".local/share/opencode/auth.json"))
}

type Registry = Arc<Mutex<HashMap<String, String>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, String>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Docker-backed [`ExecutionBackend`]
pub struct DockerBackend {
    context: DockerContext,
    image_ready: OnceCell<()>,
    /// Live containers: run key -> container id
    containers: Registry,
    /// Pending `docker run` calls and removals fired from `Drop`
    housekeeping: TaskTracker,
}

impl DockerBackend {
    pub fn new(context: DockerContext) -> Self {
        Self {
            context,
            image_ready: OnceCell::new(),
            containers: Arc::new(Mutex::new(HashMap::new())),
            housekeeping: TaskTracker::new(),
        }
    }

    pub fn context(&self) -> &DockerContext {
        &self.context
    }

    /// Number of containers currently tracked
    pub fn live_containers(&self) -> usize {
        lock(&self.containers).len()
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.context.binary);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Inspect the image, building it on a miss. Cached after the first success.
    async fn ensure_image(&self) -> Result<(), BackendError> {
        self.image_ready
            .get_or_try_init(|| async {
                let image = &self.context.image;
                let inspect = self
                    .docker()
                    .args(["image", "inspect", image.as_str()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map_err(|e| {
                        BackendError::ImageUnavailable(format!(
                            "failed to run {}: {}",
                            self.context.binary, e
                        ))
                    })?;

                if inspect.success() {
                    debug!(%image, "Image exists locally");
                    return Ok::<(), BackendError>(());
                }

                info!(%image, dir = %self.context.build_dir.display(), "Building image");
                let build = self
                    .docker()
                    .arg("build")
                    .arg("-t")
                    .arg(image)
                    .arg(&self.context.build_dir)
                    .output()
                    .await
                    .map_err(|e| BackendError::ImageUnavailable(e.to_string()))?;

                if !build.status.success() {
                    return Err(BackendError::ImageUnavailable(format!(
                        "docker build failed for '{}': {}",
                        image,
                        String::from_utf8_lossy(&build.stderr).trim()
                    )));
                }

                Ok::<(), BackendError>(())
            })
            .await
            .map(|_| ())
    }

    /// Credential mount, if the host file exists
    fn auth_mount(&self) -> Option<String> {
        self.context
            .auth_file
            .as_ref()
            .filter(|path| path.exists())
            .map(|path| format!("{}:{}:ro", path.display(), AUTH_MOUNT))
    }

    /// `docker run` arguments for a benchmark run
    pub fn run_args(&self, params: &LaunchParameters) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--memory".to_string(),
            self.context.memory_limit.clone(),
            "--label".to_string(),
            format!("act.run_id={}", params.run_id),
        ];

        for (key, value) in run_env(params) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("-v".to_string());
        args.push(format!("{}:{}:rw", params.workspace.display(), WORKSPACE_MOUNT));
        if let Some(mount) = self.auth_mount() {
            args.push("-v".to_string());
            args.push(mount);
        }

        args.push(self.context.image.clone());
        args
    }

    /// `docker run` arguments for the analysis execution
    pub fn analysis_args(&self, request: &AnalysisRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--memory".to_string(),
            self.context.memory_limit.clone(),
            "--entrypoint".to_string(),
            ANALYSIS_ENTRYPOINT.to_string(),
            "-e".to_string(),
            format!("ANALYSIS_PROMPT={}", request.prompt),
        ];
        if !request.model.is_empty() {
            args.push("-e".to_string());
            args.push(format!("{}={}", MODEL_ENV, request.model));
        }

        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:rw",
            request.results_path.display(),
            RESULTS_MOUNT
        ));
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:ro",
            request.instructions_file.display(),
            INSTRUCTIONS_MOUNT
        ));
        if let Some(mount) = self.auth_mount() {
            args.push("-v".to_string());
            args.push(mount);
        }

        args.push(self.context.image.clone());
        args
    }

    /// Start a detached container and return its id.
    ///
    /// `docker run` runs on a housekeeping task. If the caller is dropped
    /// before the id arrives, that task removes the container it created.
    async fn start_container(&self, args: Vec<String>) -> Result<String, BackendError> {
        let (tx, rx) = oneshot::channel();
        let binary = self.context.binary.clone();

        self.housekeeping.spawn(async move {
            let started = run_detached(&binary, &args).await;
            if let Err(Ok(container_id)) = tx.send(started) {
                warn!(container = %container_id, "Launch abandoned, removing container");
                remove_container(&binary, &container_id).await;
            }
        });

        rx.await
            .map_err(|_| BackendError::Launch("docker run task ended without a result".into()))?
    }

    /// Start, supervise and remove one container
    async fn execute(
        &self,
        key: &str,
        args: Vec<String>,
        limit: Duration,
        lines: Option<LineSink>,
    ) -> Execution {
        let container_id = match self.start_container(args).await {
            Ok(id) => id,
            Err(e) => {
                warn!(%key, error = %e, "Container failed to start");
                let output = match &e {
                    BackendError::Launch(stderr) => stderr.clone(),
                    _ => String::new(),
                };
                return Execution::failed(e.termination(), e.to_string(), output);
            }
        };

        let guard = ContainerGuard::track(
            &self.containers,
            &self.housekeeping,
            &self.context.binary,
            key,
            &container_id,
        );
        debug!(%key, container = %container_id, "Container started");

        let execution = self.supervise(&container_id, limit, lines).await;

        guard.release().await;
        execution
    }

    /// Follow and wait for a running container within `limit`
    async fn supervise(
        &self,
        container_id: &str,
        limit: Duration,
        lines: Option<LineSink>,
    ) -> Execution {
        let streamed = lines.is_some();
        let run = async {
            let output = match lines {
                Some(sink) => self.stream_logs(container_id, &sink).await?,
                None => String::new(),
            };
            let exit_code = self.wait_container(container_id).await?;
            Ok::<_, BackendError>((exit_code, output))
        };

        match timeout(limit, run).await {
            Ok(Ok((exit_code, output))) => {
                let output = if streamed {
                    output
                } else {
                    self.collect_logs(container_id).await
                };

                if self.was_oom_killed(container_id).await {
                    warn!(container = %container_id, "Container killed for exceeding memory limit");
                    return Execution {
                        exit_code,
                        output,
                        error: Some(format!(
                            "killed for exceeding the memory limit ({})",
                            self.context.memory_limit
                        )),
                        termination: Termination::OutOfMemory,
                    };
                }

                Execution {
                    exit_code,
                    output,
                    error: None,
                    termination: Termination::Exited,
                }
            }
            Ok(Err(e)) => {
                warn!(container = %container_id, error = %e, "Container failed");
                let output = self.collect_logs(container_id).await;
                Execution::failed(Termination::Crashed, e.to_string(), output)
            }
            Err(_) => {
                warn!(
                    container = %container_id,
                    timeout_secs = limit.as_secs(),
                    "Container timed out"
                );
                let output = self.collect_logs(container_id).await;
                Execution::failed(
                    Termination::TimedOut,
                    format!("timed out after {}s", limit.as_secs()),
                    output,
                )
            }
        }
    }

    /// Follow `docker logs -f` until the container stops, returning the
    /// combined output. stdout and stderr lines are interleaved by arrival.
    async fn stream_logs(&self, container_id: &str, sink: &LineSink) -> Result<String, BackendError> {
        let mut child = self
            .docker()
            .args(["logs", "-f", container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Runtime(format!("failed to follow logs: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Runtime("log stream has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Runtime("log stream has no stderr".into()))?;

        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_open = true;
        let mut err_open = true;
        let mut captured = String::new();

        while out_open || err_open {
            tokio::select! {
                read = out.read_until(b'\n', &mut out_buf), if out_open => {
                    out_open = take_line(read?, &mut out_buf, &mut captured, sink);
                }
                read = err.read_until(b'\n', &mut err_buf), if err_open => {
                    err_open = take_line(read?, &mut err_buf, &mut captured, sink);
                }
            }
        }

        child.wait().await?;
        Ok(captured)
    }

    /// Block until the container exits and return its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64, BackendError> {
        let output = self
            .docker()
            .args(["wait", container_id])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(BackendError::Runtime(format!(
                "docker wait failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<i64>().map_err(|_| {
            BackendError::Runtime(format!("unexpected docker wait output: {:?}", stdout.trim()))
        })
    }

    /// Full container logs, best effort
    async fn collect_logs(&self, container_id: &str) -> String {
        let mut logs = self.docker();
        logs.args(["logs", container_id]);
        match timeout(HOUSEKEEPING_TIMEOUT, logs.output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                text
            }
            Ok(Err(e)) => {
                debug!(container = %container_id, error = %e, "Failed to read logs");
                String::new()
            }
            Err(_) => String::new(),
        }
    }

    /// Whether the kernel OOM killer stopped the container
    async fn was_oom_killed(&self, container_id: &str) -> bool {
        let mut inspect = self.docker();
        inspect.args(["inspect", "--format", "{{.State.OOMKilled}}", container_id]);

        match timeout(HOUSEKEEPING_TIMEOUT, inspect.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self) -> Result<(), BackendError> {
        self.ensure_image().await
    }

    #[instrument(skip(self, params, activity), fields(run_id = %params.run_id))]
    async fn launch(
        &self,
        params: &LaunchParameters,
        activity: Option<ActivitySink>,
    ) -> Result<RunOutcome, BackendError> {
        self.ensure_image().await?;

        let args = self.run_args(params);
        let lines = activity.map(LineSink::Activity);
        let execution = self
            .execute(&params.run_id, args, params.timeout, lines)
            .await;

        Ok(RunOutcome {
            run_id: params.run_id.clone(),
            exit_code: execution.exit_code,
            output: execution.output,
            workspace: params.workspace.clone(),
            error: execution.error,
            termination: execution.termination,
            duration: Duration::ZERO,
        })
    }

    async fn launch_analysis(
        &self,
        request: &AnalysisRequest,
        echo: bool,
    ) -> Result<AnalysisOutcome, BackendError> {
        self.ensure_image().await?;

        let key = format!("analysis-{}", Uuid::new_v4());
        let args = self.analysis_args(request);
        let lines = echo.then_some(LineSink::Echo);
        let execution = self.execute(&key, args, request.timeout, lines).await;

        Ok(AnalysisOutcome {
            exit_code: execution.exit_code,
            output: execution.output,
            error: execution.error,
            termination: execution.termination,
        })
    }

    async fn cleanup(&self) {
        let remaining: Vec<(String, String)> = lock(&self.containers).drain().collect();
        for (key, container_id) in remaining {
            debug!(%key, container = %container_id, "Removing leftover container");
            remove_container(&self.context.binary, &container_id).await;
        }

        self.housekeeping.close();
        if timeout(HOUSEKEEPING_TIMEOUT, self.housekeeping.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.housekeeping.len(),
                "Timed out waiting for container housekeeping"
            );
        }
        self.housekeeping.reopen();
    }
}

/// Environment for a benchmark run
pub fn run_env(params: &LaunchParameters) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("RUN_ID", params.run_id.clone()),
        ("REPO_URL", params.repo_url.clone()),
    ];
    if let Some(commit) = &params.repo_commit {
        env.push(("REPO_COMMIT", commit.clone()));
    }
    match &params.prompt {
        PromptSource::File(path) => env.push(("PROMPT_FILE", path.clone())),
        PromptSource::Text(text) => env.push(("PROMPT_TEXT", text.clone())),
    }
    if let Some(model) = &params.model {
        env.push((MODEL_ENV, model.clone()));
    }
    if !params.extra_args.is_empty() {
        env.push((EXTRA_ARGS_ENV, params.extra_args.join(" ")));
    }
    env
}

/// Outcome of one container, before it is shaped for the caller
struct Execution {
    exit_code: i64,
    output: String,
    error: Option<String>,
    termination: Termination,
}

impl Execution {
    fn failed(termination: Termination, error: String, output: String) -> Self {
        Self {
            exit_code: FAILURE_EXIT_CODE,
            output,
            error: Some(error),
            termination,
        }
    }
}

/// Consumer of streamed output lines
enum LineSink {
    /// Forward recognized tool activity to the progress channel
    Activity(ActivitySink),
    /// Mirror every line to stdout
    Echo,
}

impl LineSink {
    fn observe(&self, line: &str) {
        match self {
            Self::Activity(sink) => {
                if let Some(activity) = parse_activity_line(line) {
                    sink.emit(activity);
                }
            }
            Self::Echo => println!("{}", line),
        }
    }
}

/// Record a line read into `buf`. Returns false at end of stream.
fn take_line(read: usize, buf: &mut Vec<u8>, captured: &mut String, sink: &LineSink) -> bool {
    if read == 0 {
        return false;
    }

    let line = String::from_utf8_lossy(buf);
    captured.push_str(&line);
    if !line.ends_with('\n') {
        captured.push('\n');
    }
    sink.observe(line.trim_end_matches(['\r', '\n']));
    buf.clear();
    true
}

/// `docker run -d`, returning the new container id
async fn run_detached(binary: &str, args: &[String]) -> Result<String, BackendError> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BackendError::Launch(format!("failed to run docker: {}", e)))?;

    if !output.status.success() {
        return Err(BackendError::Launch(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() {
        return Err(BackendError::Launch("docker run returned no container id".into()));
    }
    Ok(id)
}

/// `docker rm -f`, logging instead of failing
async fn remove_container(binary: &str, container_id: &str) {
    let mut rm = Command::new(binary);
    rm.args(["rm", "-f", container_id]).stdin(Stdio::null());

    match timeout(HOUSEKEEPING_TIMEOUT, rm.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            debug!(container = %container_id, "Container removed");
        }
        Ok(Ok(output)) => warn!(
            container = %container_id,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Failed to remove container"
        ),
        Ok(Err(e)) => warn!(container = %container_id, error = %e, "Failed to remove container"),
        Err(_) => warn!(container = %container_id, "Timed out removing container"),
    }
}

/// Ownership of one live container.
///
/// `release` removes it on the normal path. If the guard is dropped while
/// still armed (task aborted, future cancelled), `Drop` unregisters it and
/// schedules `docker rm -f` on the housekeeping tracker. Outside a runtime
/// the removal runs inline.
struct ContainerGuard {
    registry: Registry,
    housekeeping: TaskTracker,
    binary: String,
    key: String,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn track(
        registry: &Registry,
        housekeeping: &TaskTracker,
        binary: &str,
        key: &str,
        container_id: &str,
    ) -> Self {
        lock(registry).insert(key.to_string(), container_id.to_string());
        Self {
            registry: Arc::clone(registry),
            housekeeping: housekeeping.clone(),
            binary: binary.to_string(),
            key: key.to_string(),
            container_id: container_id.to_string(),
            armed: true,
        }
    }

    fn unregister(&self) {
        let mut containers = lock(&self.registry);
        if containers.get(&self.key) == Some(&self.container_id) {
            containers.remove(&self.key);
        }
    }

    async fn release(mut self) {
        self.armed = false;
        self.unregister();
        remove_container(&self.binary, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.unregister();

        if let Ok(handle) = Handle::try_current() {
            let binary = self.binary.clone();
            let container_id = self.container_id.clone();
            self.housekeeping.spawn_on(
                async move { remove_container(&binary, &container_id).await },
                &handle,
            );
            return;
        }

        let removed = std::process::Command::new(&self.binary)
            .args(["rm", "-f", self.container_id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = removed {
            warn!(container = %self.container_id, error = %e, "Failed to remove container on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(prompt: PromptSource) -> LaunchParameters {
        LaunchParameters {
            run_id: "sonnet-1".to_string(),
            repo_url: "https://example.com/repo.git".to_string(),
            repo_commit: Some("abc123".to_string()),
            prompt,
            model: Some("anthropic/claude-sonnet-4-5".to_string()),
            extra_args: vec!["--agent".to_string(), "plan".to_string()],
            timeout: Duration::from_secs(60),
            workspace: PathBuf::from("/tmp/act-1/sonnet-1"),
        }
    }

    fn context(auth_file: Option<PathBuf>) -> DockerContext {
        DockerContext {
            auth_file,
            ..DockerContext::default()
        }
    }

    #[test]
    fn test_run_env_with_prompt_file() {
        let env = run_env(&params(PromptSource::File("specs/plan.md".to_string())));
        let env: HashMap<_, _> = env.into_iter().collect();

        assert_eq!(env["RUN_ID"], "sonnet-1");
        assert_eq!(env["REPO_URL"], "https://example.com/repo.git");
        assert_eq!(env["REPO_COMMIT"], "abc123");
        assert_eq!(env["PROMPT_FILE"], "specs/plan.md");
        assert!(!env.contains_key("PROMPT_TEXT"));
        assert_eq!(env[MODEL_ENV], "anthropic/claude-sonnet-4-5");
        assert_eq!(env[EXTRA_ARGS_ENV], "--agent plan");
    }

    #[test]
    fn test_run_env_omits_optional_values() {
        let mut p = params(PromptSource::Text("write a plan".to_string()));
        p.repo_commit = None;
        p.model = None;
        p.extra_args.clear();

        let keys: Vec<&str> = run_env(&p).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["RUN_ID", "REPO_URL", "PROMPT_TEXT"]);
    }

    #[test]
    fn test_run_args_mounts_and_limits() {
        let backend = DockerBackend::new(context(None));
        let args = backend.run_args(&params(PromptSource::Text("x".to_string())));

        assert_eq!(&args[..4], &["run", "-d", "--memory", "4g"]);
        assert!(args.contains(&"/tmp/act-1/sonnet-1:/workspace:rw".to_string()));
        assert!(args.contains(&"PROMPT_TEXT=x".to_string()));
        assert!(!args.iter().any(|a| a.contains(AUTH_MOUNT)));
        assert_eq!(args.last().map(String::as_str), Some(DEFAULT_IMAGE));
    }

    #[test]
    fn test_auth_mounted_only_when_present() {
        let dir = TempDir::new().unwrap();
        let auth = dir.path().join("auth.json");

        let backend = DockerBackend::new(context(Some(auth.clone())));
        let p = params(PromptSource::Text("x".to_string()));
        assert!(!backend.run_args(&p).iter().any(|a| a.contains(AUTH_MOUNT)));

        std::fs::write(&auth, "{}").unwrap();
        let expected = format!("{}:{}:ro", auth.display(), AUTH_MOUNT);
        assert!(backend.run_args(&p).contains(&expected));
    }

    #[test]
    fn test_analysis_args() {
        let backend = DockerBackend::new(context(None));
        let request = AnalysisRequest {
            results_path: PathBuf::from("/results/exp-1"),
            instructions_file: PathBuf::from("/tmp/x/system-prompt.txt"),
            model: "anthropic/claude-opus-4-5".to_string(),
            prompt: "Compare the plans".to_string(),
            timeout: crate::adapters::ANALYSIS_TIMEOUT,
        };
        let args = backend.analysis_args(&request);

        assert!(args.contains(&ANALYSIS_ENTRYPOINT.to_string()));
        assert!(args.contains(&"ANALYSIS_PROMPT=Compare the plans".to_string()));
        assert!(args.contains(&format!("{}=anthropic/claude-opus-4-5", MODEL_ENV)));
        assert!(args.contains(&"/results/exp-1:/workspace/results:rw".to_string()));
        assert!(args.contains(&"/tmp/x/system-prompt.txt:/workspace/system-prompt.txt:ro".to_string()));
    }

    #[test]
    fn test_take_line_records_and_filters() {
        let (sender, mut rx) = crate::core::progress::ProgressSender::channel(8);
        let sink = LineSink::Activity(sender.activity_sink("a-1"));
        let mut captured = String::new();

        let mut buf = b"\x1b[32m\xe2\x9c\xb1 Glob\x1b[0m found 3 files\n".to_vec();
        assert!(take_line(buf.len(), &mut buf, &mut captured, &sink));
        let mut buf = b"Starting benchmark run...".to_vec();
        assert!(take_line(buf.len(), &mut buf, &mut captured, &sink));
        assert!(!take_line(0, &mut buf, &mut captured, &sink));

        assert!(captured.ends_with("Starting benchmark run...\n"));
        match rx.try_recv().unwrap() {
            crate::domain::ProgressEvent::Activity { run_id, line } => {
                assert_eq!(run_id, "a-1");
                assert_eq!(line, "✱ Glob found 3 files");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_before_launch() {
        let backend = DockerBackend::new(DockerContext {
            binary: "/nonexistent/act-docker".to_string(),
            ..context(None)
        });

        let result = backend
            .launch(&params(PromptSource::Text("x".to_string())), None)
            .await;
        assert!(matches!(result, Err(BackendError::ImageUnavailable(_))));
        assert_eq!(backend.live_containers(), 0);
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let tracker = TaskTracker::new();
        let guard = ContainerGuard::track(
            &registry,
            &tracker,
            "/nonexistent/act-docker",
            "a-1",
            "c0ffee",
        );
        assert_eq!(lock(&registry).get("a-1").map(String::as_str), Some("c0ffee"));

        drop(guard);
        assert!(lock(&registry).is_empty());
    }

    /// Stand-in `docker` CLI that appends every invocation to `calls.log`
    #[cfg(unix)]
    struct FakeDocker {
        dir: TempDir,
    }

    #[cfg(unix)]
    impl FakeDocker {
        /// `run` and `wait` are shell snippets for those subcommands
        fn new(run: &str, wait: &str, oom_killed: bool) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = TempDir::new().unwrap();
            let script = format!(
                "#!/bin/sh\n\
                 echo \"$*\" >> '{log}'\n\
                 case \"$1\" in\n\
                 image) exit 0 ;;\n\
                 run) {run} ;;\n\
                 wait) {wait} ;;\n\
                 logs) echo 'working'; exit 0 ;;\n\
                 inspect) echo {oom}; exit 0 ;;\n\
                 rm) exit 0 ;;\n\
                 esac\n",
                log = dir.path().join("calls.log").display(),
                run = run,
                wait = wait,
                oom = oom_killed,
            );
            let binary = dir.path().join("docker");
            std::fs::write(&binary, script).unwrap();
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        fn backend(&self) -> DockerBackend {
            DockerBackend::new(DockerContext {
                binary: self.dir.path().join("docker").display().to_string(),
                ..context(None)
            })
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn removed(&self, container_id: &str) -> bool {
            self.calls().contains(&format!("rm -f {}", container_id))
        }
    }

    #[cfg(unix)]
    fn fake_params(workspace: &TempDir, timeout: Duration) -> LaunchParameters {
        LaunchParameters {
            timeout,
            workspace: workspace.path().to_path_buf(),
            ..params(PromptSource::Text("x".to_string()))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_container_is_removed() {
        let docker = FakeDocker::new("echo c0ffee1234", "echo 3", false);
        let workspace = TempDir::new().unwrap();
        let backend = docker.backend();

        let outcome = backend
            .launch(&fake_params(&workspace, Duration::from_secs(10)), None)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.error.is_none());
        assert!(outcome.output.contains("working"));
        assert!(docker.removed("c0ffee1234"));
        assert_eq!(backend.live_containers(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_container_is_removed() {
        let docker = FakeDocker::new("echo c0ffee1234", "sleep 30", false);
        let workspace = TempDir::new().unwrap();
        let backend = docker.backend();

        let outcome = backend
            .launch(&fake_params(&workspace, Duration::from_secs(1)), None)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
        assert_eq!(outcome.error.as_deref(), Some("timed out after 1s"));
        assert!(docker.removed("c0ffee1234"));
        assert_eq!(backend.live_containers(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oom_kill_is_its_own_termination() {
        let docker = FakeDocker::new("echo c0ffee1234", "echo 137", true);
        let workspace = TempDir::new().unwrap();
        let backend = docker.backend();

        let outcome = backend
            .launch(&fake_params(&workspace, Duration::from_secs(10)), None)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::OutOfMemory);
        assert_eq!(outcome.exit_code, 137);
        assert!(outcome.error.unwrap().contains("memory limit (4g)"));
        assert!(docker.removed("c0ffee1234"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_wait_is_a_crash() {
        let docker = FakeDocker::new(
            "echo c0ffee1234",
            "echo 'no such container' >&2; exit 1",
            false,
        );
        let workspace = TempDir::new().unwrap();
        let backend = docker.backend();

        let outcome = backend
            .launch(&fake_params(&workspace, Duration::from_secs(10)), None)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Crashed);
        assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
        assert!(outcome.error.unwrap().contains("no such container"));
        assert!(docker.removed("c0ffee1234"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_run_is_a_launch_failure() {
        let docker = FakeDocker::new("echo 'no space left' >&2; exit 125", "echo 0", false);
        let workspace = TempDir::new().unwrap();
        let backend = docker.backend();

        let outcome = backend
            .launch(&fake_params(&workspace, Duration::from_secs(10)), None)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::LaunchFailed);
        assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
        assert_eq!(outcome.output, "no space left");
        assert!(!docker.calls().iter().any(|c| c.starts_with("wait")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_during_start_still_removes_container() {
        let docker = FakeDocker::new("sleep 1; echo c0ffee1234", "sleep 30", false);
        let workspace = TempDir::new().unwrap();
        let backend = Arc::new(docker.backend());

        let launching = {
            let backend = Arc::clone(&backend);
            let params = fake_params(&workspace, Duration::from_secs(60));
            tokio::spawn(async move { backend.launch(&params, None).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        launching.abort();
        assert!(launching.await.unwrap_err().is_cancelled());

        backend.cleanup().await;

        assert!(docker.removed("c0ffee1234"));
        assert!(!docker.calls().iter().any(|c| c.starts_with("wait")));
        assert_eq!(backend.live_containers(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_while_waiting_removes_on_cleanup() {
        let docker = FakeDocker::new("echo c0ffee1234", "sleep 30", false);
        let workspace = TempDir::new().unwrap();
        let backend = Arc::new(docker.backend());

        let launching = {
            let backend = Arc::clone(&backend);
            let params = fake_params(&workspace, Duration::from_secs(60));
            tokio::spawn(async move { backend.launch(&params, None).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(backend.live_containers(), 1);
        launching.abort();
        let _ = launching.await;

        backend.cleanup().await;

        assert!(docker.removed("c0ffee1234"));
        assert_eq!(backend.live_containers(), 0);
    }
}

//! Experiment configuration.
//!
//! Experiments are described in YAML:
//!
//! ```yaml
//! experiment:
//!   name: planning-shootout
//! target:
//!   repo: https://github.com/example/project
//!   commit: 4f2c1e9
//! prompt:
//!   file: prompts/plan.md
//! settings:
//!   runs_per_agent: 3
//!   parallel: true
//!   timeout_minutes: 20
//! agents:
//!   - id: sonnet
//!     model: anthropic/claude-sonnet-4-5
//!   - id: gpt
//!     model: openai/gpt-5
//!     extra_args: ["--agent", "plan"]
//! analysis:
//!   prompt: Compare the generated plans for completeness.
//! ```
//!
//! Validation happens once, before any run is scheduled. A config that fails
//! validation never reaches the orchestrator.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default model for the post-hoc analysis execution
pub const DEFAULT_ANALYSIS_MODEL: &str = "anthropic/claude-opus-4-5";

/// Configuration errors. These fail fast, before any execution starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Agent IDs must be unique (duplicate: '{0}')")]
    DuplicateAgent(String),
}

/// Complete benchmark configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub experiment: ExperimentInfo,
    pub target: TargetConfig,
    pub prompt: PromptConfig,
    #[serde(default)]
    pub settings: Settings,
    pub agents: Vec<AgentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Repository every run clones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Prompt given to every agent: a file path inside the repository, or inline text
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Runs per agent (1..=10)
    #[serde(default = "default_runs_per_agent")]
    pub runs_per_agent: u32,

    /// Run through the worker pool; false forces one run at a time
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Wall-clock limit per run in minutes (1..=180)
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Worker pool ceiling for parallel mode (1..=16)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Memory ceiling handed to the execution backend
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// How a run that hit its timeout is reported
    #[serde(default)]
    pub timeout_status: TimeoutStatus,
}

fn default_runs_per_agent() -> u32 {
    3
}
fn default_parallel() -> bool {
    true
}
fn default_timeout_minutes() -> u64 {
    10
}
fn default_max_parallel() -> usize {
    4
}
fn default_memory_limit() -> String {
    "4g".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runs_per_agent: default_runs_per_agent(),
            parallel: default_parallel(),
            timeout_minutes: default_timeout_minutes(),
            max_parallel: default_max_parallel(),
            memory_limit: default_memory_limit(),
            timeout_status: TimeoutStatus::default(),
        }
    }
}

impl Settings {
    /// Per-run wall-clock timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    /// Number of workers for `total_runs` runs. Sequential mode is a pool of one.
    pub fn worker_count(&self, total_runs: usize) -> usize {
        if self.parallel {
            total_runs.min(self.max_parallel).max(1)
        } else {
            1
        }
    }
}

/// Reporting policy for timed-out runs. A timed-out run always carries a
/// failure exit code; this only decides the reported status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStatus {
    /// Report as an ordinary failure
    #[default]
    Failed,
    /// Report with a dedicated timeout status
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Post-hoc reviewer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_model")]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
}

fn default_analysis_model() -> String {
    DEFAULT_ANALYSIS_MODEL.to_string()
}

impl BenchmarkConfig {
    /// Load and validate a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to YAML (used for the copy stored with the results)
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check every constraint the orchestrator relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment.name.trim().is_empty() {
            return Err(ConfigError::Invalid("experiment.name cannot be empty".into()));
        }

        if self.target.repo.trim().is_empty() {
            return Err(ConfigError::Invalid("target.repo cannot be empty".into()));
        }

        match (&self.prompt.file, &self.prompt.text) {
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "Either 'prompt.file' or 'prompt.text' must be provided".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "Only one of 'prompt.file' or 'prompt.text' should be provided".into(),
                ))
            }
            _ => {}
        }

        let settings = &self.settings;
        if !(1..=10).contains(&settings.runs_per_agent) {
            return Err(ConfigError::Invalid(format!(
                "settings.runs_per_agent must be between 1 and 10 (got {})",
                settings.runs_per_agent
            )));
        }
        if !(1..=180).contains(&settings.timeout_minutes) {
            return Err(ConfigError::Invalid(format!(
                "settings.timeout_minutes must be between 1 and 180 (got {})",
                settings.timeout_minutes
            )));
        }
        if !(1..=16).contains(&settings.max_parallel) {
            return Err(ConfigError::Invalid(format!(
                "settings.max_parallel must be between 1 and 16 (got {})",
                settings.max_parallel
            )));
        }

        if self.agents.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one agent must be configured".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(ConfigError::Invalid("Agent IDs cannot be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.id.clone()));
            }
        }

        Ok(())
    }

    /// Total number of runs this config expands to
    pub fn total_runs(&self) -> usize {
        self.agents.len() * self.settings.runs_per_agent as usize
    }

    /// Analysis block, if it carries a prompt
    pub fn analysis_with_prompt(&self) -> Option<&AnalysisConfig> {
        self.analysis
            .as_ref()
            .filter(|analysis| !analysis.prompt.trim().is_empty())
    }
}

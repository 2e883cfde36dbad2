use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::capabilities::Capability;
use crate::output::OutputPolicy;
use crate::sandbox::Isolation;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
    #[serde(default)]
    pub operators: OperatorsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Hard wall-clock budget per evaluation
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum number of evaluations running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Snippets above this size are rejected before parsing
    #[serde(default = "default_max_code_size")]
    pub max_code_size: usize,
    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
    /// Where evaluations run: a killable child process or a host thread
    #[serde(default)]
    pub isolation: Isolation,
    /// Executable started with `--worker` in process isolation
    /// (default: the current executable)
    #[serde(default)]
    pub worker_path: Option<PathBuf>,
    /// Timed-out worker threads allowed to keep running before new
    /// thread-isolated evaluations are refused
    #[serde(default = "default_max_runaway_workers")]
    pub max_runaway_workers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Inline output limit, in characters
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default)]
    pub policy: OutputPolicy,
    /// Where spilled output is written before handoff
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Filename suggested to the delivery collaborator
    #[serde(default = "default_artifact_filename")]
    pub artifact_filename: String,
    /// Characters of preview sent along with a spilled artifact (0 = none)
    #[serde(default)]
    pub preview_chars: usize,
    /// Print captured console lines above the result
    #[serde(default = "default_true")]
    pub show_console: bool,
    /// Append the evaluation time below the result
    #[serde(default)]
    pub show_elapsed: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CapabilitiesConfig {
    #[serde(default = "default_enabled_capabilities")]
    pub enabled: Vec<Capability>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_fetch_connect_timeout_secs")]
    pub fetch_connect_timeout_secs: u64,
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OperatorsConfig {
    /// Caller ids allowed to evaluate code
    #[serde(default)]
    pub allowed: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_code_size() -> usize {
    64 * 1024
}

fn default_loop_iteration_limit() -> u64 {
    10_000_000
}

fn default_recursion_limit() -> usize {
    512
}

fn default_max_runaway_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> usize {
    1000
}

fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("snippet-eval")
}

fn default_artifact_filename() -> String {
    "output.txt".to_string()
}

fn default_enabled_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_fetch_connect_timeout_secs() -> u64 {
    10
}

fn default_max_response_size() -> usize {
    5 * 1024 * 1024
}

fn default_user_agent() -> String {
    format!("snippet-eval/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            max_code_size: default_max_code_size(),
            loop_iteration_limit: default_loop_iteration_limit(),
            recursion_limit: default_recursion_limit(),
            isolation: Isolation::default(),
            worker_path: None,
            max_runaway_workers: default_max_runaway_workers(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            policy: OutputPolicy::default(),
            artifact_dir: default_artifact_dir(),
            artifact_filename: default_artifact_filename(),
            preview_chars: 0,
            show_console: true,
            show_elapsed: false,
        }
    }
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_capabilities(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            fetch_connect_timeout_secs: default_fetch_connect_timeout_secs(),
            max_response_size: default_max_response_size(),
            user_agent: default_user_agent(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

impl OutputConfig {
    /// Human-readable description of the output policy
    pub fn policy_description(&self) -> String {
        match self.policy {
            OutputPolicy::Truncate => format!("truncate at {} chars", self.threshold),
            OutputPolicy::Spill => format!(
                "spill above {} chars to {}",
                self.threshold,
                self.artifact_dir.display()
            ),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SNIPPET_EVAL_ARTIFACTS}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Checks if a caller is allowed to evaluate code
    pub fn is_allowed(&self, caller_id: &str) -> bool {
        self.operators
            .allowed
            .iter()
            .any(|allowed| allowed == caller_id || allowed == "*")
    }
}

//! Layered executor configuration: defaults -> TOML file -> environment
//! variables (env wins). `.beads` project discovery is resolved the same
//! way: an override env var first, else `.beads/*.db` in the current
//! directory only.

use std::path::{Path, PathBuf};

use coordination::watchdog::{ConfigError, WatchdogConfig};
use coordination::verifier::VerifierConfig;
use serde::Deserialize;

/// Endpoint the AI client (anomaly analysis, gate-recovery strategist) talks to.
#[derive(Debug, Clone, Deserialize)]
pub struct AiEndpointConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl Default for AiEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8317/v1".into(),
            api_key: "not-needed".into(),
            model: "claude-sonnet-4-5".into(),
        }
    }
}

/// Top-level configuration for the executor binary.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identity this process registers under in the worker registry.
    pub worker_id: String,
    pub watchdog: WatchdogConfig,
    pub verifier: VerifierConfig,
    /// Base directory for per-issue worktrees (`None` = auto-detect).
    pub sandbox_base_dir: Option<PathBuf>,
    /// Branch the approval gate diffs against and merges into.
    pub merge_base_branch: String,
    /// Env var that bypasses the interactive approval prompt when set non-empty.
    pub approval_auto_approve_env_var: String,
    pub ai: AiEndpointConfig,
    /// argv for the external coding-agent subprocess, e.g. `["claude", "-p"]`.
    pub agent_command: Vec<String>,
    /// Resolved beads database path, if discovered.
    pub beads_db: Option<PathBuf>,
    /// How often the executor loop polls for ready work when idle.
    pub idle_poll_interval_secs: u64,
    /// How often this process refreshes its worker-registry heartbeat.
    pub worker_heartbeat_interval_secs: u64,
    /// A worker instance with no heartbeat for longer than this is reaped.
    pub worker_stale_threshold_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".into(),
            watchdog: WatchdogConfig::default(),
            verifier: VerifierConfig::default(),
            sandbox_base_dir: None,
            merge_base_branch: "main".into(),
            approval_auto_approve_env_var: "VC_APPROVAL_AUTO_APPROVE".into(),
            ai: AiEndpointConfig::default(),
            agent_command: vec!["claude".into(), "-p".into()],
            beads_db: None,
            idle_poll_interval_secs: 10,
            worker_heartbeat_interval_secs: 15,
            worker_stale_threshold_secs: 120,
        }
    }
}

/// Mirrors [`ExecutorConfig`] with every field optional, for deserializing a
/// partial TOML file that only overrides what it needs to.
#[derive(Debug, Default, Deserialize)]
struct ExecutorConfigFile {
    worker_id: Option<String>,
    merge_base_branch: Option<String>,
    approval_auto_approve_env_var: Option<String>,
    sandbox_base_dir: Option<PathBuf>,
    agent_command: Option<String>,
    idle_poll_interval_secs: Option<u64>,
    worker_heartbeat_interval_secs: Option<u64>,
    worker_stale_threshold_secs: Option<u64>,
    ai: Option<AiEndpointConfigFile>,
    verifier: Option<VerifierConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct AiEndpointConfigFile {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl ExecutorConfig {
    /// Load defaults, overlay an optional TOML file, then overlay env vars.
    pub fn load(file_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = file_path {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                ConfigError {
                    message: format!("failed to read config file {}: {e}", path.display()),
                    hint: "check the path passed to --config".into(),
                }
            })?;
            let file: ExecutorConfigFile = toml::from_str(&contents).map_err(|e| ConfigError {
                message: format!("failed to parse config file {}: {e}", path.display()),
                hint: "config file must be valid TOML matching ExecutorConfig's shape".into(),
            })?;
            config.apply_file(file);
        }

        config.apply_env_overrides()?;
        config.beads_db = discover_beads_db();
        config.watchdog.validate()?;
        if config.agent_command.is_empty() {
            return Err(ConfigError {
                message: "agent_command must not be empty".into(),
                hint: "set agent_command in the config file or VC_EXECUTOR_AGENT_COMMAND".into(),
            });
        }
        Ok(config)
    }

    fn apply_file(&mut self, file: ExecutorConfigFile) {
        if let Some(v) = file.worker_id {
            self.worker_id = v;
        }
        if let Some(v) = file.merge_base_branch {
            self.merge_base_branch = v;
        }
        if let Some(v) = file.approval_auto_approve_env_var {
            self.approval_auto_approve_env_var = v;
        }
        if let Some(v) = file.sandbox_base_dir {
            self.sandbox_base_dir = Some(v);
        }
        if let Some(v) = file.agent_command {
            if let Some(parts) = shlex::split(&v) {
                self.agent_command = parts;
            }
        }
        if let Some(v) = file.idle_poll_interval_secs {
            self.idle_poll_interval_secs = v;
        }
        if let Some(v) = file.worker_heartbeat_interval_secs {
            self.worker_heartbeat_interval_secs = v;
        }
        if let Some(v) = file.worker_stale_threshold_secs {
            self.worker_stale_threshold_secs = v;
        }
        if let Some(ai) = file.ai {
            if let Some(v) = ai.base_url {
                self.ai.base_url = v;
            }
            if let Some(v) = ai.api_key {
                self.ai.api_key = v;
            }
            if let Some(v) = ai.model {
                self.ai.model = v;
            }
        }
        if let Some(v) = file.verifier {
            self.verifier = v;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_var("VC_EXECUTOR_WORKER_ID") {
            self.worker_id = v;
        }
        if let Some(v) = env_var("VC_EXECUTOR_MERGE_BASE_BRANCH") {
            self.merge_base_branch = v;
        }
        if let Some(v) = env_var("VC_APPROVAL_AUTO_APPROVE_ENV_VAR") {
            self.approval_auto_approve_env_var = v;
        }
        if let Some(v) = env_var("VC_EXECUTOR_SANDBOX_BASE_DIR") {
            self.sandbox_base_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("VC_EXECUTOR_AGENT_COMMAND") {
            self.agent_command = shlex::split(&v).ok_or_else(|| ConfigError {
                message: format!("invalid VC_EXECUTOR_AGENT_COMMAND `{v}`"),
                hint: "use shell-quoted argv, e.g. `claude -p`".into(),
            })?;
        }
        if let Some(v) = env_var("VC_EXECUTOR_IDLE_POLL_INTERVAL_SECS") {
            self.idle_poll_interval_secs = v.parse().map_err(|_| ConfigError {
                message: format!("invalid VC_EXECUTOR_IDLE_POLL_INTERVAL_SECS `{v}`"),
                hint: "use an integer number of seconds".into(),
            })?;
        }
        if let Some(v) = env_var("VC_EXECUTOR_WORKER_HEARTBEAT_INTERVAL_SECS") {
            self.worker_heartbeat_interval_secs = v.parse().map_err(|_| ConfigError {
                message: format!("invalid VC_EXECUTOR_WORKER_HEARTBEAT_INTERVAL_SECS `{v}`"),
                hint: "use an integer number of seconds".into(),
            })?;
        }
        if let Some(v) = env_var("VC_EXECUTOR_WORKER_STALE_THRESHOLD_SECS") {
            self.worker_stale_threshold_secs = v.parse().map_err(|_| ConfigError {
                message: format!("invalid VC_EXECUTOR_WORKER_STALE_THRESHOLD_SECS `{v}`"),
                hint: "use an integer number of seconds".into(),
            })?;
        }
        if let Some(v) = env_var("VC_AI_BASE_URL") {
            self.ai.base_url = v;
        }
        if let Some(v) = env_var("VC_AI_API_KEY") {
            self.ai.api_key = v;
        }
        if let Some(v) = env_var("VC_AI_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) = env_var("VC_VERIFIER_PACKAGES") {
            self.verifier.packages = v.split(',').map(|p| p.trim().to_string()).collect();
        }
        if let Some(v) = env_var("VC_VERIFIER_GATE_TIMEOUT_SECS") {
            self.verifier.gate_timeout_secs = v.parse().map_err(|_| ConfigError {
                message: format!("invalid VC_VERIFIER_GATE_TIMEOUT_SECS `{v}`"),
                hint: "use an integer number of seconds".into(),
            })?;
        }

        self.watchdog.apply_env_overrides()
    }
}

/// Resolve the beads database path per the documented discovery order:
/// `VC_BEADS_DB` override, else a single `.beads/*.db` in the current
/// directory. Returns `None` if neither is found (callers fall back to the
/// in-memory store or let `bd` use its own default).
pub fn discover_beads_db() -> Option<PathBuf> {
    if let Some(v) = env_var("VC_BEADS_DB") {
        return Some(PathBuf::from(v));
    }

    let beads_dir = PathBuf::from(".beads");
    let entries = std::fs::read_dir(&beads_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "db"))
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

/// Top-level Ensemble configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to steps that set none (0 = no timeout).
    #[serde(default)]
    pub default_step_timeout_secs: u64,
    /// Timeout for each team member invocation (0 = no timeout).
    #[serde(default)]
    pub member_timeout_secs: u64,
    /// Inference round-trips an agent step may take.
    #[serde(default = "default_max_agent_turns")]
    pub max_agent_turns: usize,
    /// Broadcast channel capacity for run events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 0,
            member_timeout_secs: 0,
            max_agent_turns: default_max_agent_turns(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_agent_turns() -> usize { 10 }
fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.ensemble/ensemble.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// A lease older than this is considered abandoned.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Identity written to `locked_by`. Default: hostname-pid-random.
    #[serde(default)]
    pub poller_id: Option<String>,
    /// Base URL HTTP triggers post to.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer token for HTTP triggers.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            poller_id: None,
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            api_key: None,
        }
    }
}

fn default_scheduler_enabled() -> bool { true }
fn default_poll_interval_secs() -> u64 { 15 }
fn default_lease_ttl_secs() -> u64 { 300 }
fn default_base_url() -> String { "http://127.0.0.1:7777".to_string() }
fn default_request_timeout_secs() -> u64 { 30 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.ensemble/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle, 2 = + steps and requirements, 3 = + members, loops, schedules.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EnsembleError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| EnsembleError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the JSONL log directory, if runtime logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.ensemble/logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

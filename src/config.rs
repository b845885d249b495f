//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Which container runtime to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Local Docker daemon via the `docker` CLI
    #[default]
    Docker,
    /// In-process runtime, nothing is actually started
    Memory,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Path or name of the docker binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Platform passed to `docker create`, e.g. `linux/amd64`
    #[serde(default)]
    pub platform: Option<String>,

    /// Upper bound on any single runtime command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Delay before re-subscribing to runtime events after the stream ends
    #[serde(default = "default_resubscribe")]
    pub events_resubscribe_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            docker_bin: default_docker_bin(),
            platform: None,
            command_timeout_secs: default_command_timeout(),
            events_resubscribe_secs: default_resubscribe(),
        }
    }
}

/// Reconcile loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Label that marks a container as ours; its value is the deployment ID
    #[serde(default = "default_owner_label")]
    pub owner_label: String,

    /// Periodic resync in seconds (0 = only reconcile on events)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Run one cycle at startup to collect leftovers from a previous run
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            owner_label: default_owner_label(),
            resync_interval_secs: default_resync_interval(),
            reconcile_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

// Defaults
fn default_docker_bin() -> String { "docker".to_string() }
fn default_command_timeout() -> u64 { 30 }
fn default_resubscribe() -> u64 { 5 }
fn default_owner_label() -> String { "owner".to_string() }
fn default_resync_interval() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_http_port() -> u16 { 8080 }

/// Config loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from a TOML file, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile.owner_label.trim().is_empty() {
            return Err(ConfigError::Invalid("reconcile.owner_label must not be empty".to_string()));
        }
        if self.runtime.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid("runtime.command_timeout_secs must be positive".to_string()));
        }
        if self.runtime.events_resubscribe_secs == 0 {
            return Err(ConfigError::Invalid("runtime.events_resubscribe_secs must be positive".to_string()));
        }
        Ok(())
    }
}

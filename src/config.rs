//! Configuration for llamactl

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the main server to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the main server (inference + management API)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Instance management settings
    #[serde(default)]
    pub instances: InstancesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_port: default_metrics_port(),
            instances: InstancesConfig::default(),
        }
    }
}

/// Settings shared by the registry and every instance supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    /// Directory for persisted instance snapshots
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory for per-instance log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Global cap on concurrently running instances
    #[serde(default = "default_max_running")]
    pub max_running_instances: usize,

    /// Evict the least recently used running instance when the cap is reached.
    /// When false, starts beyond the cap fail instead.
    #[serde(default = "default_true")]
    pub enable_lru_eviction: bool,

    /// Allow the router to start stopped instances on demand
    #[serde(default = "default_true")]
    pub on_demand_start: bool,

    /// Restart instances that were running when the process last persisted state
    #[serde(default)]
    pub restore_last_state: bool,

    /// Default idle timeout applied to new instances (minutes, 0 disables)
    #[serde(default)]
    pub idle_timeout_minutes: u64,

    /// How often the idle sweeper runs (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Readiness endpoint polled on the child after an on-demand start
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    /// Deadline for a started child to become ready (seconds)
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,

    /// Restart-policy defaults applied when an instance omits them
    #[serde(default = "default_true")]
    pub default_auto_restart: bool,

    #[serde(default = "default_max_restarts")]
    pub default_max_restarts: u32,

    #[serde(default = "default_restart_delay")]
    pub default_restart_delay_seconds: u64,

    /// Executable for llama.cpp instances.
    /// Can be overridden for testing with mock-server.
    #[serde(default = "default_llama_executable")]
    pub llama_executable: String,

    /// Executable for MLX instances
    #[serde(default = "default_mlx_executable")]
    pub mlx_executable: String,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            max_running_instances: default_max_running(),
            enable_lru_eviction: true,
            on_demand_start: true,
            restore_last_state: false,
            idle_timeout_minutes: 0,
            sweep_interval_seconds: default_sweep_interval(),
            health_check_path: default_health_check_path(),
            start_timeout_seconds: default_start_timeout(),
            default_auto_restart: true,
            default_max_restarts: default_max_restarts(),
            default_restart_delay_seconds: default_restart_delay(),
            llama_executable: default_llama_executable(),
            mlx_executable: default_mlx_executable(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llamactl")
}

fn default_state_dir() -> PathBuf {
    base_dir().join("state")
}

fn default_log_dir() -> PathBuf {
    base_dir().join("logs")
}

fn default_max_running() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_start_timeout() -> u64 {
    120
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay() -> u64 {
    5
}

fn default_llama_executable() -> String {
    "llama-server".to_string()
}

fn default_mlx_executable() -> String {
    "mlx_lm.server".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate configuration, warning about and repairing nonsensical values.
    pub fn validate(&mut self) {
        use tracing::warn;

        if self.instances.max_running_instances == 0 {
            warn!("max_running_instances must be at least 1, using 1");
            self.instances.max_running_instances = 1;
        }

        if self.instances.sweep_interval_seconds == 0 {
            warn!("sweep_interval_seconds must be at least 1, using 60");
            self.instances.sweep_interval_seconds = 60;
        }

        if self.instances.start_timeout_seconds == 0 {
            warn!("start_timeout_seconds must be at least 1, using 120");
            self.instances.start_timeout_seconds = 120;
        }

        if !self.instances.health_check_path.starts_with('/') {
            warn!(
                path = %self.instances.health_check_path,
                "health_check_path should start with '/', prefixing it"
            );
            self.instances.health_check_path = format!("/{}", self.instances.health_check_path);
        }
    }
}

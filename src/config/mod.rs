//! Configuration for the wincage runtime
//!
//! Supports configuration via:
//! - config files (`config/wincage.*`, `C:\ProgramData\wincage\config.*`)
//! - Environment variables named `WINCAGE__<FIELD>`, `__` also between
//!   sections (e.g. `WINCAGE__LOG_LEVEL`, `WINCAGE__HOST__PIPE_PREFIX`)
//! - a `.env` file in the working directory

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::job::{LimitConfiguration, MAX_CPU_WEIGHT, MIN_CPU_WEIGHT};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory receiving the JSON log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Parent directory of every container directory
    #[serde(default = "default_container_root")]
    pub container_root: PathBuf,

    /// Limits applied to newly created containers
    #[serde(default)]
    pub limits: LimitConfiguration,

    /// Disk quota for the container user, 0 for none
    #[serde(default)]
    pub disk_quota_bytes: u64,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Bound on waiting for processes during teardown, 0 waits forever
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_ms: u64,
}

/// How containers reach their privileged host process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Path of the `wincage-host` executable
    #[serde(default = "default_host_executable")]
    pub executable: PathBuf,

    /// Pipe names are `\\.\pipe\{prefix}-{container handle}`
    #[serde(default = "default_pipe_prefix")]
    pub pipe_prefix: String,

    /// How long to keep retrying the pipe while the host starts
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Resource group notification monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Events buffered per subscriber before the oldest are dropped
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\wincage\logs")
}

fn default_container_root() -> PathBuf {
    PathBuf::from(r"C:\containerizer")
}

fn default_terminate_timeout() -> u64 {
    10_000
}

fn default_host_executable() -> PathBuf {
    PathBuf::from("wincage-host.exe")
}

fn default_pipe_prefix() -> String {
    "wincage".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    256
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            executable: default_host_executable(),
            pipe_prefix: default_pipe_prefix(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl HostConfig {
    pub fn pipe_name(&self, container_handle: &str) -> String {
        format!(r"\\.\pipe\{}-{}", self.pipe_prefix, container_handle)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            container_root: default_container_root(),
            limits: LimitConfiguration::default(),
            disk_quota_bytes: 0,
            host: HostConfig::default(),
            monitor: MonitorConfig::default(),
            terminate_timeout_ms: default_terminate_timeout(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        Self::load_from(
            config::Environment::with_prefix("WINCAGE")
                .separator("__")
                .try_parsing(true),
        )
    }

    /// Layer defaults, config files and `environment`, then validate
    fn load_from(environment: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/wincage").required(false))
            .add_source(
                config::File::with_name(r"C:\ProgramData\wincage\config").required(false),
            )
            .add_source(environment)
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if let Some(weight) = self.limits.cpu_weight {
            if !(MIN_CPU_WEIGHT..=MAX_CPU_WEIGHT).contains(&weight) {
                anyhow::bail!(
                    "CPU weight must be between {} and {}, got {}",
                    MIN_CPU_WEIGHT,
                    MAX_CPU_WEIGHT,
                    weight
                );
            }
        }

        if self.monitor.poll_interval_ms == 0 {
            anyhow::bail!("Notification poll interval cannot be 0");
        }

        if self.monitor.event_buffer == 0 {
            anyhow::bail!("Notification event buffer cannot be 0");
        }

        if self.host.pipe_prefix.trim().is_empty() {
            anyhow::bail!("Host pipe prefix cannot be empty");
        }

        Ok(())
    }

    pub fn terminate_timeout(&self) -> Option<Duration> {
        match self.terminate_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

//! Service configuration loaded from YAML.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use instruct_engine::{BackendKind, SamplingDefaults};
use instruct_runtime::MockConfig;
use instruct_scheduler::DEFAULT_POLL_INTERVAL;
use serde::{Deserialize, Serialize};

/// Longest accepted admission re-check interval.
pub const MAX_POLL_INTERVAL_MS: u64 = 200;

// -----------------------------------------------------------------------------
// Config (root)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_engine")]
    pub engine: BackendKind,
    #[serde(default = "default_model_name")]
    pub hf_model_name: String,
    #[serde(default)]
    pub tokenizer_name: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sampling: SamplingDefaults,
    #[serde(default)]
    pub mock: MockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            hf_model_name: default_model_name(),
            tokenizer_name: None,
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            sampling: SamplingDefaults::default(),
            mock: MockConfig::default(),
        }
    }
}

impl Config {
    /// Read `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_saphyr::from_str(contents).map_err(ConfigError::Yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "scheduler.poll_interval_ms = {} exceeds {MAX_POLL_INTERVAL_MS}",
                self.scheduler.poll_interval_ms
            )));
        }
        self.sampling
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("sampling: {e}")))
    }
}

fn default_engine() -> BackendKind {
    BackendKind::Mock
}

fn default_model_name() -> String {
    "mock/instruct".to_string()
}

// -----------------------------------------------------------------------------
// ServerConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

// -----------------------------------------------------------------------------
// SchedulerConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

// -----------------------------------------------------------------------------
// ConfigError
// -----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[source] serde_saphyr::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

//! Configuration for pipeline runs and the server process.
//!
//! `RunConfig` is the per-run configuration submitted with a start
//! request. `ServerConfig` is process-level configuration resolved from
//! environment variables with validated defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stage::Stage;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-run configuration submitted with `POST /pipeline/start`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Declared subset of downstream stages to execute. When supplied,
    /// the executor still walks the canonical order but only executes
    /// stages present here.
    #[serde(default)]
    pub target_stages: Option<Vec<Stage>>,
    /// Provider models the scoring collaborator may use.
    #[serde(default)]
    pub ai_models: Vec<String>,
    /// Enhancement methods requested for the substitution stage.
    #[serde(default)]
    pub enhancement_methods: Vec<String>,
    /// Skip a stage whose structured-data contribution already exists.
    #[serde(default)]
    pub skip_if_exists: bool,
    /// Allow per-question work inside a stage to run concurrently.
    #[serde(default)]
    pub parallel_processing: bool,
}

impl RunConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target-stage hint.
    pub fn with_target_stages(mut self, stages: Vec<Stage>) -> Self {
        self.target_stages = Some(stages);
        self
    }
}

/// Process-level configuration for the gradeprobe server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Directory holding the run registry file.
    pub data_path: PathBuf,
    /// Base directory for per-run artifact roots.
    pub artifact_path: PathBuf,
    /// Steady-state polling interval for status observers.
    pub poll_interval: Duration,
    /// Post-write NotFound retries for the status client.
    pub refresh_retries: u32,
    /// Base delay of the linear retry backoff.
    pub refresh_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            data_path: PathBuf::from("./data"),
            artifact_path: PathBuf::from("./artifacts"),
            poll_interval: Duration::from_secs(3),
            refresh_retries: 4,
            refresh_retry_delay: Duration::from_millis(250),
        }
    }
}

impl ServerConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GRADEPROBE_BIND_ADDR`: HTTP bind address (default: 127.0.0.1:8080)
    /// - `GRADEPROBE_DATA_PATH`: registry directory (default: ./data)
    /// - `GRADEPROBE_ARTIFACT_PATH`: artifact base directory (default: ./artifacts)
    /// - `GRADEPROBE_POLL_INTERVAL_SECS`: polling interval (default: 3)
    /// - `GRADEPROBE_REFRESH_RETRIES`: NotFound retry count (default: 4)
    /// - `GRADEPROBE_REFRESH_RETRY_DELAY_MS`: linear backoff base (default: 250)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or
    /// validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("GRADEPROBE_BIND_ADDR") {
            config.bind_addr = val;
        }

        if let Ok(val) = std::env::var("GRADEPROBE_DATA_PATH") {
            config.data_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("GRADEPROBE_ARTIFACT_PATH") {
            config.artifact_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("GRADEPROBE_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "GRADEPROBE_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("GRADEPROBE_REFRESH_RETRIES") {
            config.refresh_retries = parse_env_value(&val, "GRADEPROBE_REFRESH_RETRIES")?;
        }

        if let Ok(val) = std::env::var("GRADEPROBE_REFRESH_RETRY_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "GRADEPROBE_REFRESH_RETRY_DELAY_MS")?;
            config.refresh_retry_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "bind_addr cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.as_millis() == 0 {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.refresh_retry_delay.as_millis() == 0 {
            return Err(ConfigError::ValidationFailed(
                "refresh_retry_delay must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

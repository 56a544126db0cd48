//! Relay Configuration
//!
//! TOML-based configuration with environment variable overrides. Every
//! section has defaults, so an empty file (or no file) is a valid start.

use relay_common::{BackoffPolicy, JobOptions, Retention};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub gateway: GatewayConfig,
}

/// Job queue storage and per-job defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Logical queue name; several queues can share one database
    pub name: String,
    pub database_url: String,
    /// An active job whose lease is older than this is handed out again
    pub lease_timeout_secs: u64,
    pub job: JobDefaults,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "message-dispatch-queue".to_string(),
            database_url: "sqlite://relay.db?mode=rwc".to_string(),
            lease_timeout_secs: 300,
            job: JobDefaults::default(),
        }
    }
}

impl QueueConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

impl BackoffKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "exponential" => Some(BackoffKind::Exponential),
            "fixed" => Some(BackoffKind::Fixed),
            _ => None,
        }
    }
}

/// Options applied to every enqueued job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub attempts: u32,
    pub backoff_type: BackoffKind,
    pub backoff_delay_ms: u64,
    pub remove_on_complete: bool,
    /// Exhausted jobs to keep; unset keeps all of them
    pub keep_failed: Option<usize>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_type: BackoffKind::Exponential,
            backoff_delay_ms: 5000,
            remove_on_complete: false,
            keep_failed: Some(1000),
        }
    }
}

impl JobDefaults {
    pub fn job_options(&self) -> JobOptions {
        let backoff = match self.backoff_type {
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                delay_ms: self.backoff_delay_ms,
            },
            BackoffKind::Fixed => BackoffPolicy::Fixed {
                delay_ms: self.backoff_delay_ms,
            },
        };

        JobOptions {
            max_attempts: self.attempts,
            backoff,
            retention: Retention {
                remove_on_complete: self.remove_on_complete,
                keep_failed: self.keep_failed,
            },
        }
    }
}

/// Worker pool and dispatch pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of jobs processed at once
    pub concurrency: usize,
    /// Fixed pause before every single-mode gateway call
    pub api_call_delay_ms: u64,
    /// Idle wait when the queue has nothing to lease
    pub poll_interval_ms: u64,
    /// Random extra wait added to each idle poll
    pub poll_jitter_ms: u64,
    pub shutdown_grace_secs: u64,
    /// Shared cap on gateway calls across all workers
    pub rate_limit_per_minute: Option<u32>,
    /// Treat a bulk/multi-block job with zero successful units as a retryable failure
    pub fail_when_all_units_fail: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            api_call_delay_ms: 1000,
            poll_interval_ms: 1000,
            poll_jitter_ms: 250,
            shutdown_grace_secs: 30,
            rate_limit_per_minute: None,
            fail_when_all_units_fail: false,
        }
    }
}

/// Messaging gateway connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_ms: 30000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check the settings a worker cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.url is required (RELAY_GATEWAY_URL)".to_string(),
            ));
        }
        if self.gateway.api_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.api_key is required (RELAY_GATEWAY_API_KEY)".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.queue.job.attempts == 0 {
            return Err(ConfigError::ValidationError(
                "queue.job.attempts must be at least 1".to_string(),
            ));
        }
        if self.worker.rate_limit_per_minute == Some(0) {
            return Err(ConfigError::ValidationError(
                "worker.rate_limit_per_minute must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Relay Configuration
# Environment variables (RELAY_*) override these settings

[queue]
name = "message-dispatch-queue"
database_url = "sqlite://relay.db?mode=rwc"
lease_timeout_secs = 300

[queue.job]
attempts = 3
backoff_type = "exponential"  # exponential or fixed
backoff_delay_ms = 5000
remove_on_complete = false
keep_failed = 1000

[worker]
concurrency = 5
api_call_delay_ms = 1000
poll_interval_ms = 1000
poll_jitter_ms = 250
shutdown_grace_secs = 30
# rate_limit_per_minute = 60
fail_when_all_units_fail = false

[gateway]
url = "http://localhost:8080"
api_key = ""
timeout_ms = 30000
"#
        .to_string()
    }
}

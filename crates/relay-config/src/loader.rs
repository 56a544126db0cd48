//! Configuration loader with file and environment variable support

use crate::{AppConfig, BackoffKind, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "config.toml",
    "./config/relay.toml",
    "/etc/relay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching defaults");
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `RELAY_*` overrides read through `lookup`. Unparseable values are ignored.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Queue
    if let Some(val) = lookup("RELAY_QUEUE_NAME") {
        config.queue.name = val;
    }
    if let Some(val) = lookup("RELAY_DATABASE_URL") {
        config.queue.database_url = val;
    }
    if let Some(val) = lookup("RELAY_LEASE_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse() {
            config.queue.lease_timeout_secs = secs;
        }
    }

    // Job defaults
    if let Some(val) = lookup("RELAY_JOB_ATTEMPTS") {
        if let Ok(attempts) = val.parse() {
            config.queue.job.attempts = attempts;
        }
    }
    if let Some(val) = lookup("RELAY_JOB_BACKOFF_TYPE") {
        if let Some(kind) = BackoffKind::parse(&val) {
            config.queue.job.backoff_type = kind;
        }
    }
    if let Some(val) = lookup("RELAY_JOB_BACKOFF_DELAY_MS") {
        if let Ok(delay) = val.parse() {
            config.queue.job.backoff_delay_ms = delay;
        }
    }
    if let Some(val) = lookup("RELAY_JOB_REMOVE_ON_COMPLETE") {
        if let Ok(remove) = val.parse() {
            config.queue.job.remove_on_complete = remove;
        }
    }
    if let Some(val) = lookup("RELAY_JOB_KEEP_FAILED") {
        if val.trim().eq_ignore_ascii_case("all") {
            config.queue.job.keep_failed = None;
        } else if let Ok(keep) = val.parse() {
            config.queue.job.keep_failed = Some(keep);
        }
    }

    // Worker
    if let Some(val) = lookup("RELAY_WORKER_CONCURRENCY") {
        if let Ok(concurrency) = val.parse() {
            config.worker.concurrency = concurrency;
        }
    }
    if let Some(val) = lookup("RELAY_API_CALL_DELAY_MS") {
        if let Ok(delay) = val.parse() {
            config.worker.api_call_delay_ms = delay;
        }
    }
    if let Some(val) = lookup("RELAY_POLL_INTERVAL_MS") {
        if let Ok(interval) = val.parse() {
            config.worker.poll_interval_ms = interval;
        }
    }
    if let Some(val) = lookup("RELAY_SHUTDOWN_GRACE_SECS") {
        if let Ok(grace) = val.parse() {
            config.worker.shutdown_grace_secs = grace;
        }
    }
    if let Some(val) = lookup("RELAY_RATE_LIMIT_PER_MINUTE") {
        if let Ok(limit) = val.parse() {
            config.worker.rate_limit_per_minute = Some(limit);
        }
    }
    if let Some(val) = lookup("RELAY_FAIL_WHEN_ALL_UNITS_FAIL") {
        config.worker.fail_when_all_units_fail = val.parse().unwrap_or(false);
    }

    // Gateway
    if let Some(val) = lookup("RELAY_GATEWAY_URL") {
        config.gateway.url = val;
    }
    if let Some(val) = lookup("RELAY_GATEWAY_API_KEY") {
        config.gateway.api_key = val;
    }
    if let Some(val) = lookup("RELAY_GATEWAY_TIMEOUT_MS") {
        if let Ok(timeout) = val.parse() {
            config.gateway.timeout_ms = timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("RELAY_QUEUE_NAME", "priority-queue"),
                ("RELAY_JOB_ATTEMPTS", "5"),
                ("RELAY_JOB_BACKOFF_TYPE", "Fixed"),
                ("RELAY_JOB_KEEP_FAILED", "all"),
                ("RELAY_WORKER_CONCURRENCY", "8"),
                ("RELAY_RATE_LIMIT_PER_MINUTE", "120"),
                ("RELAY_FAIL_WHEN_ALL_UNITS_FAIL", "true"),
                ("RELAY_GATEWAY_URL", "https://gateway.example.com"),
            ]),
        );

        assert_eq!(config.queue.name, "priority-queue");
        assert_eq!(config.queue.job.attempts, 5);
        assert_eq!(config.queue.job.backoff_type, BackoffKind::Fixed);
        assert_eq!(config.queue.job.keep_failed, None);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.rate_limit_per_minute, Some(120));
        assert!(config.worker.fail_when_all_units_fail);
        assert_eq!(config.gateway.url, "https://gateway.example.com");
    }

    #[test]
    fn test_unparseable_overrides_ignored() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("RELAY_WORKER_CONCURRENCY", "many"),
                ("RELAY_JOB_BACKOFF_TYPE", "linear"),
                ("RELAY_API_CALL_DELAY_MS", "-1"),
            ]),
        );

        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.queue.job.backoff_type, BackoffKind::Exponential);
        assert_eq!(config.worker.api_call_delay_ms, 1000);
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway]\nurl = \"http://from-file\"\ntimeout_ms = 1500").unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.gateway.timeout_ms, 1500);
    }
}

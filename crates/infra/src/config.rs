//! Engine configuration.
//!
//! Stored as a JSON object; every key is optional and falls back to its
//! default, so a partial (or missing) file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::jobs::{PoolConfig, RetryPolicy};

pub const ENV_WORKERS: &str = "QUEUECTL_WORKERS";
pub const ENV_DATABASE: &str = "QUEUECTL_DB";

/// Keys accepted by [`EngineConfig::get`] and [`EngineConfig::set`].
pub const KEYS: [&str; 8] = [
    "worker_count",
    "max_attempts",
    "base_retry_delay_ms",
    "max_retry_delay_ms",
    "execution_timeout_ms",
    "shutdown_timeout_ms",
    "poll_interval_ms",
    "database_path",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_count: usize,
    /// Default ceiling for jobs submitted without one
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// `None` disables the per-attempt timeout
    pub execution_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// `~` expands to the home directory
    pub database_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            max_attempts: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            execution_timeout_ms: Some(300_000),
            shutdown_timeout_ms: 30_000,
            poll_interval_ms: 1_000,
            database_path: "~/.queuectl/jobs.db".to_string(),
        }
    }
}

impl EngineConfig {
    /// `~/.queuectl/config.json`
    pub fn default_path() -> PathBuf {
        expand_home("~/.queuectl/config.json")
    }

    /// Load `path` merged over the defaults. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, json).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::invalid(
                "max_retry_delay_ms",
                "must not be below base_retry_delay_ms",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive"));
        }
        if self.execution_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("execution_timeout_ms", "must be positive"));
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::invalid("database_path", "must not be empty"));
        }
        Ok(())
    }

    /// Current value of `key` rendered as a string.
    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "worker_count" => self.worker_count.to_string(),
            "max_attempts" => self.max_attempts.to_string(),
            "base_retry_delay_ms" => self.base_retry_delay_ms.to_string(),
            "max_retry_delay_ms" => self.max_retry_delay_ms.to_string(),
            "execution_timeout_ms" => self
                .execution_timeout_ms
                .map_or_else(|| "none".to_string(), |ms| ms.to_string()),
            "shutdown_timeout_ms" => self.shutdown_timeout_ms.to_string(),
            "poll_interval_ms" => self.poll_interval_ms.to_string(),
            "database_path" => self.database_path.clone(),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        };
        Ok(value)
    }

    /// Parse and assign one key. The config is left unchanged on error.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        let value = value.trim();
        match key {
            "worker_count" => next.worker_count = parse(key, value)?,
            "max_attempts" => next.max_attempts = parse(key, value)?,
            "base_retry_delay_ms" => next.base_retry_delay_ms = parse(key, value)?,
            "max_retry_delay_ms" => next.max_retry_delay_ms = parse(key, value)?,
            "execution_timeout_ms" => {
                next.execution_timeout_ms = match value {
                    "none" | "off" => None,
                    v => Some(parse(key, v)?),
                }
            }
            "shutdown_timeout_ms" => next.shutdown_timeout_ms = parse(key, value)?,
            "poll_interval_ms" => next.poll_interval_ms = parse(key, value)?,
            "database_path" => next.database_path = value.to_string(),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }

        next.validate()?;
        info!(key, value, "configuration updated");
        *self = next;
        Ok(())
    }

    /// Apply `QUEUECTL_WORKERS` / `QUEUECTL_DB` from the environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(workers) = var(ENV_WORKERS) {
            self.set("worker_count", &workers)?;
        }
        if let Some(db) = var(ENV_DATABASE) {
            self.set("database_path", &db)?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_retry_policy(self.retry_policy())
            .with_execution_timeout(self.execution_timeout_ms.map(Duration::from_millis))
            .with_shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

//! Job engine configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::workers::WorkerConfig;

pub const POLL_INTERVAL_VAR: &str = "JOBS_POLL_INTERVAL_MS";
pub const BATCH_SIZE_VAR: &str = "JOBS_BATCH_SIZE";
pub const STUCK_TIMEOUT_VAR: &str = "JOBS_STUCK_TIMEOUT_SECS";
pub const SHUTDOWN_TIMEOUT_VAR: &str = "JOBS_SHUTDOWN_TIMEOUT_SECS";
pub const WORKER_NAME_VAR: &str = "JOBS_WORKER_NAME";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Validation(String),
}

/// Settings for the job worker and its store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub stuck_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub worker_name: String,
    pub database_url: Option<String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            stuck_timeout: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(30),
            worker_name: "job-worker".to_string(),
            database_url: None,
        }
    }
}

impl JobsConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable source.
    ///
    /// Unset variables keep their defaults; set but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, POLL_INTERVAL_VAR)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&lookup, BATCH_SIZE_VAR)? {
            config.batch_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, STUCK_TIMEOUT_VAR)? {
            config.stuck_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, SHUTDOWN_TIMEOUT_VAR)? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        match lookup(WORKER_NAME_VAR).filter(|n| !n.trim().is_empty()) {
            Some(name) => config.worker_name = name,
            None => tracing::debug!(var = WORKER_NAME_VAR, "not set; using default"),
        }

        config.database_url = lookup(DATABASE_URL_VAR).filter(|u| !u.is_empty());
        if config.database_url.is_none() {
            tracing::warn!("DATABASE_URL not set; jobs will only be kept in memory");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch size must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll interval must be non-zero".into()));
        }
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(self.worker_name.clone())
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.batch_size)
            .with_stuck_timeout(self.stuck_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        tracing::debug!(var, "not set; using default");
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

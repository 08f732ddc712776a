//! Environment-driven configuration.
//!
//! Every variable is optional; unset means the default. A set but unparsable
//! value is an error rather than a silent fallback.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use forgebatch_batch::RetryPolicy;

use crate::export::ExportWriterConfig;
use crate::jobs::{OrchestratorConfig, WorkerPoolConfig};

const PREFIX: &str = "FORGEBATCH_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub upload_dir: PathBuf,
    pub page_size: usize,
    pub progress_interval: u64,
    pub workers: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./uploads"),
            page_size: 50,
            progress_interval: 100,
            workers: 2,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(300),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(60_000),
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (full names, prefix included).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let get = |name: &str| lookup(&format!("{PREFIX}{name}"));

        let config = Self {
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(d.upload_dir),
            page_size: parse(&get, "PAGE_SIZE")?.unwrap_or(d.page_size),
            progress_interval: parse(&get, "PROGRESS_INTERVAL")?.unwrap_or(d.progress_interval),
            workers: parse(&get, "WORKERS")?.unwrap_or(d.workers),
            poll_interval: parse(&get, "POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            visibility_timeout: parse(&get, "VISIBILITY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.visibility_timeout),
            max_attempts: parse(&get, "MAX_ATTEMPTS")?.unwrap_or(d.max_attempts),
            retry_base_delay: parse(&get, "RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.retry_base_delay),
            retry_max_delay: parse(&get, "RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.retry_max_delay),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("PAGE_SIZE", self.page_size as u64),
            ("PROGRESS_INTERVAL", self.progress_interval),
            ("WORKERS", self.workers as u64),
            ("MAX_ATTEMPTS", self.max_attempts as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(invalid(name, "0", "must be greater than zero"));
            }
        }
        if self.page_size > 1000 {
            return Err(invalid("PAGE_SIZE", &self.page_size.to_string(), "must be at most 1000"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                &self.retry_max_delay.as_millis().to_string(),
                "must not be below RETRY_BASE_DELAY_MS",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            ..RetryPolicy::default()
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry_policy: self.retry_policy(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn export_writer(&self) -> ExportWriterConfig {
        ExportWriterConfig {
            page_size: self.page_size,
            progress_interval: self.progress_interval,
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            poll_interval: self.poll_interval,
            ..WorkerPoolConfig::default()
        }
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &raw, &e.to_string())),
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var: format!("{PREFIX}{name}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

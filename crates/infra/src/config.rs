//! Configuration loading and representation.

use std::time::Duration;

use crate::jobs::retry::RetryPolicy;
use crate::jobs::types::{
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS, MAX_RETRIES_LIMIT, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Defaults applied to submissions that leave a field unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueConfig {
    /// Concurrent execution slots
    pub workers: usize,
    /// Idle wait between claim attempts
    pub poll_interval: Duration,
    /// How often the stall detector scans
    pub stall_sweep_interval: Duration,
    /// Max overdue jobs handled per sweep
    pub stall_batch_size: usize,
    /// How often a running attempt re-reads its lease
    pub lease_check_interval: Duration,
    pub retry: RetryPolicy,
    pub defaults: JobDefaults,
    /// Lock owner recorded on claimed jobs
    pub instance_id: String,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(250),
            stall_sweep_interval: Duration::from_secs(30),
            stall_batch_size: 100,
            lease_check_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            defaults: JobDefaults::default(),
            instance_id: format!("worker-{}", uuid::Uuid::now_v7()),
        }
    }
}

impl JobQueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stall_sweep_interval(mut self, interval: Duration) -> Self {
        self.stall_sweep_interval = interval;
        self
    }

    pub fn with_lease_check_interval(mut self, interval: Duration) -> Self {
        self.lease_check_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Load from `CASEFLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "CASEFLOW_WORKERS")? {
            config.workers = v;
        }
        if let Some(ms) = parse(&lookup, "CASEFLOW_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CASEFLOW_STALL_SWEEP_INTERVAL_MS")? {
            config.stall_sweep_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "CASEFLOW_STALL_BATCH_SIZE")? {
            config.stall_batch_size = v;
        }
        if let Some(ms) = parse(&lookup, "CASEFLOW_LEASE_CHECK_INTERVAL_MS")? {
            config.lease_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CASEFLOW_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CASEFLOW_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "CASEFLOW_DEFAULT_TIMEOUT_MS")? {
            config.defaults.timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, "CASEFLOW_DEFAULT_MAX_RETRIES")? {
            config.defaults.max_retries = v;
        }
        if let Some(id) = lookup("CASEFLOW_INSTANCE_ID").filter(|s| !s.trim().is_empty()) {
            config.instance_id = id;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.stall_batch_size == 0 {
            return Err(ConfigError::Invalid("stall batch size must be at least 1".into()));
        }
        for (name, interval) in [
            ("poll interval", self.poll_interval),
            ("stall sweep interval", self.stall_sweep_interval),
            ("lease check interval", self.lease_check_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry base delay exceeds max delay".into(),
            ));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.defaults.timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "default timeout must be within {MIN_TIMEOUT_MS}..={MAX_TIMEOUT_MS}ms"
            )));
        }
        if self.defaults.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "default max retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Parse {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

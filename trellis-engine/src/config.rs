//! Engine configuration
//!
//! Polling cadence, timeouts and worker-pool sizing. Every value has a
//! default and can be overridden from the environment.

use std::time::Duration;

use trellis_core::{ProvisionError, Result};

use crate::poller::PollSettings;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay between two checks of a long-running operation
    pub poll_interval: Duration,

    /// Maximum time a single long-running operation may take
    pub poll_timeout: Duration,

    /// Consecutive transient provider errors tolerated while polling
    pub max_transient_errors: u32,

    /// Upper bound of the backoff between transient-error retries
    pub max_backoff: Duration,

    /// Worker pool size for per-node steps; `None` uses the hosting manager default
    pub max_parallel: Option<usize>,
}

impl EngineConfig {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(600), // 10 minutes
            max_transient_errors: 5,
            max_backoff: Duration::from_secs(30),
            max_parallel: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - TRELLIS_POLL_INTERVAL (optional, seconds, default: 5)
    /// - TRELLIS_POLL_TIMEOUT (optional, seconds, default: 600)
    /// - TRELLIS_MAX_TRANSIENT_ERRORS (optional, default: 5)
    /// - TRELLIS_MAX_PARALLEL (optional, default: hosting manager default)
    ///
    /// Unparsable values fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::new();

        let poll_interval = env_parse::<u64>("TRELLIS_POLL_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let poll_timeout = env_parse::<u64>("TRELLIS_POLL_TIMEOUT")
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_timeout);

        let max_transient_errors =
            env_parse::<u32>("TRELLIS_MAX_TRANSIENT_ERRORS").unwrap_or(defaults.max_transient_errors);

        let max_parallel = env_parse::<usize>("TRELLIS_MAX_PARALLEL");

        Self {
            poll_interval,
            poll_timeout,
            max_transient_errors,
            max_backoff: defaults.max_backoff,
            max_parallel,
        }
    }

    /// Sets the worker pool size
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ProvisionError::Validation(
                "poll_interval must be greater than 0".into(),
            ));
        }

        if self.poll_timeout < self.poll_interval {
            return Err(ProvisionError::Validation(
                "poll_timeout must be at least one poll_interval".into(),
            ));
        }

        if self.max_parallel == Some(0) {
            return Err(ProvisionError::Validation(
                "max_parallel must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Poll settings derived from this configuration
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.poll_interval,
            timeout: self.poll_timeout,
            max_transient_errors: self.max_transient_errors,
            max_backoff: self.max_backoff,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

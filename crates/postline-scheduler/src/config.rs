//! Service configuration.

use std::time::Duration;

use crate::{RetryPolicy, SchedulerError};

/// Default queue name reported by the health endpoint.
pub const DEFAULT_QUEUE_NAME: &str = "scheduled-posts";

/// Delay scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between sweeps for due jobs.
    pub sweep_interval: Duration,
    /// Terminal jobs older than this are purged. `None` keeps them forever.
    pub retention: Option<Duration>,
    /// Minimum time between purges.
    pub purge_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

/// Everything the scheduler service needs besides the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub queue_name: String,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    /// Upper bound on a single callback invocation.
    pub callback_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            callback_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.queue_name.trim().is_empty() {
            return Err(SchedulerError::validation("queueName", "must not be empty"));
        }
        if self.scheduler.sweep_interval.is_zero() {
            return Err(SchedulerError::validation("sweepInterval", "must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::validation("maxAttempts", "must be at least 1"));
        }
        if self.callback_timeout.is_zero() {
            return Err(SchedulerError::validation("callbackTimeout", "must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_policy() {
        let config = ServiceConfig::default();
        assert_eq!(config.queue_name, "scheduled-posts");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(5));
        assert_eq!(config.scheduler.sweep_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = ServiceConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.scheduler.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.callback_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.queue_name = " ".to_string();
        assert!(config.validate().is_err());
    }
}

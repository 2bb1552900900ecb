//! Scheduler configuration.
//!
//! A plain struct with sensible defaults and a `validate` guardrail. The
//! embedding engine owns file and environment layering; this crate only
//! consumes the final values.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Configuration for a [`PhysicalScheduler`](crate::PhysicalScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of dedicated worker threads. Fixed for the scheduler's
    /// lifetime. Defaults to the available processor count.
    pub worker_count: usize,

    /// Period of the background heartbeat that wakes idle workers to guard
    /// against lost wakeups. Low frequency by design.
    pub heartbeat_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map_or(1, NonZeroUsize::get),
            heartbeat_period: Duration::from_millis(500),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with the given worker count and default
    /// heartbeat period.
    #[must_use]
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.heartbeat_period < Duration::from_millis(1) {
            return Err(ConfigError::HeartbeatTooShort);
        }

        Ok(())
    }
}

/// Configuration validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The worker pool must have at least one thread.
    #[error("worker_count must be at least 1")]
    NoWorkers,

    /// A sub-millisecond heartbeat would busy-spin every worker.
    #[error("heartbeat_period must be at least 1ms")]
    HeartbeatTooShort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_count >= 1);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = SchedulerConfig::with_workers(0);
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));
    }

    #[test]
    fn sub_millisecond_heartbeat_is_rejected() {
        let config = SchedulerConfig {
            heartbeat_period: Duration::from_micros(10),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::HeartbeatTooShort));
    }
}

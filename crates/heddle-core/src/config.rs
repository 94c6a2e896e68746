//! Pool configuration.
//!
//! Values come from the embedding application; `from_env` is a convenience for
//! binaries that configure the pool through environment variables.

use std::time::Duration;

use crate::pool::ReplacementPolicy;

pub const ENV_CAPACITY: &str = "HEDDLE_POOL_CAPACITY";
pub const ENV_TASK_TIMEOUT_MS: &str = "HEDDLE_TASK_TIMEOUT_MS";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "HEDDLE_ACQUIRE_TIMEOUT_MS";
pub const ENV_HEALTH_INTERVAL_MS: &str = "HEDDLE_HEALTH_INTERVAL_MS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "HEDDLE_PROBE_TIMEOUT_MS";
pub const ENV_STALL_AFTER_MS: &str = "HEDDLE_STALL_AFTER_MS";

/// Buffer of each unit's request/response channels. A unit handles one task at
/// a time, the extra room only absorbs a probe racing a late response.
pub(crate) const UNIT_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of execution units, fixed for the lifetime of the pool.
    pub capacity: usize,
    /// Default per-task timeout. `None` waits for the unit indefinitely.
    pub task_timeout: Option<Duration>,
    /// How long a caller may wait in the acquisition queue.
    pub acquire_timeout: Option<Duration>,
    /// Interval between health supervisor rounds.
    pub health_interval: Duration,
    /// How long an idle unit has to answer a ping.
    pub probe_timeout: Duration,
    /// A unit busy on one task for longer than this is replaced.
    /// `None` derives it from `task_timeout` (three times), or disables it.
    pub stall_after: Option<Duration>,
    /// Backoff for slots whose replacement failed.
    pub replacement: ReplacementPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            task_timeout: Some(Duration::from_secs(30)),
            acquire_timeout: None,
            health_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            stall_after: None,
            replacement: ReplacementPolicy::default(),
        }
    }
}

/// Available parallelism minus one (the coordinating thread), at least one.
pub fn default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl PoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Read overrides from `HEDDLE_*` environment variables on top of the
    /// defaults. Unset variables keep the default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(capacity) = read_number(&lookup, ENV_CAPACITY)? {
            config.capacity = capacity as usize;
        }
        if let Some(ms) = read_number(&lookup, ENV_TASK_TIMEOUT_MS)? {
            config.task_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = read_number(&lookup, ENV_ACQUIRE_TIMEOUT_MS)? {
            config.acquire_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = read_number(&lookup, ENV_HEALTH_INTERVAL_MS)? {
            config.health_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_number(&lookup, ENV_PROBE_TIMEOUT_MS)? {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_number(&lookup, ENV_STALL_AFTER_MS)? {
            config.stall_after = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid(
                "capacity must be greater than 0".to_string(),
            ));
        }
        if self.health_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health_interval must be greater than zero".to_string(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "probe_timeout must be greater than zero".to_string(),
            ));
        }
        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(
                "task_timeout must be greater than zero".to_string(),
            ));
        }
        self.replacement.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Busy time after which the supervisor gives up on a unit.
    pub(crate) fn effective_stall_after(&self) -> Option<Duration> {
        self.stall_after
            .or_else(|| self.task_timeout.map(|t| t.saturating_mul(3)))
    }
}

fn read_number(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ConfigError::InvalidNumber { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_capacity_is_at_least_one() {
        assert!(default_capacity() >= 1);
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = PoolConfig::from_lookup(lookup_from(&[
            (ENV_CAPACITY, "3"),
            (ENV_TASK_TIMEOUT_MS, "1500"),
            (ENV_HEALTH_INTERVAL_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(config.capacity, 3);
        assert_eq!(config.task_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.health_interval, Duration::from_millis(250));
        assert_eq!(config.acquire_timeout, None);
    }

    #[rstest]
    #[case(ENV_CAPACITY, "zero")]
    #[case(ENV_CAPACITY, "0")]
    #[case(ENV_TASK_TIMEOUT_MS, "-5")]
    #[case(ENV_PROBE_TIMEOUT_MS, "")]
    fn rejects_bad_numbers(#[case] name: &str, #[case] value: &str) {
        let result = PoolConfig::from_lookup(lookup_from(&[(name, value)]));
        assert!(matches!(result, Err(ConfigError::InvalidNumber { .. })));
    }

    #[test]
    fn stall_threshold_derives_from_task_timeout() {
        let config = PoolConfig {
            task_timeout: Some(Duration::from_secs(2)),
            stall_after: None,
            ..PoolConfig::with_capacity(1)
        };
        assert_eq!(config.effective_stall_after(), Some(Duration::from_secs(6)));

        let config = PoolConfig {
            task_timeout: None,
            stall_after: None,
            ..PoolConfig::with_capacity(1)
        };
        assert_eq!(config.effective_stall_after(), None);
    }

    #[rstest]
    #[case::negative_multiplier(ReplacementPolicy { multiplier: -2.0, ..ReplacementPolicy::default() })]
    #[case::fractional_multiplier(ReplacementPolicy { multiplier: 0.5, ..ReplacementPolicy::default() })]
    #[case::nan_multiplier(ReplacementPolicy { multiplier: f64::NAN, ..ReplacementPolicy::default() })]
    #[case::nan_jitter(ReplacementPolicy { jitter: f64::NAN, ..ReplacementPolicy::default() })]
    #[case::jitter_above_one(ReplacementPolicy { jitter: 1.5, ..ReplacementPolicy::default() })]
    #[case::base_above_max(ReplacementPolicy {
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(1),
        ..ReplacementPolicy::default()
    })]
    #[case::zero_attempts(ReplacementPolicy { max_attempts: 0, ..ReplacementPolicy::default() })]
    fn rejects_unusable_replacement_policy(#[case] replacement: ReplacementPolicy) {
        let config = PoolConfig {
            replacement,
            ..PoolConfig::with_capacity(1)
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_capacity_is_invalid() {
        assert!(PoolConfig::with_capacity(0).validate().is_err());
    }
}

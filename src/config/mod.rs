//! Configuration for the recovery layer.

use crate::errors::{RecoveryError, RecoveryResult};
use crate::resilience::{CircuitBreakerConfig, ResourceLimit, RetryConfig};
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_MONITOR_INTERVAL_MS};
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by the breakers, retry handler and resource manager.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// Default breaker configuration for breakers created without one
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Resource limits
    pub resources: ResourceLimit,
    /// Sampling interval of the resource monitor started by `RecoveryOrchestratorBuilder::monitoring`
    pub monitor_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig {
                max_retries: DEFAULT_MAX_RETRIES,
                ..Default::default()
            },
            resources: ResourceLimit::default(),
            monitor_interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
        }
    }
}

impl RecoveryConfig {
    /// Creates a new configuration builder
    pub fn builder() -> RecoveryConfigBuilder {
        RecoveryConfigBuilder::default()
    }

    /// Creates a configuration from `VIBEZEN_*` environment variables.
    ///
    /// Unset variables keep their defaults; values that do not parse are a
    /// configuration error.
    pub fn from_env() -> RecoveryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RecoveryResult<Self> {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let breaker = &mut config.circuit_breaker;
        if let Some(value) = env.parse("VIBEZEN_FAILURE_THRESHOLD")? {
            breaker.failure_threshold = value;
        }
        if let Some(value) = env.parse("VIBEZEN_SUCCESS_THRESHOLD")? {
            breaker.success_threshold = value;
        }
        if let Some(secs) = env.parse("VIBEZEN_BREAKER_TIMEOUT_SECS")? {
            breaker.timeout = Duration::from_secs(secs);
        }

        let retry = &mut config.retry;
        if let Some(value) = env.parse("VIBEZEN_MAX_RETRIES")? {
            retry.max_retries = value;
        }
        if let Some(ms) = env.parse("VIBEZEN_INITIAL_DELAY_MS")? {
            retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse("VIBEZEN_MAX_DELAY_MS")? {
            retry.max_delay = Duration::from_millis(ms);
        }

        config.resources = ResourceLimit {
            max_memory_mb: env.parse("VIBEZEN_MEMORY_MB")?,
            max_cpu_percent: env.parse("VIBEZEN_CPU_PERCENT")?,
            max_concurrent_tasks: env.parse("VIBEZEN_MAX_CONCURRENT_TASKS")?,
            max_requests_per_minute: env.parse("VIBEZEN_REQUESTS_PER_MINUTE")?,
            max_tokens_per_minute: env.parse("VIBEZEN_TOKENS_PER_MINUTE")?,
        };

        if let Some(ms) = env.parse("VIBEZEN_MONITOR_INTERVAL_MS")? {
            config.monitor_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the breaker and retry settings for values that cannot work.
    pub fn validate(&self) -> RecoveryResult<()> {
        self.circuit_breaker.validate()?;

        if self.retry.exponential_base < 1.0 {
            return Err(RecoveryError::configuration(
                "retry exponential_base must be at least 1.0",
            ));
        }
        let (low, high) = self.retry.jitter_range;
        if low < 0.0 || low > high {
            return Err(RecoveryError::configuration(
                "retry jitter_range must satisfy 0 <= low <= high",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(RecoveryError::configuration(
                "retry initial_delay must not exceed max_delay",
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(RecoveryError::configuration("monitor_interval must be positive"));
        }
        if self.resources.max_concurrent_tasks == Some(0) {
            return Err(RecoveryError::configuration(
                "max_concurrent_tasks must be positive when set",
            ));
        }
        Ok(())
    }
}

struct EnvReader<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> EnvReader<L> {
    fn parse<V: FromStr>(&self, key: &str) -> RecoveryResult<Option<V>> {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                RecoveryError::configuration(format!("{} has an invalid value: {:?}", key, raw))
            }),
        }
    }
}

/// Builder for RecoveryConfig
#[derive(Default)]
pub struct RecoveryConfigBuilder {
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryConfig>,
    resources: Option<ResourceLimit>,
    monitor_interval: Option<Duration>,
}

impl RecoveryConfigBuilder {
    /// Sets the default breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Sets the retry policy
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Sets the resource limits
    pub fn resources(mut self, limits: ResourceLimit) -> Self {
        self.resources = Some(limits);
        self
    }

    /// Sets the monitor sampling interval
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    /// Builds and validates the configuration
    pub fn build(self) -> RecoveryResult<RecoveryConfig> {
        let defaults = RecoveryConfig::default();
        let config = RecoveryConfig {
            circuit_breaker: self.circuit_breaker.unwrap_or(defaults.circuit_breaker),
            retry: self.retry.unwrap_or(defaults.retry),
            resources: self.resources.unwrap_or(defaults.resources),
            monitor_interval: self.monitor_interval.unwrap_or(defaults.monitor_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_builder() {
        let config = RecoveryConfig::builder().build().unwrap();

        assert_eq!(config, RecoveryConfig::default());
        assert_eq!(config.retry.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(
            config.monitor_interval,
            Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS)
        );
    }

    #[test]
    fn test_config_builder_custom() {
        let config = RecoveryConfig::builder()
            .circuit_breaker(CircuitBreakerConfig::thinking_engine())
            .retry(RetryConfig {
                max_retries: 5,
                ..Default::default()
            })
            .resources(ResourceLimit {
                max_concurrent_tasks: Some(4),
                ..Default::default()
            })
            .monitor_interval(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.resources.max_concurrent_tasks, Some(4));
        assert_eq!(config.monitor_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        let err = RecoveryConfig::builder()
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = RecoveryConfig::builder()
            .monitor_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_from_lookup_without_variables_uses_defaults() {
        let config = RecoveryConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RecoveryConfig::default());
    }

    #[test]
    fn test_from_lookup_reads_every_variable() {
        let config = RecoveryConfig::from_lookup(lookup(&[
            ("VIBEZEN_FAILURE_THRESHOLD", "7"),
            ("VIBEZEN_SUCCESS_THRESHOLD", "3"),
            ("VIBEZEN_BREAKER_TIMEOUT_SECS", "15"),
            ("VIBEZEN_MAX_RETRIES", "2"),
            ("VIBEZEN_INITIAL_DELAY_MS", "250"),
            ("VIBEZEN_MAX_DELAY_MS", "5000"),
            ("VIBEZEN_MAX_CONCURRENT_TASKS", "8"),
            ("VIBEZEN_REQUESTS_PER_MINUTE", "60"),
            ("VIBEZEN_TOKENS_PER_MINUTE", "90000"),
            ("VIBEZEN_MEMORY_MB", "2048"),
            ("VIBEZEN_CPU_PERCENT", "85.5"),
            ("VIBEZEN_MONITOR_INTERVAL_MS", "1000"),
        ]))
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 7);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(15));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_millis(5000));
        assert_eq!(
            config.resources,
            ResourceLimit {
                max_memory_mb: Some(2048),
                max_cpu_percent: Some(85.5),
                max_concurrent_tasks: Some(8),
                max_requests_per_minute: Some(60),
                max_tokens_per_minute: Some(90000),
            }
        );
        assert_eq!(config.monitor_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_from_lookup_rejects_unparsable_numbers() {
        let err = RecoveryConfig::from_lookup(lookup(&[("VIBEZEN_MAX_RETRIES", "many")])).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("VIBEZEN_MAX_RETRIES"));
    }
}

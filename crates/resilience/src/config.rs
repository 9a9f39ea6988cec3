//! Pipeline configuration
//!
//! Each policy owns its configuration type ([`RetryConfig`], [`CircuitBreakerConfig`],
//! [`BulkheadConfig`]); [`PipelineConfig`] aggregates them with the cache defaults
//! and can be loaded from `RESILIENCE_*` environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{BulkheadConfig, CircuitBreakerConfig, RetryConfig};

/// Default time-to-live for cached results
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Configuration for a [`Pipeline`](crate::Pipeline)
///
/// # Example
///
/// ```
/// use resilience_pipeline::{PipelineConfig, RetryConfig};
/// use std::time::Duration;
///
/// let config = PipelineConfig::default()
///     .with_retry(RetryConfig::default().with_max_retries(5))
///     .with_default_cache_ttl(Duration::from_secs(2));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Retry policy settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Bulkhead settings
    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    /// TTL applied when a cached call does not specify one
    #[serde(with = "duration_millis", default = "default_cache_ttl")]
    pub default_cache_ttl: Duration,
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            default_cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl PipelineConfig {
    /// Create a new pipeline configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry configuration
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the circuit breaker configuration
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Set the bulkhead configuration
    pub fn with_bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.bulkhead = bulkhead;
        self
    }

    /// Set the default cache TTL
    pub fn with_default_cache_ttl(mut self, ttl: Duration) -> Self {
        self.default_cache_ttl = ttl;
        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.bulkhead.validate()?;
        if self.default_cache_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "default_cache_ttl",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Unset variables keep their defaults. Environment variables:
    /// - `RESILIENCE_MAX_RETRIES`: retry attempts after the first (default: 3)
    /// - `RESILIENCE_BASE_DELAY_MS`: first backoff delay (default: 100)
    /// - `RESILIENCE_MAX_DELAY_MS`: backoff cap (default: 30000)
    /// - `RESILIENCE_BACKOFF_MULTIPLIER`: growth factor, > 1.0 (default: 2.0)
    /// - `RESILIENCE_FAILURE_THRESHOLD`: failures before the circuit opens (default: 5)
    /// - `RESILIENCE_RECOVERY_TIMEOUT_MS`: open duration before a trial call (default: 30000)
    /// - `RESILIENCE_MAX_CONCURRENCY`: bulkhead permits (default: 10)
    /// - `RESILIENCE_CACHE_TTL_MS`: default cache TTL (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    ///
    /// Same keys as [`from_env`](Self::from_env); the result is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "RESILIENCE_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_BACKOFF_MULTIPLIER")? {
            config.retry.backoff_multiplier = v;
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_RECOVERY_TIMEOUT_MS")? {
            config.circuit_breaker.recovery_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_MAX_CONCURRENCY")? {
            config.bulkhead.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_CACHE_TTL_MS")? {
            config.default_cache_ttl = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

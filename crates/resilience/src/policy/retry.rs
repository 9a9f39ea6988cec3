//! Retry executor with exponential backoff and jitter

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::duration_millis;
use crate::error::{ConfigError, OperationError, ResilienceError};
use crate::events::{noop_sink, ResilienceEvent, SharedEventSink};

/// Configuration for operation retries
///
/// Attempt `i` (zero-based) that fails transiently is followed by a delay of
/// `min(base_delay × backoff_multiplier^i × U(1 - jitter, 1 + jitter), max_delay)`.
///
/// # Example
///
/// ```
/// use resilience_pipeline::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default()
///     .with_max_retries(2)
///     .with_base_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(5));
///
/// // First retry after ~100ms, second after ~200ms
/// assert_eq!(config.max_attempts(), 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays, strictly greater than 1.0
    pub backoff_multiplier: f64,

    /// Relative jitter (0.25 = ±25%)
    ///
    /// Delays are drawn from `[1 - jitter, 1 + jitter]` times the nominal delay.
    /// The default gives the standard ±25% spread; other values change the band
    /// and are mainly useful to make tests deterministic with `0.0`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries after the first attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between retries
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter factor (0.0-1.0), widening or narrowing the default band
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be greater than 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "max_delay",
                "must not be shorter than base_delay",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "jitter",
                format!("must be in [0.0, 1.0), got {}", self.jitter),
            ));
        }
        Ok(())
    }

    /// Delay before retrying after a failure of `attempt` (zero-based), with jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        self.delay_with_factor(attempt, factor)
    }

    /// Delay for `attempt` with an explicit jitter factor instead of a random draw
    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let jittered = raw * factor;
        let capped = jittered.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

/// Runs an operation, retrying transient failures with backoff
///
/// The executor keeps no state between calls; one instance can serve any
/// number of concurrent callers.
///
/// # Example
///
/// ```
/// use resilience_pipeline::{OperationError, RetryConfig, RetryExecutor};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = RetryExecutor::new(RetryConfig::default())?;
/// let cancel = CancellationToken::new();
///
/// let price = executor
///     .execute(|_cancel| async { Ok::<_, OperationError>(42_000.5) }, &cancel)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    sink: SharedEventSink,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Create a retry executor, validating the configuration
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            sink: noop_sink(),
        })
    }

    /// Set the event sink
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Get the retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    ///
    /// The operation receives a clone of `cancel`. Cancellation aborts the
    /// in-flight attempt and any pending backoff sleep.
    pub async fn execute<F, Fut, T>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let max_attempts = self.config.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled { attempts: attempt });
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt, "Attempt cancelled");
                    return Err(ResilienceError::Cancelled { attempts: attempt + 1 });
                }
                outcome = op(cancel.clone()) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Operation succeeded after retries");
                        self.sink.record(ResilienceEvent::RetrySucceeded {
                            attempts: attempt + 1,
                            timestamp: Utc::now(),
                        });
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(
                    attempt = attempt + 1,
                    kind = %err.kind,
                    error = %err,
                    "Non-retryable failure, aborting"
                );
                return Err(ResilienceError::NonRetryable {
                    attempts: attempt + 1,
                    source: err,
                });
            }

            if attempt >= self.config.max_retries {
                error!(attempts = max_attempts, error = %err, "Operation failed after all attempts");
                self.sink.record(ResilienceEvent::RetriesExhausted {
                    attempts: attempt + 1,
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(ResilienceError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: err,
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
            self.sink.record(ResilienceEvent::RetryScheduled {
                attempt,
                max_attempts,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
                timestamp: Utc::now(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt, "Backoff cancelled");
                    return Err(ResilienceError::Cancelled { attempts: attempt + 1 });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

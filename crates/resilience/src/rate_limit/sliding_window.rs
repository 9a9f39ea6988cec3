//! Sliding-window rate limiter with failure backoff

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RateLimiter;
use crate::config::duration_millis;
use crate::error::{ConfigError, ResilienceError};

const JITTER_BASE: Duration = Duration::from_millis(100);
const MAX_WAIT: Duration = Duration::from_secs(30);
const MAX_BACKOFF_EXPONENT: u32 = 10;
const MAX_BACKOFF_MULTIPLIER: f64 = 64.0;

/// Sliding-window limiter configuration
///
/// # Example
///
/// ```
/// use resilience_pipeline::SlidingWindowConfig;
/// use std::time::Duration;
///
/// // 10 orders per second
/// let config = SlidingWindowConfig::new(10, Duration::from_secs(1));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlidingWindowConfig {
    /// Admissions allowed per window
    pub limit: usize,

    /// Window length
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Usage ratio above which admissions are logged as warnings
    pub alert_threshold: f64,

    /// Usage ratio below which the limiter reports normal operation
    pub recovery_threshold: f64,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            limit: 1200,
            interval: Duration::from_secs(60),
            alert_threshold: 0.8,
            recovery_threshold: 0.5,
        }
    }
}

impl SlidingWindowConfig {
    /// Create a configuration with the given limit and window
    pub fn new(limit: usize, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            ..Self::default()
        }
    }

    /// Set the alert threshold (0.0-1.0)
    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the recovery threshold (0.0-1.0)
    pub fn with_recovery_threshold(mut self, threshold: f64) -> Self {
        self.recovery_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::invalid("limit", "must be at least 1"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("interval", "must be greater than zero"));
        }
        if self.recovery_threshold > self.alert_threshold {
            return Err(ConfigError::invalid(
                "recovery_threshold",
                "must not exceed alert_threshold",
            ));
        }
        Ok(())
    }
}

/// At most `limit` admissions in any `interval`
///
/// When the window is full, callers wait for the oldest admission to age out.
/// Consecutive failures reported through [`RateLimiter::record_failure`] stretch
/// that wait by `2^failures` (capped at 64x), plus up to 50ms of jitter; a single
/// wait never exceeds 30s.
pub struct SlidingWindowRateLimiter {
    config: SlidingWindowConfig,
    window: Mutex<VecDeque<Instant>>,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowRateLimiter")
            .field("config", &self.config)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

impl SlidingWindowRateLimiter {
    /// Create a limiter, validating the configuration
    pub fn new(config: SlidingWindowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            window: Mutex::new(VecDeque::with_capacity(config.limit.min(1024))),
            config,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Fraction of the limit used in the current window
    pub fn usage(&self) -> f64 {
        let mut window = self.window.lock();
        self.evict_expired(&mut window, Instant::now());
        window.len() as f64 / self.config.limit as f64
    }

    /// Whether usage is above the alert threshold
    pub fn is_approaching_limit(&self) -> bool {
        self.usage() > self.config.alert_threshold
    }

    /// Whether usage has dropped below the recovery threshold
    pub fn is_below_recovery_threshold(&self) -> bool {
        self.usage() < self.config.recovery_threshold
    }

    /// Failures reported since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn evict_expired(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) >= self.config.interval {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an admission if the window has room, otherwise return the time
    /// until the oldest admission expires
    fn try_admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        self.evict_expired(&mut window, now);

        if window.len() < self.config.limit {
            window.push_back(now);
            let used = window.len();
            if used as f64 > self.config.limit as f64 * self.config.alert_threshold {
                warn!(
                    used,
                    limit = self.config.limit,
                    usage = used as f64 / self.config.limit as f64,
                    "Rate limit approaching"
                );
            }
            return Ok(());
        }

        let wait = window
            .front()
            .map(|oldest| self.config.interval.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or_default();
        Err(wait)
    }

    fn backoff_multiplier(&self) -> f64 {
        match self.consecutive_failures() {
            0 => 1.0,
            n => 2f64
                .powi(n.min(MAX_BACKOFF_EXPONENT) as i32)
                .min(MAX_BACKOFF_MULTIPLIER),
        }
    }

    fn wait_with_backoff(&self, base_wait: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=0.5) * JITTER_BASE.as_secs_f64();
        let secs = base_wait.as_secs_f64() * self.backoff_multiplier() + jitter;
        Duration::from_secs_f64(secs.min(MAX_WAIT.as_secs_f64()))
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn admit(&self, cancel: &CancellationToken) -> Result<(), ResilienceError> {
        loop {
            let base_wait = match self.try_admit() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let delay = self.wait_with_backoff(base_wait);
            debug!(delay_ms = delay.as_millis() as u64, "Rate limited, waiting");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ResilienceError::Cancelled { attempts: 0 });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(failures, "Rate limiter recorded failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: usize, interval: Duration) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(SlidingWindowConfig::new(limit, interval)).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(SlidingWindowConfig::default().validate().is_ok());
        assert!(SlidingWindowConfig::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(SlidingWindowConfig::new(5, Duration::ZERO).validate().is_err());
        assert!(SlidingWindowConfig::default()
            .with_alert_threshold(0.4)
            .with_recovery_threshold(0.6)
            .validate()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_without_waiting() {
        let rl = limiter(3, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..3 {
            rl.admit(&cancel).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(rl.usage(), 1.0);
        assert!(rl.is_approaching_limit());
        assert!(!rl.is_below_recovery_threshold());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_waits_for_oldest_to_expire() {
        let rl = limiter(2, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        rl.admit(&cancel).await.unwrap();
        rl.admit(&cancel).await.unwrap();
        rl.admit(&cancel).await.unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited <= Duration::from_millis(1060));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_stretch_the_wait() {
        let rl = limiter(1, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        rl.record_failure();
        rl.record_failure();
        assert_eq!(rl.consecutive_failures(), 2);
        assert_eq!(rl.backoff_multiplier(), 4.0);

        rl.admit(&cancel).await.unwrap();
        let start = Instant::now();
        rl.admit(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));

        rl.record_success();
        assert_eq!(rl.consecutive_failures(), 0);
        assert_eq!(rl.backoff_multiplier(), 1.0);
    }

    #[test]
    fn test_backoff_multiplier_and_wait_are_capped() {
        let rl = limiter(1, Duration::from_secs(60));
        for _ in 0..20 {
            rl.record_failure();
        }
        assert_eq!(rl.backoff_multiplier(), 64.0);
        assert_eq!(rl.wait_with_backoff(Duration::from_secs(60)), MAX_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting() {
        let rl = limiter(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        rl.admit(&cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = rl.admit(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_recovers_after_interval() {
        let rl = limiter(4, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        for _ in 0..4 {
            rl.admit(&cancel).await.unwrap();
        }
        assert!(!rl.is_below_recovery_threshold());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(rl.usage(), 0.0);
        assert!(rl.is_below_recovery_threshold());
    }
}

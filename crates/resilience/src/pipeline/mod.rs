//! Composed resilience pipeline
//!
//! ```text
//!  execute(op, cancel, cache)
//!        │
//!        ├── cache hit ───────────────────────────────► value
//!        ▼
//!  RateLimiter::admit
//!        ▼
//!  Bulkhead ─► CircuitBreaker ─► RetryExecutor ─► op
//!        │
//!        ├── rate limiter record_success / record_failure
//!        └── cache insert on success
//! ```

mod cache;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, OperationError, ResilienceError};
use crate::events::{noop_sink, ResilienceEvent, SharedEventSink};
use crate::policy::{Bulkhead, CircuitBreaker, RetryExecutor};
use crate::rate_limit::RateLimiter;

pub use cache::CacheOptions;
use cache::ResultCache;

/// Builder for [`Pipeline`]
///
/// Policies not supplied explicitly are created from the configuration. Supply
/// shared instances to protect one dependency from several pipelines.
pub struct PipelineBuilder {
    config: PipelineConfig,
    sink: SharedEventSink,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Option<Arc<Bulkhead>>,
}

impl PipelineBuilder {
    /// Start from a configuration
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            sink: noop_sink(),
            rate_limiter: None,
            circuit_breaker: None,
            bulkhead: None,
        }
    }

    /// Set the event sink used by the pipeline and the policies it creates
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Consult a rate limiter before every non-cached call
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Use an existing circuit breaker instead of creating one
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Use an existing bulkhead instead of creating one
    pub fn with_bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Validate the configuration and build the pipeline
    pub fn build<T: Clone>(self) -> Result<Pipeline<T>, ConfigError> {
        self.config.validate()?;

        let bulkhead = match self.bulkhead {
            Some(bulkhead) => bulkhead,
            None => Arc::new(
                Bulkhead::new(self.config.bulkhead.clone())?.with_event_sink(self.sink.clone()),
            ),
        };
        let circuit_breaker = match self.circuit_breaker {
            Some(breaker) => breaker,
            None => Arc::new(
                CircuitBreaker::new(self.config.circuit_breaker.clone())?
                    .with_event_sink(self.sink.clone()),
            ),
        };
        let retry =
            RetryExecutor::new(self.config.retry.clone())?.with_event_sink(self.sink.clone());

        Ok(Pipeline {
            default_cache_ttl: self.config.default_cache_ttl,
            config: self.config,
            bulkhead,
            circuit_breaker,
            retry,
            rate_limiter: self.rate_limiter,
            cache: ResultCache::new(),
            disposed: AtomicBool::new(false),
            sink: self.sink,
        })
    }
}

/// Bulkhead, circuit breaker and retry composed around one dependency, with
/// cache-aside and an optional rate limiter
///
/// # Example
///
/// ```
/// use resilience_pipeline::prelude::*;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline: Pipeline<f64> = Pipeline::new(PipelineConfig::default())?;
/// let cancel = CancellationToken::new();
///
/// let price = pipeline
///     .execute(
///         |_cancel| async { Ok::<_, OperationError>(64_250.0) },
///         &cancel,
///         Some(CacheOptions::new("ticker:BTCUSDT").with_ttl(Duration::from_secs(1))),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<T> {
    config: PipelineConfig,
    default_cache_ttl: Duration,
    bulkhead: Arc<Bulkhead>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    cache: ResultCache<T>,
    disposed: AtomicBool,
    sink: SharedEventSink,
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("bulkhead", &self.bulkhead)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limiter", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone> Pipeline<T> {
    /// Create a pipeline with policies built from `config`
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        PipelineBuilder::new(config).build()
    }

    /// Get the configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The circuit breaker guarding this pipeline's dependency
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// The bulkhead bounding this pipeline's concurrency
    pub fn bulkhead(&self) -> &Arc<Bulkhead> {
        &self.bulkhead
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Run `op` through the pipeline
    ///
    /// A live cache entry for `cache.key` is returned without touching the rate
    /// limiter, the policies or `op`. Otherwise the call is admitted by the rate
    /// limiter, then the bulkhead, then the circuit breaker, and `op` runs under
    /// the retry executor. Successful results are cached when `cache` is set.
    pub async fn execute<F, Fut>(
        &self,
        op: F,
        cancel: &CancellationToken,
        cache: Option<CacheOptions>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        if self.is_disposed() {
            return Err(ResilienceError::Disposed {
                component: "pipeline",
            });
        }

        if let Some(opts) = &cache {
            if let Some(value) = self.cache.get(&opts.key) {
                debug!(key = %opts.key, "Serving cached result");
                self.sink.record(ResilienceEvent::CacheHit {
                    key: opts.key.clone(),
                    timestamp: Utc::now(),
                });
                return Ok(value);
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            match limiter.admit(cancel).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => warn!(error = %err, "Rate limiter admission failed, continuing"),
            }
        }

        let retry = &self.retry;
        let breaker = &self.circuit_breaker;
        let result = self
            .bulkhead
            .execute_with_cancellation(cancel, move || {
                breaker.execute(move || retry.execute(op, cancel))
            })
            .await;

        if let Some(limiter) = &self.rate_limiter {
            match &result {
                Ok(_) => limiter.record_success(),
                Err(_) => limiter.record_failure(),
            }
        }

        if let (Ok(value), Some(opts)) = (&result, cache) {
            let ttl = opts.ttl.unwrap_or(self.default_cache_ttl);
            debug!(key = %opts.key, ttl_ms = ttl.as_millis() as u64, "Caching result");
            self.cache.insert(opts.key, value.clone(), ttl);
        }

        result
    }

    /// Number of resident cache entries, expired ones included
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop the cache entry for `key`; returns whether one existed
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.remove(key)
    }

    /// Drop every expired cache entry; returns how many were removed
    pub fn purge_expired_cache(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
        purged
    }

    /// Dispose the bulkhead and circuit breaker and reject further calls
    ///
    /// Shared policies passed to the builder are disposed as well.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bulkhead.dispose();
        self.circuit_breaker.dispose();
        self.cache.clear();
        debug!("Pipeline disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::policy::{BulkheadConfig, CircuitBreakerConfig, CircuitState, RetryConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_retry(
                RetryConfig::default()
                    .with_max_retries(1)
                    .with_base_delay(Duration::from_millis(10)),
            )
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(2)
                    .with_recovery_timeout(Duration::from_secs(30)),
            )
            .with_bulkhead(BulkheadConfig::default().with_max_concurrency(2))
    }

    #[derive(Default)]
    struct CountingLimiter {
        admitted: AtomicU32,
        successes: AtomicU32,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RateLimiter for CountingLimiter {
        async fn admit(&self, _cancel: &CancellationToken) -> Result<(), ResilienceError> {
            self.admitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn record_success(&self) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn record_failure(&self) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_cached_and_reported() {
        let limiter = Arc::new(CountingLimiter::default());
        let sink = Arc::new(RecordingSink::new());
        let pipeline: Pipeline<u32> = PipelineBuilder::new(config())
            .with_rate_limiter(limiter.clone())
            .with_event_sink(sink.clone())
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value = pipeline
                .execute(
                    |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(7) }
                    },
                    &cancel,
                    Some(CacheOptions::new("k")),
                )
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.admitted.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.successes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count("cache_hit"), 2);
        assert_eq!(pipeline.cache_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncached_calls_always_run() {
        let pipeline: Pipeline<u32> = Pipeline::new(config()).unwrap();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            pipeline
                .execute(
                    |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(1) }
                    },
                    &cancel,
                    None,
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_not_cached_and_reported() {
        let limiter = Arc::new(CountingLimiter::default());
        let pipeline: Pipeline<u32> = PipelineBuilder::new(config())
            .with_rate_limiter(limiter.clone())
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let err = pipeline
            .execute(
                |_| async { Err(OperationError::transient("503")) },
                &cancel,
                Some(CacheOptions::new("k")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(pipeline.cache_len(), 0);
        assert_eq!(limiter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.circuit_breaker().stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_calls_open_the_circuit() {
        let pipeline: Pipeline<u32> = Pipeline::new(config()).unwrap();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            pipeline
                .execute(
                    |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err(OperationError::transient("timeout")) }
                    },
                    &cancel,
                    None,
                )
                .await
                .unwrap_err();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(pipeline.circuit_breaker().state(), CircuitState::Open);

        let err = pipeline
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                },
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(pipeline.bulkhead().available_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_purge() {
        let pipeline: Pipeline<&'static str> = Pipeline::new(config()).unwrap();
        let cancel = CancellationToken::new();

        for key in ["a", "b"] {
            pipeline
                .execute(
                    |_| async { Ok("v") },
                    &cancel,
                    Some(CacheOptions::new(key).with_ttl(Duration::from_secs(1))),
                )
                .await
                .unwrap();
        }
        assert!(pipeline.invalidate("a"));
        assert!(!pipeline.invalidate("a"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pipeline.cache_len(), 1);
        assert_eq!(pipeline.purge_expired_cache(), 1);
        assert_eq!(pipeline.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_and_tears_down_policies() {
        let pipeline: Pipeline<u32> = Pipeline::new(config()).unwrap();
        pipeline.dispose();

        assert!(pipeline.bulkhead().is_disposed());
        assert!(pipeline.circuit_breaker().is_disposed());

        let err = pipeline
            .execute(|_| async { Ok(1) }, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Disposed { component: "pipeline" }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig::default()
            .with_bulkhead(BulkheadConfig::default().with_max_concurrency(0));
        assert!(Pipeline::<u32>::new(config).is_err());
    }
}

//! Bulkhead: semaphore-based concurrency admission
//!
//! Callers wait for one of `max_concurrency` permits; the permit is an RAII guard,
//! so it is returned on every exit path including cancellation and panics.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::duration_millis;
use crate::error::{ConfigError, ResilienceError};
use crate::events::{noop_sink, ResilienceEvent, SharedEventSink};

/// Bulkhead configuration
///
/// # Example
///
/// ```
/// use resilience_pipeline::BulkheadConfig;
///
/// let config = BulkheadConfig::default().with_max_concurrency(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum operations running at once
    pub max_concurrency: usize,

    /// Permit waits longer than this are logged and reported as events
    #[serde(with = "duration_millis")]
    pub wait_warning_threshold: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            wait_warning_threshold: Duration::from_secs(1),
        }
    }
}

impl BulkheadConfig {
    /// Create a new bulkhead configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the slow-wait warning threshold
    pub fn with_wait_warning_threshold(mut self, threshold: Duration) -> Self {
        self.wait_warning_threshold = threshold;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "max_concurrency",
                "must be at least 1",
            ));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "max_concurrency",
                format!("must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(())
    }
}

/// Concurrency admission gate
///
/// # Example
///
/// ```
/// use resilience_pipeline::{Bulkhead, BulkheadConfig, ResilienceError};
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let bulkhead = Bulkhead::new(BulkheadConfig::default().with_max_concurrency(2))
///     .expect("valid config");
///
/// let depth = bulkhead
///     .execute(|| async { Ok::<_, ResilienceError>(20usize) })
///     .await?;
/// assert_eq!(bulkhead.available_count(), 2);
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Semaphore,
    disposed: AtomicBool,
    sink: SharedEventSink,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("max_concurrency", &self.config.max_concurrency)
            .field("available", &self.available_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Bulkhead {
    /// Create a bulkhead, validating the configuration
    pub fn new(config: BulkheadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            semaphore: Semaphore::new(config.max_concurrency),
            config,
            disposed: AtomicBool::new(false),
            sink: noop_sink(),
        })
    }

    /// Set the event sink
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Fixed permit count
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    /// Permits free right now; may be stale by the time the caller reads it
    pub fn available_count(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Operations currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrency
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fail queued and future callers with [`ResilienceError::Disposed`]
    ///
    /// Operations already holding a permit run to completion.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.semaphore.close();
            debug!("Bulkhead disposed");
        }
    }

    /// Run `op` once a permit is available
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let _permit = self.acquire().await?;
        op().await
    }

    /// Run `op` once a permit is available, giving up the wait if `cancel` fires
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ResilienceError::Cancelled { attempts: 0 }.into());
            }
            permit = self.acquire() => permit?,
        };
        op().await
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, ResilienceError> {
        if self.is_disposed() {
            return Err(ResilienceError::Disposed {
                component: "bulkhead",
            });
        }

        let started = Instant::now();
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ResilienceError::Disposed {
                component: "bulkhead",
            })?;

        let waited = started.elapsed();
        if waited > self.config.wait_warning_threshold {
            let available = self.available_count();
            warn!(
                waited_ms = waited.as_millis() as u64,
                available,
                max_concurrency = self.config.max_concurrency,
                "Bulkhead permit wait exceeded threshold"
            );
            self.sink.record(ResilienceEvent::BulkheadSlowAcquire {
                waited_ms: waited.as_millis() as u64,
                available,
                max_concurrency: self.config.max_concurrency,
                timestamp: Utc::now(),
            });
        }

        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn bulkhead(max: usize) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(BulkheadConfig::new().with_max_concurrency(max)).unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = BulkheadConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.wait_warning_threshold, Duration::from_secs(1));
        assert!(BulkheadConfig::new().with_max_concurrency(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_permit_released_on_success_and_failure() {
        let bh = bulkhead(2);

        let ok: Result<u32, ResilienceError> = bh.execute(|| async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(bh.available_count(), 2);

        let err: Result<u32, ResilienceError> = bh
            .execute(|| async { Err(ResilienceError::Cancelled { attempts: 1 }) })
            .await;
        assert!(err.is_err());
        assert_eq!(bh.available_count(), 2);
        assert_eq!(bh.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_concurrency() {
        let bh = bulkhead(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let bh = bh.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    bh.execute(|| async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert_eq!(bh.available_count() + bh.in_flight(), bh.max_concurrency());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ResilienceError>(())
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(bh.available_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_acquire_emits_event() {
        let sink = Arc::new(RecordingSink::new());
        let bh = Arc::new(
            Bulkhead::new(BulkheadConfig::new().with_max_concurrency(1))
                .unwrap()
                .with_event_sink(sink.clone()),
        );

        let holder = {
            let bh = bh.clone();
            tokio::spawn(async move {
                bh.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<_, ResilienceError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(bh.available_count(), 0);

        bh.execute(|| async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap();
        holder.await.unwrap().unwrap();

        assert_eq!(sink.count("bulkhead_slow_acquire"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_leaves_permits_intact() {
        let bh = bulkhead(1);
        let cancel = CancellationToken::new();

        let holder = {
            let bh = bh.clone();
            tokio::spawn(async move {
                bh.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, ResilienceError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = bh
            .execute_with_cancellation(&cancel, || async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        holder.await.unwrap().unwrap();
        assert_eq!(bh.available_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_fails_waiters_and_new_callers() {
        let bh = bulkhead(1);

        let holder = {
            let bh = bh.clone();
            tokio::spawn(async move {
                bh.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, ResilienceError>("done")
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let bh = bh.clone();
            tokio::spawn(async move {
                bh.execute(|| async { Ok::<_, ResilienceError>("late") })
                    .await
            })
        };
        tokio::task::yield_now().await;

        bh.dispose();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ResilienceError::Disposed { component: "bulkhead" }));

        // In-flight work still completes
        assert_eq!(holder.await.unwrap().unwrap(), "done");

        let err = bh
            .execute(|| async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Disposed { .. }));
    }
}

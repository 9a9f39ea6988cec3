//! Structured resilience events
//!
//! Every policy reports what it does through an [`EventSink`]. The sink defaults to
//! [`NoopSink`], so a pipeline without observability wired in behaves exactly like
//! one with it. Sinks run inline on the caller's task and must not block.
//!
//! Policies also log through `tracing` directly; events exist so that behavior
//! (retry counts, slow permits, transitions) can be asserted on and forwarded
//! to other systems.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::policy::CircuitState;

/// Events emitted by the resilience policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A transient failure will be retried after `delay_ms`
    RetryScheduled {
        /// Zero-based attempt that failed
        attempt: u32,
        /// Total attempts allowed (`max_retries + 1`)
        max_attempts: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The operation succeeded after at least one retry
    RetrySucceeded {
        /// Attempts made, including the successful one
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// All attempts failed
    RetriesExhausted {
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The circuit breaker changed state
    CircuitStateChanged {
        from: CircuitState,
        to: CircuitState,
        timestamp: DateTime<Utc>,
    },

    /// The circuit breaker rejected a call
    CircuitRejected {
        next_attempt_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A caller waited longer than the bulkhead's warning threshold for a permit
    BulkheadSlowAcquire {
        waited_ms: u64,
        available: usize,
        max_concurrency: usize,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline call was served from the cache
    CacheHit {
        key: String,
        timestamp: DateTime<Utc>,
    },
}

impl ResilienceEvent {
    /// Get the timestamp for this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RetryScheduled { timestamp, .. } => *timestamp,
            Self::RetrySucceeded { timestamp, .. } => *timestamp,
            Self::RetriesExhausted { timestamp, .. } => *timestamp,
            Self::CircuitStateChanged { timestamp, .. } => *timestamp,
            Self::CircuitRejected { timestamp, .. } => *timestamp,
            Self::BulkheadSlowAcquire { timestamp, .. } => *timestamp,
            Self::CacheHit { timestamp, .. } => *timestamp,
        }
    }

    /// Short name of the event, matching its serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RetrySucceeded { .. } => "retry_succeeded",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::CircuitStateChanged { .. } => "circuit_state_changed",
            Self::CircuitRejected { .. } => "circuit_rejected",
            Self::BulkheadSlowAcquire { .. } => "bulkhead_slow_acquire",
            Self::CacheHit { .. } => "cache_hit",
        }
    }
}

/// Receiver of resilience events
///
/// Implementations are called synchronously from the policies and must be cheap.
pub trait EventSink: Send + Sync {
    /// Record an event
    fn record(&self, event: ResilienceEvent);
}

/// Shared handle to an event sink
pub type SharedEventSink = Arc<dyn EventSink>;

/// A sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: ResilienceEvent) {}
}

/// The default sink used when none is configured
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopSink)
}

/// A sink that writes every event as a structured `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ResilienceEvent) {
        match &event {
            ResilienceEvent::RetryScheduled {
                attempt,
                max_attempts,
                delay_ms,
                error,
                ..
            } => warn!(attempt, max_attempts, delay_ms, %error, "resilience event: retry scheduled"),
            ResilienceEvent::RetrySucceeded { attempts, .. } => {
                info!(attempts, "resilience event: retry succeeded")
            }
            ResilienceEvent::RetriesExhausted {
                attempts, error, ..
            } => error!(attempts, %error, "resilience event: retries exhausted"),
            ResilienceEvent::CircuitStateChanged { from, to, .. } => {
                info!(%from, %to, "resilience event: circuit state changed")
            }
            ResilienceEvent::CircuitRejected {
                next_attempt_at, ..
            } => debug!(%next_attempt_at, "resilience event: circuit rejected call"),
            ResilienceEvent::BulkheadSlowAcquire {
                waited_ms,
                available,
                max_concurrency,
                ..
            } => warn!(
                waited_ms,
                available, max_concurrency, "resilience event: slow bulkhead acquire"
            ),
            ResilienceEvent::CacheHit { key, .. } => {
                debug!(%key, "resilience event: cache hit")
            }
        }
    }
}

/// A sink that keeps every event in memory
///
/// Useful in tests and for diagnostics endpoints.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl RecordingSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Total number of recorded events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events were recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop all recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: ResilienceEvent) {
        self.events.lock().push(event);
    }
}

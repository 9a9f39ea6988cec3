//! Circuit breaker
//!
//! All state lives behind one `parking_lot` mutex owned by the breaker instance.
//! The gate check (including Open -> HalfOpen) and outcome recording each take the
//! lock once; the protected call itself runs outside it.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::duration_millis;
use crate::error::{ConfigError, ResilienceError};
use crate::events::{noop_sink, ResilienceEvent, SharedEventSink};

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Retry hint given to callers turned away while the half-open trial runs
const TRIAL_IN_FLIGHT_RETRY_HINT: Duration = Duration::from_secs(1);

/// Stand-in deadline for a recovery timeout the clock cannot represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected until the recovery timeout elapses
    Open,

    /// Probing recovery - a single trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  recovery timeout  ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ─────────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                    └──────────┘
///      ▲                               ▲        trial failure         │
///      │                               └──────────────────────────────┤
///      │                    trial success                             │
///      └──────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use resilience_pipeline::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_recovery_timeout(Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call is allowed
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout (time before a trial call after opening)
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "recovery_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A state change published on [`CircuitBreaker::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the next call may become the trial; set only while `Open`
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    pub trial_in_flight: bool,
}

/// Outcomes that may count as a failure of the protected dependency
pub trait TripsBreaker {
    /// Whether this error should be recorded as a breaker failure
    fn trips_breaker(&self) -> bool;
}

impl TripsBreaker for ResilienceError {
    fn trips_breaker(&self) -> bool {
        self.is_dependency_failure()
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
    disposed: bool,
}

/// Fail-fast gate in front of an unreliable dependency
///
/// Share one instance per dependency (typically behind an `Arc`).
///
/// # Example
///
/// ```
/// use resilience_pipeline::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())?;
/// let mut transitions = breaker.subscribe();
///
/// let balance = breaker
///     .execute(|| async { Ok::<_, ResilienceError>(1_250u64) })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    transitions: broadcast::Sender<CircuitTransition>,
    sink: SharedEventSink,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker, validating the configuration
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_attempt: None,
                trial_in_flight: false,
                disposed: false,
            }),
            transitions,
            sink: noop_sink(),
        })
    }

    /// Set the event sink
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    ///
    /// An open circuit whose recovery timeout has elapsed still reports `Open`
    /// until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Subscribe to state transitions
    ///
    /// Transitions are published without waiting for receivers; a receiver that
    /// falls more than 64 transitions behind observes `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Snapshot of counters and timing
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt.map(wall_clock),
            recovery_timeout: self.config.recovery_timeout,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Force the breaker back to `Closed` and clear its failure count
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            inner.next_attempt = None;
            inner.trial_in_flight = false;
            self.transition(&mut inner, CircuitState::Closed)
        };
        info!("Circuit breaker manually reset");
        self.publish(transition);
    }

    /// Reject every later call with [`ResilienceError::Disposed`]
    pub fn dispose(&self) {
        self.inner.lock().disposed = true;
        debug!("Circuit breaker disposed");
    }

    /// Pass the gate, or fail fast
    ///
    /// The returned permit must be resolved with [`CircuitPermit::success`] or
    /// [`CircuitPermit::failure`]; dropping it unresolved records nothing and frees
    /// the half-open trial slot.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, ResilienceError> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return Err(ResilienceError::Disposed {
                    component: "circuit breaker",
                });
            }

            let now = Instant::now();
            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => match inner.next_attempt {
                    Some(next) if now < next => (Err(next), None),
                    _ => {
                        inner.trial_in_flight = true;
                        inner.next_attempt = None;
                        let transition = self.transition(&mut inner, CircuitState::HalfOpen);
                        (Ok(true), transition)
                    }
                },
                CircuitState::HalfOpen if inner.trial_in_flight => (
                    Err(now + TRIAL_IN_FLIGHT_RETRY_HINT.min(self.config.recovery_timeout)),
                    None,
                ),
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    (Ok(true), None)
                }
            }
        };
        self.publish(transition);

        match result {
            Ok(trial) => {
                if trial {
                    debug!("Circuit breaker admitting trial call");
                }
                Ok(CircuitPermit {
                    breaker: self,
                    trial,
                    resolved: false,
                })
            }
            Err(next) => {
                let retry_after = next.saturating_duration_since(Instant::now());
                let next_attempt_at = wall_clock(next);
                debug!(%next_attempt_at, "Circuit breaker rejected call");
                self.sink.record(ResilienceEvent::CircuitRejected {
                    next_attempt_at,
                    timestamp: Utc::now(),
                });
                Err(ResilienceError::CircuitOpen {
                    next_attempt_at,
                    retry_after,
                })
            }
        }
    }

    /// Run `op` through the breaker
    ///
    /// Only errors for which [`TripsBreaker::trips_breaker`] is true count as
    /// failures. Rejections and cancellations pass through unrecorded.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TripsBreaker + From<ResilienceError>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if err.trips_breaker() {
                    permit.failure();
                }
                Err(err)
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            if trial {
                inner.trial_in_flight = false;
                if inner.state == CircuitState::HalfOpen {
                    inner.next_attempt = None;
                    self.transition(&mut inner, CircuitState::Closed)
                } else {
                    None
                }
            } else {
                None
            }
        };
        if transition.is_some() {
            info!("Circuit breaker closed after successful trial");
        }
        self.publish(transition);
    }

    fn record_failure(&self, trial: bool) {
        let (transition, failures) = {
            let mut inner = self.inner.lock();
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure_at = Some(Utc::now());
            if trial {
                inner.trial_in_flight = false;
            }

            let trips = match inner.state {
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::HalfOpen => trial,
                CircuitState::Open => false,
            };
            let transition = if trips {
                inner.next_attempt = Some(recovery_deadline(self.config.recovery_timeout));
                self.transition(&mut inner, CircuitState::Open)
            } else {
                None
            };
            (transition, inner.failure_count)
        };

        if transition.is_some() {
            error!(
                failures,
                threshold = self.config.failure_threshold,
                recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        } else {
            debug!(failures, "Circuit breaker recorded failure");
        }
        self.publish(transition);
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
        debug!("Circuit breaker trial abandoned");
    }

    /// Apply a state change while holding the lock
    fn transition(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
    ) -> Option<CircuitTransition> {
        if inner.state == to {
            return None;
        }
        let transition = CircuitTransition {
            from: inner.state,
            to,
            at: Utc::now(),
        };
        inner.state = to;
        // Sending never blocks; no receivers is fine
        let _ = self.transitions.send(transition);
        Some(transition)
    }

    /// Report a transition to logs and the event sink, outside the lock
    fn publish(&self, transition: Option<CircuitTransition>) {
        if let Some(t) = transition {
            info!(from = %t.from, to = %t.to, "Circuit breaker state changed");
            self.sink.record(ResilienceEvent::CircuitStateChanged {
                from: t.from,
                to: t.to,
                timestamp: t.at,
            });
        }
    }
}

/// Admission through a [`CircuitBreaker`] gate
#[must_use = "resolve the permit with success() or failure()"]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial);
    }

    /// Record a failed call
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

fn recovery_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

fn wall_clock(at: Instant) -> DateTime<Utc> {
    let remaining = at.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

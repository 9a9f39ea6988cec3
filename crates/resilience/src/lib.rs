//! # Resilience Pipeline
//!
//! Fault-tolerance policies for calls to an unreliable remote dependency.
//!
//! ## Features
//!
//! - **Retries**: exponential backoff with ±25% jitter and a delay cap; failures carry
//!   an explicit [`FailureKind`] deciding retryability
//! - **Circuit breaker**: Closed/Open/HalfOpen state machine with a single trial call,
//!   transitions published on a broadcast channel
//! - **Bulkhead**: bounded concurrency with permits released on every exit path
//! - **Pipeline**: the three composed in a fixed order, with cache-aside and an
//!   optional [`RateLimiter`] hook
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Pipeline                             │
//! │  (cache-aside, rate limiter admit / record outcome)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Bulkhead                             │
//! │  (max_concurrency permits, waits are cancellable)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CircuitBreaker                          │
//! │  (fail fast while open, one trial call when half-open)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RetryExecutor                           │
//! │  (max_retries + 1 attempts, backoff observes cancellation)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use resilience_pipeline::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline: Pipeline<String> = Pipeline::new(PipelineConfig::from_env()?)?;
//! let cancel = CancellationToken::new();
//!
//! let status = pipeline
//!     .execute(
//!         |_cancel| async {
//!             // call the exchange here
//!             Ok::<_, OperationError>("NORMAL".to_string())
//!         },
//!         &cancel,
//!         Some(CacheOptions::new("system:status")),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;

pub use config::{PipelineConfig, DEFAULT_CACHE_TTL};
pub use error::{ConfigError, ErrorKind, FailureKind, OperationError, ResilienceError};
pub use events::{
    noop_sink, EventSink, NoopSink, RecordingSink, ResilienceEvent, SharedEventSink,
    TracingSink,
};
pub use pipeline::{CacheOptions, Pipeline, PipelineBuilder};
pub use policy::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
    CircuitPermit, CircuitState, CircuitTransition, RetryConfig, RetryExecutor, TripsBreaker,
};
pub use rate_limit::{RateLimiter, SlidingWindowConfig, SlidingWindowRateLimiter};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::error::{ErrorKind, FailureKind, OperationError, ResilienceError};
    pub use crate::events::{EventSink, ResilienceEvent, TracingSink};
    pub use crate::pipeline::{CacheOptions, Pipeline, PipelineBuilder};
    pub use crate::policy::{
        Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
        RetryConfig, RetryExecutor,
    };
    pub use crate::rate_limit::{RateLimiter, SlidingWindowConfig, SlidingWindowRateLimiter};
    pub use tokio_util::sync::CancellationToken;
}

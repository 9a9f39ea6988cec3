//! Fault-tolerance policies
//!
//! Each policy is usable on its own; [`Pipeline`](crate::Pipeline) composes them.

mod bulkhead;
mod circuit_breaker;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitPermit, CircuitState,
    CircuitTransition, TripsBreaker,
};
pub use retry::{RetryConfig, RetryExecutor};

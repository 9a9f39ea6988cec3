//! Rate limiter hook
//!
//! The pipeline asks a [`RateLimiter`] to admit every non-cached call before the
//! bulkhead, and reports the outcome afterwards. Limiters are external
//! collaborators; [`SlidingWindowRateLimiter`] is an in-process implementation.

mod sliding_window;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ResilienceError;

pub use sliding_window::{SlidingWindowConfig, SlidingWindowRateLimiter};

/// Admission control by request rate
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until the call may proceed
    ///
    /// Must return [`ResilienceError::Cancelled`] promptly once `cancel` fires.
    async fn admit(&self, cancel: &CancellationToken) -> Result<(), ResilienceError>;

    /// The admitted call succeeded
    fn record_success(&self);

    /// The admitted call failed
    fn record_failure(&self);
}

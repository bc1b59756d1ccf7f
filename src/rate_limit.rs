//! Outbound rate limiting.
//!
//! The executor only sees [`RateLimiter`]: an async gate that either grants a
//! permit or reports cancellation. [`TokenBucket`] is the default in-process
//! implementation.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

// Longest interval honoured; larger values would overflow `Instant`.
const MAX_INTERVAL: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Returned when a permit wait is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

/// Gate consulted before every call.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Waits until a permit is available or `cancel` fires.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled>;
}

#[async_trait]
impl<T> RateLimiter for Arc<T>
where
    T: RateLimiter + ?Sized,
{
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        (**self).acquire(cancel).await
    }
}

/// Token bucket granting one permit every `interval`, with up to `burst`
/// permits available at once.
///
/// Permits are reserved in arrival order under a short lock; waiting happens
/// outside the lock, so concurrent callers queue fairly. A cancelled wait
/// hands its reservation back when no later caller has reserved after it.
#[derive(Debug)]
pub struct TokenBucket {
    interval: Duration,
    tolerance: Duration,
    // Theoretical arrival time of the next permit.
    next_free: Mutex<Option<Instant>>,
}

impl TokenBucket {
    /// A zero `burst` is treated as 1. A zero `interval` never blocks;
    /// intervals above 30 years are capped.
    pub fn new(interval: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        let interval = interval.min(MAX_INTERVAL);
        Self {
            interval,
            tolerance: interval.saturating_mul(burst - 1),
            next_free: Mutex::new(None),
        }
    }

    /// Reserves the next permit, returning when it may be used and the
    /// reservation marker.
    fn reserve(&self, now: Instant) -> (Instant, Instant) {
        let mut next_free = self
            .next_free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let theoretical = next_free.map_or(now, |at| at.max(now));
        let ready_at = theoretical
            .checked_sub(self.tolerance)
            .map_or(now, |at| at.max(now));
        let reserved = theoretical
            .checked_add(self.interval)
            .unwrap_or(theoretical);
        *next_free = Some(reserved);
        (ready_at, reserved)
    }

    fn release(&self, reserved: Instant) {
        let mut next_free = self
            .next_free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *next_free == Some(reserved) {
            *next_free = reserved.checked_sub(self.interval);
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let (ready_at, reserved) = self.reserve(Instant::now());
        if ready_at <= Instant::now() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.release(reserved);
                Err(Cancelled)
            }
            _ = sleep_until(ready_at) => Ok(()),
        }
    }
}

//! Retry/backoff decisions for 5xx responses.
//!
//! A call starts at attempt 1. After each exchange [`RetryPolicy::next`]
//! decides whether the call succeeded, must be retried after a wait, or has
//! exhausted its budget. Only server errors (`500..=599`) are retried.

use std::time::Duration;

use reqwest::{
    header::{HeaderName, HeaderValue},
    StatusCode,
};
use tokio_util::sync::CancellationToken;

/// Header carrying the number of the attempt that just failed, stamped on
/// every attempt after the first.
pub const RETRY_HEADER: &str = "x-retry";

/// Growth factor applied to the base backoff per attempt.
pub const BACKOFF_COEFFICIENT: f64 = 1.5;

// 1.5^64 already exceeds any sensible wait; larger exponents only risk
// float overflow.
const MAX_BACKOFF_EXPONENT: usize = 64;

/// What to do after an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The response is final and returned as-is.
    Success,
    /// Wait, stamp the retry marker and send attempt `next_attempt`.
    Retry { next_attempt: usize, wait: Duration },
    /// Still a server error and no retries left.
    Exhausted,
}

/// Retry budget and base backoff of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: usize,
    base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base: Duration) -> Self {
        Self { max_retries, base }
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Wait applied after a failed `attempt`: `base × 1.5^attempt`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT) as i32;
        let secs = self.base.as_secs_f64() * BACKOFF_COEFFICIENT.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Sum of every backoff wait a fully exhausted call goes through.
    ///
    /// Useful for sizing caller-side deadlines.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(self.backoff(attempt))
        })
    }

    /// Decides the transition after `attempt` produced `status`.
    pub fn next(&self, attempt: usize, status: StatusCode) -> Transition {
        if !status.is_server_error() {
            return Transition::Success;
        }
        if attempt <= self.max_retries {
            Transition::Retry {
                next_attempt: attempt + 1,
                wait: self.backoff(attempt),
            }
        } else {
            Transition::Exhausted
        }
    }
}

/// Sets the retry marker on the wire request, replacing any previous value.
pub(crate) fn stamp_retry_marker(request: &mut reqwest::Request, attempt: usize) {
    request.headers_mut().insert(
        HeaderName::from_static(RETRY_HEADER),
        HeaderValue::from(attempt),
    );
}

/// Sleeps for `wait` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub(crate) async fn backoff_sleep(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

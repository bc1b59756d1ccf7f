//! `resilient-http` is an async HTTP request executor that does not lose
//! requests.
//!
//! Requests are described with [`Request`] and sent with
//! [`ResilientClient::execute`]. Each call:
//! - waits for a permit when a [`RateLimiter`] is configured,
//! - retries `5xx` responses with exponential backoff (`base × 1.5^attempt`),
//!   stamping the `X-Retry` header on every retry,
//! - hands requests that still fail after the last retry to a
//!   [`DeadLetterSink`] as a [`Letter`].
//!
//! Connection-level failures are never retried.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use resilient_http::{MemoryDeadLetter, ResilientClient};
//!
//! # async fn run() -> resilient_http::Result<()> {
//! let client = ResilientClient::new("http://localhost:3000")
//!     .with_retry(3, Duration::from_millis(200))
//!     .with_rate_limit(Duration::from_millis(50), 10)
//!     .with_dead_letter(MemoryDeadLetter::new());
//!
//! let request = client
//!     .request()
//!     .path_args("/orders/{}", &[&1231])
//!     .add_query("clientId", "1231321");
//! let response = client.execute(&request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod decode;
mod error;
mod letter;
mod options;
pub mod rate_limit;
mod request;
pub mod retry;
mod transport;

pub use client::ResilientClient;
pub use error::{BoxError, ResilientError};
pub use letter::{DeadLetterSink, Letter, MemoryDeadLetter};
pub use options::ClientOptions;
pub use rate_limit::{RateLimiter, TokenBucket};
pub use request::{Mutator, Request, Values};
pub use retry::{RetryPolicy, RETRY_HEADER};
pub use transport::Transport;

/// Re-exported so callers can cancel calls without a direct dependency.
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, ResilientError>;

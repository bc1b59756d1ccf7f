use std::{fmt, sync::Arc, time::Duration};

use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    decode,
    error::BoxError,
    letter::{DeadLetterSink, Letter},
    rate_limit::{RateLimiter, TokenBucket},
    retry::{self, RetryPolicy, Transition},
    transport::Transport,
    ClientOptions, Request, ResilientError, Result,
};

const HOST_VAR: &str = "RESILIENT_HTTP_HOST";

/// How the retry loop ended when no error was raised.
enum Outcome {
    Success(reqwest::Response),
    Exhausted(reqwest::Response),
}

#[derive(Clone)]
/// HTTP client that retries server errors and records exhausted requests.
///
/// Configuration is fixed once built; clones share the transport, dead-letter
/// sink and rate limiter, so one client can serve many concurrent calls.
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    host: String,
    options: ClientOptions,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("host", &self.host)
            .field("options", &self.options)
            .field("dead_letter", &self.dead_letter.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .finish()
    }
}

impl ResilientClient {
    /// Creates a client for `host` backed by a default `reqwest::Client`,
    /// with 3 retries, 1 s base backoff, no dead letter and no rate limit.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            transport: Arc::new(reqwest::Client::new()),
            host: host.into(),
            options: ClientOptions::default(),
            dead_letter: None,
            rate_limiter: None,
        }
    }

    /// Creates a client from environment variables.
    ///
    /// Reads `RESILIENT_HTTP_HOST` (required) plus the optional keys read by
    /// [`ClientOptions::from_env`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use resilient_http::ResilientClient;
    ///
    /// let client = ResilientClient::from_env().expect("missing RESILIENT_HTTP_HOST");
    /// ```
    pub fn from_env() -> std::result::Result<Self, String> {
        let host = std::env::var(HOST_VAR)
            .map_err(|_| format!("missing {HOST_VAR} environment variable"))?;
        if host.trim().is_empty() {
            return Err(format!("{HOST_VAR} is set but empty"));
        }
        let options = ClientOptions::from_env()?;
        Ok(Self::new(host.trim()).with_options(options))
    }

    /// Applies client options such as timeout and retry behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    /// Sets the retry budget and the base backoff interval.
    pub fn with_retry(mut self, max_retries: usize, interval: Duration) -> Self {
        self.options.max_retries = max_retries;
        self.options.retry_backoff_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sends requests through the given `reqwest::Client`.
    pub fn with_http_client(self, http: reqwest::Client) -> Self {
        self.with_transport(http)
    }

    /// Sends requests through a custom transport.
    pub fn with_transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Arc::new(transport);
        self
    }

    /// Records requests that are still failing after every retry.
    pub fn with_dead_letter<S>(mut self, sink: S) -> Self
    where
        S: DeadLetterSink + 'static,
    {
        self.dead_letter = Some(Arc::new(sink));
        self
    }

    /// Limits calls to one every `interval`, with bursts of up to `burst`.
    pub fn with_rate_limit(self, interval: Duration, burst: u32) -> Self {
        self.with_rate_limiter(Arc::new(TokenBucket::new(interval, burst)))
    }

    /// Uses an existing limiter, which may be shared with other clients.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Host given to requests built with [`request`](Self::request).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Options in effect for every call.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Retry budget and backoff derived from the options.
    ///
    /// [`RetryPolicy::total_backoff`] gives the longest time an exhausted
    /// call spends sleeping, useful when sizing caller deadlines.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.options.max_retries, self.options.retry_backoff())
    }

    /// Starts a `GET` request against the client's host.
    pub fn request(&self) -> Request {
        Request::new().host(self.host.clone())
    }

    /// Sends a request, retrying server errors.
    ///
    /// A response that is still a server error after every retry is returned
    /// as `Ok` once it has been handed to the dead-letter sink; callers must
    /// check the status themselves.
    pub async fn execute(&self, request: &Request) -> Result<reqwest::Response> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Same as [`execute`](Self::execute), aborting when `cancel` fires while
    /// waiting for a permit, an exchange or a backoff.
    pub async fn execute_with_cancel(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        if let Some(limiter) = &self.rate_limiter {
            limiter
                .acquire(cancel)
                .await
                .map_err(|_| ResilientError::RateLimitCancelled)?;
        }

        let mut wire = request.materialize(&self.host, Some(self.options.timeout()))?;

        match self.send_with_retry(&mut wire, cancel).await? {
            Outcome::Success(response) => Ok(response),
            Outcome::Exhausted(response) => {
                if let Some(sink) = &self.dead_letter {
                    let letter = Letter::from_wire(&wire);
                    escalate(sink.as_ref(), &letter, response.status()).await?;
                }
                Ok(response)
            }
        }
    }

    /// Sends a request and decodes the full body with `decoder`.
    pub async fn parse<T, D>(&self, request: &Request, decoder: D) -> Result<T>
    where
        D: FnOnce(&[u8]) -> std::result::Result<T, BoxError>,
    {
        let response = self.execute(request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|err| ResilientError::Transport(err.into()))?;
        decoder(&body).map_err(ResilientError::Decode)
    }

    pub async fn parse_json<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        self.parse(request, decode::json::<T>).await
    }

    #[cfg(feature = "xml")]
    pub async fn parse_xml<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        self.parse(request, decode::xml::<T>).await
    }

    /// Sends the request as `GET`, whatever its method, and decodes JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let request = request.clone().method(Method::GET.as_str());
        self.parse_json(&request).await
    }

    /// Sends the request as `GET`, whatever its method, and decodes XML.
    #[cfg(feature = "xml")]
    pub async fn get_xml<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let request = request.clone().method(Method::GET.as_str());
        self.parse_xml(&request).await
    }

    /// Sends `body` as JSON with `POST` and decodes the JSON response.
    pub async fn post_json<B, T>(&self, request: &Request, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = request
            .clone()
            .method(Method::POST.as_str())
            .json_body(body)?;
        self.parse_json(&request).await
    }

    /// Sends `body` as JSON with `PUT` and decodes the JSON response.
    pub async fn put_json<B, T>(&self, request: &Request, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = request
            .clone()
            .method(Method::PUT.as_str())
            .json_body(body)?;
        self.parse_json(&request).await
    }

    async fn send_with_retry(
        &self,
        wire: &mut reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let policy = self.retry_policy();
        let mut attempt = 1usize;
        loop {
            let outgoing = wire.try_clone().ok_or_else(|| {
                ResilientError::InvalidBody("request body cannot be replayed".to_owned())
            })?;

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilientError::Cancelled),
                result = self.transport.exchange(outgoing) => {
                    result.map_err(ResilientError::Transport)?
                }
            };

            match policy.next(attempt, response.status()) {
                Transition::Success => return Ok(Outcome::Success(response)),
                Transition::Exhausted => return Ok(Outcome::Exhausted(response)),
                Transition::Retry { next_attempt, wait } => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        attempt,
                        status = response.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "retrying request after server error"
                    );

                    drop(response);
                    if !retry::backoff_sleep(wait, cancel).await {
                        return Err(ResilientError::Cancelled);
                    }
                    retry::stamp_retry_marker(wire, attempt);
                    attempt = next_attempt;
                }
            }
        }
    }
}

/// Hands the letter of an exhausted call to the sink, once.
async fn escalate(sink: &dyn DeadLetterSink, letter: &Letter, status: StatusCode) -> Result<()> {
    #[cfg(feature = "tracing")]
    tracing::debug!(
        url = %letter.url,
        status = status.as_u16(),
        "retries exhausted, saving dead letter"
    );

    sink.save(letter).await.map_err(|source| {
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %letter.url, error = %source, "dead letter could not be saved");

        ResilientError::DeadLetterPersist {
            status: status.as_u16(),
            source,
        }
    })
}

/// Boxed error produced by pluggable collaborators (transport, sink, decoder).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ResilientError {
    /// The resolved base URL could not be parsed or is not an absolute
    /// `http`/`https` URL with a host.
    #[error("malformed url '{url}': {reason}")]
    MalformedUrl { url: String, reason: String },
    /// The method is not a valid HTTP token.
    #[error("invalid http method '{0}'")]
    InvalidMethod(String),
    /// A header name or value cannot be put on the wire.
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    /// The request body could not be encoded.
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    /// Connection-level failure from the transport. Never retried.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    /// The rate limiter wait was cancelled before a permit was granted.
    #[error("rate limiter wait cancelled")]
    RateLimitCancelled,
    /// The call was cancelled during an exchange or a backoff wait.
    #[error("request cancelled")]
    Cancelled,
    /// Retries were exhausted and the dead-letter sink failed to save the
    /// request. The last response is discarded.
    #[error("letter could not be saved after status {status}: {source}")]
    DeadLetterPersist {
        /// Status code of the discarded final response.
        status: u16,
        /// Error returned by the sink.
        #[source]
        source: BoxError,
    },
    /// Response body decoding failed.
    #[error("decode error: {0}")]
    Decode(#[source] BoxError),
}

impl ResilientError {
    /// Returns `true` for errors raised while turning a descriptor into a
    /// wire request. These are always reported before any network call.
    pub fn is_request_construction(&self) -> bool {
        matches!(
            self,
            Self::MalformedUrl { .. }
                | Self::InvalidMethod(_)
                | Self::InvalidHeader { .. }
                | Self::InvalidBody(_)
        )
    }
}

use std::time::Duration;

const TIMEOUT_MS_VAR: &str = "RESILIENT_HTTP_TIMEOUT_MS";
const MAX_RETRIES_VAR: &str = "RESILIENT_HTTP_MAX_RETRIES";
const RETRY_BACKOFF_MS_VAR: &str = "RESILIENT_HTTP_RETRY_BACKOFF_MS";

/// Configures HTTP timeout and retry behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Base retry backoff in milliseconds, grown by a factor of 1.5 per attempt.
    pub retry_backoff_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

impl ClientOptions {
    /// Reads options from the environment, keeping defaults for unset keys.
    ///
    /// Reads:
    /// - `RESILIENT_HTTP_TIMEOUT_MS`
    /// - `RESILIENT_HTTP_MAX_RETRIES`
    /// - `RESILIENT_HTTP_RETRY_BACKOFF_MS`
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = parse_var(&lookup, TIMEOUT_MS_VAR)? {
            options.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, MAX_RETRIES_VAR)? {
            options.max_retries = value;
        }
        if let Some(value) = parse_var(&lookup, RETRY_BACKOFF_MS_VAR)? {
            options.retry_backoff_ms = value;
        }
        Ok(options)
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> std::result::Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{key} must be a non-negative integer, got '{raw}'")),
    }
}

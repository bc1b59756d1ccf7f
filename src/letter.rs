use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Record of a request that still failed with a server error after every
/// retry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Letter {
    pub method: String,
    /// Fully resolved URL sent on the final attempt.
    pub url: String,
    pub body: Vec<u8>,
    /// Headers as sent on the final attempt, including the retry marker.
    pub headers: BTreeMap<String, Vec<String>>,
}

impl Letter {
    /// Captures the wire request exactly as it was last sent.
    pub(crate) fn from_wire(request: &reqwest::Request) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in request.headers() {
            headers
                .entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            method: request.method().as_str().to_owned(),
            url: request.url().as_str().to_owned(),
            body: request
                .body()
                .and_then(|body| body.as_bytes())
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            headers,
        }
    }
}

/// Destination for letters of exhausted requests.
///
/// `save` is called at most once per exhausted call and never retried.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn save(&self, letter: &Letter) -> Result<(), BoxError>;
}

#[async_trait]
impl<T> DeadLetterSink for Arc<T>
where
    T: DeadLetterSink + ?Sized,
{
    async fn save(&self, letter: &Letter) -> Result<(), BoxError> {
        (**self).save(letter).await
    }
}

/// In-memory sink that keeps every letter it receives.
#[derive(Debug, Default)]
pub struct MemoryDeadLetter {
    letters: Mutex<Vec<Letter>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the letters saved so far.
    pub fn letters(&self) -> Vec<Letter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    /// Removes and returns every saved letter.
    pub fn drain(&self) -> Vec<Letter> {
        self.letters
            .lock()
            .map(|mut letters| std::mem::take(&mut *letters))
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn save(&self, letter: &Letter) -> Result<(), BoxError> {
        self.letters
            .lock()
            .map_err(|_| "dead letter store mutex poisoned")?
            .push(letter.clone());
        Ok(())
    }
}

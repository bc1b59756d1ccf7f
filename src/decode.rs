//! Body decoders accepted by [`ResilientClient::parse`](crate::ResilientClient::parse).
//!
//! A decoder is any `FnOnce(&[u8]) -> Result<T, BoxError>`; these are the
//! ones the typed helpers use.

use serde::de::DeserializeOwned;

use crate::error::BoxError;

/// Decodes a JSON body.
pub fn json<T: DeserializeOwned>(body: &[u8]) -> Result<T, BoxError> {
    serde_json::from_slice(body).map_err(BoxError::from)
}

/// Decodes an XML body.
#[cfg(feature = "xml")]
pub fn xml<T: DeserializeOwned>(body: &[u8]) -> Result<T, BoxError> {
    let text = std::str::from_utf8(body)?;
    quick_xml::de::from_str(text).map_err(BoxError::from)
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;

/// Performs one physical request/response exchange.
///
/// Errors are connection-level failures; HTTP error statuses are returned as
/// responses. The executor never retries a transport error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: reqwest::Request) -> Result<reqwest::Response, BoxError>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn exchange(&self, request: reqwest::Request) -> Result<reqwest::Response, BoxError> {
        self.execute(request).await.map_err(BoxError::from)
    }
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn exchange(&self, request: reqwest::Request) -> Result<reqwest::Response, BoxError> {
        (**self).exchange(request).await
    }
}

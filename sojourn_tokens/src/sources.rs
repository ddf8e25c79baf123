//! Token sources

use std::sync::Arc;

use async_trait::async_trait;

use crate::{RefreshTokenRef, RenewalError, TokenPair};

/// An asynchronous exchange of a refresh token for a new token pair
///
/// Implementations perform exactly one exchange per call and never retry.
/// The [`RefreshCoordinator`](crate::RefreshCoordinator) decides when an
/// exchange happens and bounds it with the request timeout.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchanges `refresh_token` for a newly issued token pair
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, RenewalError>;
}

#[async_trait]
impl<T: TokenExchange + ?Sized> TokenExchange for Arc<T> {
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, RenewalError> {
        (**self).exchange(refresh_token).await
    }
}

#[async_trait]
impl<T: TokenExchange + ?Sized> TokenExchange for Box<T> {
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, RenewalError> {
        (**self).exchange(refresh_token).await
    }
}

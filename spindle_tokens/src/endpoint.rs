//! The authority's token endpoint

use std::{error, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::RefreshTokenRef;

mod dto;
#[cfg(feature = "oauth2")]
mod http;

pub(crate) use dto::Grant;
#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub use http::{ExchangeError, HttpTokenEndpoint};

/// An authority that exchanges a refresh token for a new access token
///
/// Implementations perform the exchange and hand back whatever the authority
/// said. Interpreting the answer is left to the broker, so an implementation
/// only fails when no answer was received at all.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// The error type returned when the authority could not be reached
    type Error: error::Error + Send + Sync + 'static;

    /// Performs a `refresh_token` grant against the authority
    async fn exchange_refresh_token(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<EndpointResponse, Self::Error>;
}

#[async_trait]
impl<T: TokenEndpoint + ?Sized> TokenEndpoint for Arc<T> {
    type Error = T::Error;

    async fn exchange_refresh_token(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<EndpointResponse, Self::Error> {
        (**self).exchange_refresh_token(refresh_token).await
    }
}

/// The raw answer of a token endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointResponse {
    status: u16,
    body: Bytes,
}

impl EndpointResponse {
    /// Constructs a response from an HTTP status and body
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// The HTTP status code
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The response body
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

//! On-demand brokering of OAuth2 access tokens backed by a refresh token
//!
//! Clients of an OAuth2 provider hold a long-lived refresh token and trade it for
//! short-lived access tokens. This crate keeps that trade out of the way of the
//! requests that need a token: a [`TokenBroker`] caches the current access token,
//! refreshes it when it gets close to its expiry, and ensures that callers racing
//! for a new token share a single exchange with the authority.
//!
//! Failures are classified so that callers can tell a revoked session, which needs
//! a human to authenticate again, apart from a flaky network or a busy authority.
//! See [`BrokerError`] for the details, and [`backoff::retry_with_backoff()`] for a
//! way to retry only what is worth retrying.
//!
//! When the authority rotates the refresh token, the new one is handed to the
//! [`RefreshCredentialStore`][store::RefreshCredentialStore] before the new access
//! token is released. A store that fails to persist it will find the session
//! looking revoked once the old refresh token is retired.
//!
//! # Coordination
//!
//! Coalescing of refreshes is per process. Instances in different processes that
//! share a refresh token will each refresh on their own unless they also share an
//! [`AccessCredentialCache`][store::AccessCredentialCache], such as the file-backed
//! [`FileSessionStore`][store::FileSessionStore].
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use spindle_tokens::{endpoint::HttpTokenEndpoint, store::FileSessionStore, ClientId, TokenBroker};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
//! let endpoint = HttpTokenEndpoint::new(
//!     client,
//!     reqwest::Url::parse("https://accounts.spotify.com/api/token")?,
//!     ClientId::from_static("my-client-id"),
//! );
//!
//! let session = Arc::new(FileSessionStore::new("session.json"));
//! let broker = TokenBroker::builder(endpoint, session.clone())
//!     .with_cache("file", session)
//!     .build();
//!
//! let token = broker.get_valid_access_token().await?;
//! tracing::info!(token = format_args!("{:#?}", token), "obtained access token");
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides [`HttpTokenEndpoint`][endpoint::HttpTokenEndpoint], which
//!   performs the `refresh_token` grant over HTTPS.
//! * `file`: Provides [`FileSessionStore`][store::FileSessionStore], which keeps the
//!   session in a local file.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
mod broker;
pub mod endpoint;
mod error;
pub mod store;
mod tokens;

pub use braids::*;
pub use broker::{
    AccessTokenProvider, BrokerConfig, BrokerStatus, CredentialSummary, TokenBroker,
    TokenBrokerBuilder,
};
pub use endpoint::{EndpointResponse, TokenEndpoint};
pub use error::{BrokerError, ErrorKind, ExchangeInterrupted, SharedError};
pub use tokens::{AccessCredential, TokenLifetimeConfig, TokenStatus};

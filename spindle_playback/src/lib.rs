//! Now-playing lookups authorized by a token broker
//!
//! A [`NowPlayingFetcher`] asks a music provider which track a user is playing.
//! Access tokens are obtained from an [`AccessTokenProvider`], normally a
//! [`TokenBroker`], and attached as a bearer token marked sensitive so that it
//! stays out of logs.
//!
//! Providers sometimes reject a token before it was due to expire. When that
//! happens the fetcher invalidates the token and retries once with a freshly
//! refreshed one. A second rejection is reported as [`AuthFailure::Stale`]
//! rather than retried again.
//!
//! Results keep "nothing is playing" and "the credentials are broken" apart:
//! the former is `Ok(None)`, the latter a [`FetchError`]. Whether end users get
//! to see the difference is up to the [`AuthFailurePolicy`] used when building a
//! [`NowPlayingReport`].
//!
//! ```no_run
//! use spindle_playback::{NowPlayingReport, ProviderSettings};
//! use spindle_tokens::{store::StaticRefreshCredential, ClientId, RefreshToken};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ProviderSettings::new(ClientId::from_static("my-client-id"));
//! let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
//!
//! let store = StaticRefreshCredential::new(RefreshToken::from_static("my-refresh-token"));
//! let broker = settings.broker(client.clone(), store)?;
//! let fetcher = settings.fetcher(client, broker)?;
//!
//! let report = NowPlayingReport::from_result(
//!     fetcher.fetch_currently_playing().await,
//!     settings.auth_failure_policy,
//! );
//! println!("{}", serde_json::to_string(&report)?);
//! # Ok(())
//! # }
//! ```
//!
//! [`AccessTokenProvider`]: spindle_tokens::AccessTokenProvider
//! [`TokenBroker`]: spindle_tokens::TokenBroker

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

mod fetcher;
mod report;
mod settings;
mod track;

pub use fetcher::{
    AuthFailure, FetchError, NowPlayingFetcher, DEFAULT_FETCH_TIMEOUT,
    SPOTIFY_CURRENTLY_PLAYING_URL,
};
pub use report::{AuthFailurePolicy, NowPlayingReport};
pub use settings::{
    BrokerSettings, FetcherSettings, ProviderSettings, SettingsError, SPOTIFY_TOKEN_URL,
};
pub use track::Track;

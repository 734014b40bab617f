//! Provider settings and wiring

use std::time::Duration;

use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use spindle_clock::DurationSecs;
use spindle_tokens::{
    endpoint::HttpTokenEndpoint, store::RefreshCredentialStore, AccessTokenProvider, BrokerConfig,
    ClientId, ClientSecret, TokenBroker, TokenLifetimeConfig,
};
use thiserror::Error;
use url::Url;

use crate::{fetcher::SPOTIFY_CURRENTLY_PLAYING_URL, AuthFailurePolicy, NowPlayingFetcher};

/// Spotify's token endpoint
pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Everything needed to talk to a music provider on a user's behalf
///
/// Settings deserialize from any serde format; everything but the client ID has
/// a default suitable for Spotify.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderSettings {
    /// The authority's token endpoint
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// The registered client ID
    pub client_id: ClientId,
    /// The client secret, for confidential clients
    #[serde(default)]
    pub client_secret: Option<ClientSecret>,
    /// How tokens are refreshed
    #[serde(default)]
    pub broker: BrokerSettings,
    /// How playback is looked up
    #[serde(default)]
    pub fetcher: FetcherSettings,
    /// What to report when a lookup cannot be authorized
    #[serde(default)]
    pub auth_failure_policy: AuthFailurePolicy,
}

fn default_token_url() -> String {
    SPOTIFY_TOKEN_URL.to_owned()
}

/// Token refresh settings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// How long before the reported expiry a token stops being used
    pub safety_margin_secs: u64,
    /// The minimum time between two refresh attempts
    pub min_refresh_interval_secs: u64,
    /// How long the authority has to answer a refresh
    pub exchange_timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: 60,
            min_refresh_interval_secs: 2,
            exchange_timeout_secs: 10,
        }
    }
}

impl From<BrokerSettings> for BrokerConfig {
    fn from(settings: BrokerSettings) -> Self {
        BrokerConfig::default()
            .with_lifetime(TokenLifetimeConfig::new(DurationSecs(settings.safety_margin_secs)))
            .with_min_refresh_interval(DurationSecs(settings.min_refresh_interval_secs))
            .with_exchange_timeout(Duration::from_secs(settings.exchange_timeout_secs))
    }
}

/// Playback lookup settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    /// The currently-playing endpoint
    pub currently_playing_url: String,
    /// How long a lookup may take
    pub timeout_secs: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            currently_playing_url: SPOTIFY_CURRENTLY_PLAYING_URL.to_owned(),
            timeout_secs: 5,
        }
    }
}

/// Settings that cannot be put to use
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A URL could not be parsed
    #[error("invalid {name} URL `{url}`")]
    InvalidUrl {
        /// Which URL was invalid
        name: &'static str,
        /// The offending value
        url: String,
        /// Why it was invalid
        #[source]
        source: url::ParseError,
    },
}

fn parse_url(name: &'static str, url: &str) -> Result<Url, SettingsError> {
    Url::parse(url).map_err(|source| SettingsError::InvalidUrl {
        name,
        url: url.to_owned(),
        source,
    })
}

impl ProviderSettings {
    /// Settings for `client_id` with every other value at its default
    pub fn new(client_id: ClientId) -> Self {
        Self {
            token_url: default_token_url(),
            client_id,
            client_secret: None,
            broker: BrokerSettings::default(),
            fetcher: FetcherSettings::default(),
            auth_failure_policy: AuthFailurePolicy::default(),
        }
    }

    /// Sets the client secret
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Builds the token endpoint described by these settings
    pub fn token_endpoint(
        &self,
        client: ClientWithMiddleware,
    ) -> Result<HttpTokenEndpoint, SettingsError> {
        let token_url = parse_url("token", &self.token_url)?;
        let endpoint = HttpTokenEndpoint::new(client, token_url, self.client_id.clone());
        Ok(match &self.client_secret {
            Some(secret) => endpoint.with_client_secret(secret.clone()),
            None => endpoint,
        })
    }

    /// Builds a broker that refreshes tokens held by `store`
    pub fn broker<S>(
        &self,
        client: ClientWithMiddleware,
        store: S,
    ) -> Result<TokenBroker<HttpTokenEndpoint, S>, SettingsError>
    where
        S: RefreshCredentialStore,
    {
        Ok(TokenBroker::builder(self.token_endpoint(client)?, store)
            .with_config(self.broker.into())
            .build())
    }

    /// Builds a fetcher that authorizes its lookups with `provider`
    pub fn fetcher<P>(
        &self,
        client: ClientWithMiddleware,
        provider: P,
    ) -> Result<NowPlayingFetcher<P>, SettingsError>
    where
        P: AccessTokenProvider,
    {
        let url = parse_url("currently-playing", &self.fetcher.currently_playing_url)?;
        Ok(NowPlayingFetcher::new(provider, client, url)
            .with_timeout(Duration::from_secs(self.fetcher.timeout_secs)))
    }
}

#[cfg(test)]
mod tests {
    use spindle_tokens::store::StaticRefreshCredential;

    use super::*;

    fn client() -> ClientWithMiddleware {
        reqwest_middleware::ClientBuilder::new(reqwest::Client::default()).build()
    }

    #[test]
    fn only_the_client_id_is_required() {
        let settings: ProviderSettings =
            serde_json::from_str(r#"{"client_id": "client-1"}"#).unwrap();

        assert_eq!(settings.token_url, SPOTIFY_TOKEN_URL);
        assert_eq!(settings.client_id.as_str(), "client-1");
        assert!(settings.client_secret.is_none());
        assert_eq!(settings.broker, BrokerSettings::default());
        assert_eq!(settings.fetcher.currently_playing_url, SPOTIFY_CURRENTLY_PLAYING_URL);
        assert_eq!(settings.auth_failure_policy, AuthFailurePolicy::Surface);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let settings: ProviderSettings = serde_json::from_str(
            r#"{
                "client_id": "client-1",
                "client_secret": "s3cr3t",
                "broker": { "min_refresh_interval_secs": 5 },
                "auth_failure_policy": "degrade"
            }"#,
        )
        .unwrap();

        let config = BrokerConfig::from(settings.broker);
        assert_eq!(config.min_refresh_interval(), DurationSecs(5));
        assert_eq!(config.lifetime().safety_margin(), DurationSecs(60));
        assert_eq!(config.exchange_timeout(), Duration::from_secs(10));
        assert_eq!(settings.auth_failure_policy, AuthFailurePolicy::Degrade);
        assert!(!format!("{:?}", settings).contains("s3cr3t"));
    }

    #[test]
    fn defaults_wire_up_a_broker_and_fetcher() {
        let settings = ProviderSettings::new(ClientId::from_static("client-1"));

        let broker = settings
            .broker(client(), StaticRefreshCredential::empty())
            .unwrap();
        assert!(settings.fetcher(client(), broker).is_ok());
    }

    #[test]
    fn invalid_url_is_reported() {
        let mut settings = ProviderSettings::new(ClientId::from_static("client-1"));
        settings.token_url = "not a url".to_owned();

        let err = settings.token_endpoint(client()).unwrap_err();
        assert_eq!(err.to_string(), "invalid token URL `not a url`");
    }
}

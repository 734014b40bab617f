//! Looking up what is currently playing

use std::{error, time::Duration};

use bytes::{BufMut, BytesMut};
use reqwest::{header, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use spindle_tokens::{AccessTokenProvider, AccessTokenRef, BrokerError};
use thiserror::Error;
use url::Url;

use crate::track::{PlaybackState, Track};

/// Spotify's currently-playing endpoint
pub const SPOTIFY_CURRENTLY_PLAYING_URL: &str =
    "https://api.spotify.com/v1/me/player/currently-playing";

/// How long a playback lookup may take unless configured otherwise
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// A failure to look up what is currently playing
///
/// Downstream hiccups are not failures: they are logged and reported as nothing
/// playing. Only authorization problems surface here, so that callers never
/// confuse "nothing is playing" with "the credentials are broken".
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The request could not be authorized
    #[error("unable to authorize the playback request")]
    Auth(#[from] AuthFailure),
}

impl FetchError {
    /// The authorization failure behind this error
    pub fn auth_failure(&self) -> &AuthFailure {
        match self {
            Self::Auth(failure) => failure,
        }
    }
}

/// Why a playback request could not be authorized
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum AuthFailure {
    /// No valid access token could be obtained
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The provider rejected an access token that was refreshed just for this request
    #[error("provider rejected a freshly refreshed access token")]
    Stale,
    /// The access token contains bytes that cannot be sent in a header
    #[error("access token cannot be sent as a header value")]
    MalformedToken,
}

impl AuthFailure {
    /// A short, stable name for this failure
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker(err) => err.kind().as_str(),
            Self::Stale => "stale_credential",
            Self::MalformedToken => "malformed_token",
        }
    }

    /// Whether a human must authenticate again before requests can succeed
    pub fn needs_reauthentication(&self) -> bool {
        match self {
            Self::Broker(err) => !err.is_retryable(),
            Self::Stale | Self::MalformedToken => false,
        }
    }

    /// Whether a later attempt might succeed on its own
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(err) => err.is_retryable(),
            Self::Stale | Self::MalformedToken => true,
        }
    }

    /// The minimum delay before trying again, if the broker asked for one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Broker(err) => err.retry_after(),
            Self::Stale | Self::MalformedToken => None,
        }
    }
}

/// Looks up the track a user is currently playing
///
/// Access tokens come from an [`AccessTokenProvider`], typically a
/// [`TokenBroker`][spindle_tokens::TokenBroker]. If the provider rejects a token
/// the fetcher invalidates it and tries once more with a fresh one.
#[derive(Debug)]
pub struct NowPlayingFetcher<P> {
    provider: P,
    client: ClientWithMiddleware,
    url: Url,
    timeout: Duration,
}

enum Attempt {
    Answered(Option<Track>),
    Unauthorized,
}

impl<P> NowPlayingFetcher<P> {
    /// Constructs a fetcher that queries `url`
    pub fn new(provider: P, client: ClientWithMiddleware, url: Url) -> Self {
        Self {
            provider,
            client,
            url,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Sets how long a single playback request may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The source of access tokens
    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P> NowPlayingFetcher<P>
where
    P: AccessTokenProvider,
{
    /// Gets the track that is currently playing
    ///
    /// Returns `None` when nothing is playing, when playback is paused, and when
    /// the provider could not be reached or answered unexpectedly.
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch_currently_playing(&self) -> Result<Option<Track>, FetchError> {
        if let Attempt::Answered(track) = self.attempt().await? {
            return Ok(track);
        }

        tracing::debug!("provider rejected access token, forcing a refresh");
        self.provider.invalidate();

        match self.attempt().await? {
            Attempt::Answered(track) => Ok(track),
            Attempt::Unauthorized => {
                tracing::warn!("provider rejected a freshly refreshed access token");
                Err(AuthFailure::Stale.into())
            }
        }
    }

    async fn attempt(&self) -> Result<Attempt, AuthFailure> {
        let token = self.provider.get_valid_access_token().await?;
        let authorization = bearer_header(&token)?;

        let request = async {
            let resp = self
                .client
                .get(self.url.clone())
                .header(header::AUTHORIZATION, authorization)
                .send()
                .await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            Ok::<_, reqwest_middleware::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(error)) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to reach playback endpoint"
                );
                return Ok(Attempt::Answered(None));
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "playback request timed out"
                );
                return Ok(Attempt::Answered(None));
            }
        };

        tracing::debug!(
            response.status = status.as_u16(),
            "received playback response"
        );

        Ok(match status {
            StatusCode::NO_CONTENT => Attempt::Answered(None),
            StatusCode::UNAUTHORIZED => Attempt::Unauthorized,
            status if status.is_success() => Attempt::Answered(playing_track(&body)),
            status => {
                tracing::warn!(
                    response.status = status.as_u16(),
                    response.body = %String::from_utf8_lossy(&body),
                    "unexpected status from playback endpoint"
                );
                Attempt::Answered(None)
            }
        })
    }
}

fn playing_track(body: &[u8]) -> Option<Track> {
    match serde_json::from_slice::<PlaybackState>(body) {
        Ok(state) => {
            let track = state.into_playing_track();
            if track.is_none() {
                tracing::debug!("playback is paused or has no item");
            }
            track
        }
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                response.body = %String::from_utf8_lossy(body),
                "playback body was not understood"
            );
            None
        }
    }
}

fn bearer_header(token: &AccessTokenRef) -> Result<header::HeaderValue, AuthFailure> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value)
        .map_err(|_| AuthFailure::MalformedToken)?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        convert::Infallible,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;
    use reqwest::{Request, Response};
    use reqwest_middleware::{ClientBuilder, Middleware, Next};
    use spindle_clock::{TestClock, UnixTime};
    use spindle_tokens::{
        store::StaticRefreshCredential, AccessToken, BrokerConfig, EndpointResponse, ErrorKind,
        RefreshToken, RefreshTokenRef, TokenBroker, TokenEndpoint,
    };
    use tracing_test::traced_test;

    use super::*;

    const PLAYING: &str = r#"{
        "is_playing": true,
        "progress_ms": 1000,
        "item": {
            "name": "Roygbiv",
            "duration_ms": 151000,
            "artists": [{ "name": "Boards of Canada" }],
            "album": { "name": "Music Has the Right to Children", "images": [] },
            "external_urls": { "spotify": "https://open.spotify.com/track/2" }
        }
    }"#;
    const PAUSED: &str = r#"{"is_playing": false, "progress_ms": 1000, "item": {"name": "Roygbiv"}}"#;

    /// Hands out a sequence of tokens, repeating the last one
    struct FakeProvider {
        tokens: Mutex<VecDeque<Result<AccessToken, BrokerError>>>,
        issued: AtomicUsize,
        invalidations: AtomicUsize,
    }

    impl FakeProvider {
        fn new(tokens: impl IntoIterator<Item = &'static str>) -> Self {
            Self::with_outcomes(tokens.into_iter().map(|t| Ok(AccessToken::from_static(t))))
        }

        fn with_outcomes(outcomes: impl IntoIterator<Item = Result<AccessToken, BrokerError>>) -> Self {
            Self {
                tokens: Mutex::new(outcomes.into_iter().collect()),
                issued: AtomicUsize::new(0),
                invalidations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AccessTokenProvider for FakeProvider {
        async fn get_valid_access_token(&self) -> Result<AccessToken, BrokerError> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            let mut tokens = self.tokens.lock().unwrap();
            if tokens.len() > 1 {
                tokens.pop_front().unwrap()
            } else {
                tokens.front().cloned().unwrap()
            }
        }

        fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Plays the part of the provider's playback API
    struct CannedPlayer {
        responses: Mutex<VecDeque<(u16, &'static str)>>,
        delay: Duration,
        seen: Mutex<Vec<(String, bool)>>,
    }

    impl CannedPlayer {
        fn new(responses: impl IntoIterator<Item = (u16, &'static str)>) -> Arc<Self> {
            Self::delayed(Duration::ZERO, responses)
        }

        fn delayed(
            delay: Duration,
            responses: impl IntoIterator<Item = (u16, &'static str)>,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                delay,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn authorizations(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|(auth, _)| auth.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Middleware for CannedPlayer {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> reqwest_middleware::Result<Response> {
            let authorization = req.headers().get(header::AUTHORIZATION).unwrap();
            self.seen.lock().unwrap().push((
                authorization.to_str().unwrap().to_owned(),
                authorization.is_sensitive(),
            ));

            let (status, body) = {
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    responses.pop_front().unwrap()
                } else {
                    *responses.front().unwrap()
                }
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            Ok(http::Response::builder()
                .status(status)
                .body(body)
                .unwrap()
                .into())
        }
    }

    fn fetcher<P>(provider: P, player: &Arc<CannedPlayer>) -> NowPlayingFetcher<P> {
        let client = ClientBuilder::new(reqwest::Client::default())
            .with_arc(player.clone())
            .build();

        NowPlayingFetcher::new(
            provider,
            client,
            Url::parse(SPOTIFY_CURRENTLY_PLAYING_URL).unwrap(),
        )
    }

    mod when_the_provider_answers {
        use super::*;

        #[tokio::test]
        async fn no_content_means_nothing_is_playing() {
            let player = CannedPlayer::new([(204, "")]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            let track = fetcher.fetch_currently_playing().await.unwrap();

            assert_eq!(track, None);
            assert_eq!(player.authorizations(), ["Bearer BQD-1"]);
        }

        #[tokio::test]
        async fn playing_track_is_returned() {
            let player = CannedPlayer::new([(200, PLAYING)]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            let track = fetcher.fetch_currently_playing().await.unwrap().unwrap();

            assert_eq!(track.name, "Roygbiv");
            assert_eq!(track.artists, ["Boards of Canada"]);
            assert_eq!(track.album, "Music Has the Right to Children");
            assert_eq!(track.progress_ms, Some(1000));
        }

        #[tokio::test]
        async fn paused_playback_means_nothing_is_playing() {
            let player = CannedPlayer::new([(200, PAUSED)]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);
        }

        #[tokio::test]
        async fn bearer_header_is_marked_sensitive() {
            let player = CannedPlayer::new([(204, "")]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            fetcher.fetch_currently_playing().await.unwrap();

            let seen = player.seen.lock().unwrap();
            assert!(seen[0].1);
        }
    }

    mod when_the_provider_misbehaves {
        use super::*;

        #[tokio::test]
        #[traced_test]
        async fn unexpected_status_is_logged_and_treated_as_nothing_playing() {
            let player = CannedPlayer::new([(503, "upstream unavailable")]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);
            assert!(logs_contain("unexpected status from playback endpoint"));
            assert!(logs_contain("upstream unavailable"));
        }

        #[tokio::test]
        async fn malformed_body_is_treated_as_nothing_playing() {
            let player = CannedPlayer::new([(200, "{\"is_playing\": tru")]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);
        }

        #[tokio::test(start_paused = true)]
        async fn slow_provider_times_out_as_nothing_playing() {
            let player = CannedPlayer::delayed(Duration::from_secs(30), [(200, PLAYING)]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1"]), &player);

            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);
        }
    }

    mod when_the_provider_rejects_the_token {
        use super::*;

        #[tokio::test]
        async fn token_is_invalidated_and_request_retried_once() {
            let player = CannedPlayer::new([(401, ""), (200, PLAYING)]);
            let provider = FakeProvider::new(["BQD-1", "BQD-2"]);
            let fetcher = fetcher(provider, &player);

            let track = fetcher.fetch_currently_playing().await.unwrap();

            assert!(track.is_some());
            assert_eq!(fetcher.provider().invalidations.load(Ordering::SeqCst), 1);
            assert_eq!(player.authorizations(), ["Bearer BQD-1", "Bearer BQD-2"]);
        }

        #[tokio::test]
        async fn second_rejection_is_a_stale_credential() {
            let player = CannedPlayer::new([(401, "")]);
            let fetcher = fetcher(FakeProvider::new(["BQD-1", "BQD-2"]), &player);

            let err = fetcher.fetch_currently_playing().await.unwrap_err();

            assert!(matches!(err.auth_failure(), AuthFailure::Stale));
            assert_eq!(err.auth_failure().kind(), "stale_credential");
            assert_eq!(fetcher.provider().invalidations.load(Ordering::SeqCst), 1);
            assert_eq!(player.authorizations().len(), 2);
        }
    }

    mod when_no_token_can_be_obtained {
        use super::*;

        #[tokio::test]
        async fn broker_error_is_surfaced_without_a_request() {
            let player = CannedPlayer::new([(200, PLAYING)]);
            let provider = FakeProvider::with_outcomes([Err(BrokerError::RevokedCredential {
                description: None,
            })]);
            let fetcher = fetcher(provider, &player);

            let err = fetcher.fetch_currently_playing().await.unwrap_err();

            let failure = err.auth_failure();
            assert_eq!(failure.kind(), "revoked_credential");
            assert!(failure.needs_reauthentication());
            assert!(player.authorizations().is_empty());
        }

        #[tokio::test]
        async fn token_unfit_for_a_header_is_reported() {
            let player = CannedPlayer::new([(200, PLAYING)]);
            let fetcher = fetcher(FakeProvider::new(["BQD\n1"]), &player);

            let err = fetcher.fetch_currently_playing().await.unwrap_err();

            assert!(matches!(err.auth_failure(), AuthFailure::MalformedToken));
            assert!(player.authorizations().is_empty());
        }
    }

    mod when_backed_by_a_token_broker {
        use super::*;

        /// Grants `BQD-1`, `BQD-2`, ... in turn
        #[derive(Default)]
        struct CountingAuthority {
            grants: AtomicUsize,
        }

        #[async_trait]
        impl TokenEndpoint for CountingAuthority {
            type Error = Infallible;

            async fn exchange_refresh_token(
                &self,
                _: &RefreshTokenRef,
            ) -> Result<EndpointResponse, Self::Error> {
                let n = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
                let body = format!(r#"{{"access_token":"BQD-{n}","expires_in":3600}}"#);
                Ok(EndpointResponse::new(200, body))
            }
        }

        fn broker(
            authority: &Arc<CountingAuthority>,
        ) -> TokenBroker<Arc<CountingAuthority>, StaticRefreshCredential, TestClock> {
            TokenBroker::builder(
                authority.clone(),
                StaticRefreshCredential::new(RefreshToken::from_static("AQC-1")),
            )
            .with_config(BrokerConfig::default())
            .with_clock(TestClock::new(UnixTime(1_700_000_000)))
            .build()
        }

        #[tokio::test]
        async fn rejected_token_is_replaced_by_a_new_exchange() {
            let authority = Arc::new(CountingAuthority::default());
            let player = CannedPlayer::new([(401, ""), (204, "")]);
            let fetcher = fetcher(broker(&authority), &player);

            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);

            assert_eq!(authority.grants.load(Ordering::SeqCst), 2);
            assert_eq!(player.authorizations(), ["Bearer BQD-1", "Bearer BQD-2"]);
        }

        #[tokio::test]
        async fn freshly_minted_token_can_be_replaced_after_rejection() {
            let authority = Arc::new(CountingAuthority::default());
            let player = CannedPlayer::new([(401, ""), (200, PLAYING)]);
            let fetcher = fetcher(broker(&authority), &player);

            let track = fetcher.fetch_currently_playing().await.unwrap().unwrap();

            assert_eq!(track.name, "Roygbiv");
            assert_eq!(authority.grants.load(Ordering::SeqCst), 2);
            assert_eq!(player.authorizations(), ["Bearer BQD-1", "Bearer BQD-2"]);
        }

        #[tokio::test]
        async fn each_lookup_may_replace_a_rejected_token() {
            let authority = Arc::new(CountingAuthority::default());
            let player = CannedPlayer::new([(401, ""), (204, ""), (401, ""), (204, "")]);
            let fetcher = fetcher(broker(&authority), &player);

            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);
            assert_eq!(fetcher.fetch_currently_playing().await.unwrap(), None);

            assert_eq!(authority.grants.load(Ordering::SeqCst), 3);
            assert_eq!(
                player.authorizations(),
                ["Bearer BQD-1", "Bearer BQD-2", "Bearer BQD-2", "Bearer BQD-3"]
            );
        }

        #[tokio::test]
        async fn cached_token_serves_later_lookups() {
            let authority = Arc::new(CountingAuthority::default());
            let player = CannedPlayer::new([(204, "")]);
            let fetcher = fetcher(broker(&authority), &player);

            fetcher.fetch_currently_playing().await.unwrap();
            fetcher.fetch_currently_playing().await.unwrap();

            assert_eq!(authority.grants.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn repeated_rejection_does_not_loop() {
            let authority = Arc::new(CountingAuthority::default());
            let player = CannedPlayer::new([(401, "")]);
            let fetcher = fetcher(broker(&authority), &player);

            let err = fetcher.fetch_currently_playing().await.unwrap_err();

            assert!(matches!(err.auth_failure(), AuthFailure::Stale));
            assert_eq!(authority.grants.load(Ordering::SeqCst), 2);
            assert_ne!(err.auth_failure().kind(), ErrorKind::RateLimited.as_str());
            assert_eq!(player.authorizations(), ["Bearer BQD-1", "Bearer BQD-2"]);
        }
    }
}

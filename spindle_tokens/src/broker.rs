use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use spindle_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::sync::watch;

use crate::{
    endpoint::{Grant, TokenEndpoint},
    error::ExchangeInterrupted,
    store::{AccessCredentialCache, RefreshCredentialStore, StoreError},
    AccessCredential, AccessToken, BrokerError, ErrorKind, RefreshTokenRef, TokenLifetimeConfig,
};

/// Configuration for a [`TokenBroker`]
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    lifetime: TokenLifetimeConfig,
    min_refresh_interval: DurationSecs,
    exchange_timeout: Duration,
}

impl Default for BrokerConfig {
    /// Default broker configuration
    ///
    /// Uses the default [`TokenLifetimeConfig`], allows a new refresh at most every
    /// 2 seconds, and gives the authority 10 seconds to answer.
    fn default() -> Self {
        Self {
            lifetime: TokenLifetimeConfig::default(),
            min_refresh_interval: DurationSecs(2),
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Sets how newly issued credentials are aged
    pub fn with_lifetime(mut self, lifetime: TokenLifetimeConfig) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets the minimum time between two refresh attempts
    ///
    /// An attempt inside this window fails fast with [`BrokerError::RateLimited`].
    pub fn with_min_refresh_interval(mut self, interval: DurationSecs) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Sets how long to wait for the authority to answer a refresh
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// How newly issued credentials are aged
    pub fn lifetime(&self) -> &TokenLifetimeConfig {
        &self.lifetime
    }

    /// The minimum time between two refresh attempts
    pub fn min_refresh_interval(&self) -> DurationSecs {
        self.min_refresh_interval
    }

    /// How long to wait for the authority to answer a refresh
    pub fn exchange_timeout(&self) -> Duration {
        self.exchange_timeout
    }
}

type Outcome = Result<AccessToken, BrokerError>;

struct RefreshOperation {
    id: u64,
    outcome: watch::Receiver<Option<Outcome>>,
}

#[derive(Default)]
struct BrokerState {
    cached: Option<AccessCredential>,
    in_flight: Option<RefreshOperation>,
    last_attempt: Option<UnixTime>,
    last_failure: Option<ErrorKind>,
    bypass_caches: bool,
    forced_refresh: bool,
    next_id: u64,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared<E, S, C> {
    endpoint: E,
    store: S,
    caches: Vec<(String, Box<dyn AccessCredentialCache>)>,
    config: BrokerConfig,
    clock: C,
    state: Mutex<BrokerState>,
}

/// Hands out valid access tokens, refreshing them from the authority as needed
///
/// A broker is cheap to clone; clones share one cached credential and one
/// in-flight refresh. When several callers need a new credential at once, only
/// the first performs the exchange and the rest wait for its outcome.
///
/// Coordination happens within a process. Brokers in separate processes each
/// refresh on their own unless they share an [`AccessCredentialCache`].
pub struct TokenBroker<E, S, C = System> {
    shared: Arc<Shared<E, S, C>>,
}

impl<E, S, C> Clone for TokenBroker<E, S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E, S, C> fmt::Debug for TokenBroker<E, S, C>
where
    E: fmt::Debug,
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenBroker")
            .field("endpoint", &self.shared.endpoint)
            .field("store", &self.shared.store)
            .field(
                "caches",
                &self
                    .shared
                    .caches
                    .iter()
                    .map(|(n, _)| n.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("config", &self.shared.config)
            .field("clock", &self.shared.clock)
            .finish()
    }
}

/// A builder for a [`TokenBroker`]
pub struct TokenBrokerBuilder<E, S, C = System> {
    endpoint: E,
    store: S,
    caches: Vec<(String, Box<dyn AccessCredentialCache>)>,
    config: BrokerConfig,
    clock: C,
}

impl<E, S, C> fmt::Debug for TokenBrokerBuilder<E, S, C>
where
    E: fmt::Debug,
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenBrokerBuilder")
            .field("endpoint", &self.endpoint)
            .field("store", &self.store)
            .field(
                "caches",
                &self.caches.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<E, S> TokenBroker<E, S, System> {
    /// Constructs a broker with the default configuration and no shared caches
    pub fn new(endpoint: E, store: S) -> Self {
        Self::builder(endpoint, store).build()
    }

    /// Starts building a broker that refreshes against `endpoint` using the
    /// refresh token held by `store`
    pub fn builder(endpoint: E, store: S) -> TokenBrokerBuilder<E, S, System> {
        TokenBrokerBuilder {
            endpoint,
            store,
            caches: Vec::new(),
            config: BrokerConfig::default(),
            clock: System,
        }
    }
}

impl<E, S, C> TokenBrokerBuilder<E, S, C> {
    /// Replaces the broker configuration
    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a shared cache layer
    ///
    /// Caches are consulted in the order they were added before asking the
    /// authority, and every new credential is pushed to all of them.
    pub fn with_cache(
        mut self,
        name: impl Into<String>,
        cache: impl AccessCredentialCache + 'static,
    ) -> Self {
        self.caches.push((name.into(), Box::new(cache)));
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenBrokerBuilder<E, S, D> {
        TokenBrokerBuilder {
            endpoint: self.endpoint,
            store: self.store,
            caches: self.caches,
            config: self.config,
            clock,
        }
    }

    /// Builds the broker
    pub fn build(self) -> TokenBroker<E, S, C> {
        TokenBroker {
            shared: Arc::new(Shared {
                endpoint: self.endpoint,
                store: self.store,
                caches: self.caches,
                config: self.config,
                clock: self.clock,
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }
}

/// The right to perform the in-flight refresh
///
/// Whatever happens to the leading caller, dropping the lease clears the
/// in-flight marker and releases every waiter.
struct RefreshLease<'a> {
    state: &'a Mutex<BrokerState>,
    id: u64,
    tx: watch::Sender<Option<Outcome>>,
    finished: bool,
}

impl RefreshLease<'_> {
    fn finish(mut self, outcome: Result<AccessCredential, BrokerError>) -> Outcome {
        let shared_outcome = match &outcome {
            Ok(credential) => Ok(credential.access_token().to_owned()),
            Err(error) => Err(error.clone()),
        };

        {
            let mut state = lock(self.state);
            let current = state.in_flight.as_ref().map(|op| op.id) == Some(self.id);
            match outcome {
                Ok(credential) => {
                    if current {
                        state.cached = Some(credential);
                    }
                    state.last_failure = None;
                }
                Err(error) => {
                    state.cached = None;
                    state.last_failure = Some(error.kind());
                }
            }
            if current {
                state.in_flight = None;
            }
        }

        self.finished = true;
        self.tx.send_replace(Some(shared_outcome.clone()));
        shared_outcome
    }
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        tracing::warn!(refresh = self.id, "refresh abandoned before completing");
        let error = BrokerError::transport(ExchangeInterrupted::Abandoned);
        {
            let mut state = lock(self.state);
            if state.in_flight.as_ref().map(|op| op.id) == Some(self.id) {
                state.in_flight = None;
            }
            state.cached = None;
            state.last_failure = Some(error.kind());
        }
        self.tx.send_replace(Some(Err(error)));
    }
}

enum Role<'a> {
    Lead(RefreshLease<'a>, bool),
    Follow(watch::Receiver<Option<Outcome>>),
}

async fn follow(mut outcome: watch::Receiver<Option<Outcome>>) -> Outcome {
    loop {
        let current = outcome.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }

        if outcome.changed().await.is_err() {
            return outcome
                .borrow()
                .clone()
                .unwrap_or_else(|| Err(BrokerError::transport(ExchangeInterrupted::Abandoned)));
        }
    }
}

impl<E, S, C> TokenBroker<E, S, C>
where
    E: TokenEndpoint,
    S: RefreshCredentialStore,
    C: Clock + Send + Sync,
{
    /// Gets an access token that is valid now
    ///
    /// A cached credential is returned without any network call. Otherwise the
    /// caller joins the refresh already in flight, or starts one if there is none.
    /// Starting a refresh within the minimum refresh interval of the previous
    /// attempt fails with [`BrokerError::RateLimited`], unless it is the first
    /// refresh after [`invalidate()`][Self::invalidate()] discarded a credential.
    pub async fn get_valid_access_token(&self) -> Result<AccessToken, BrokerError> {
        let now = self.shared.clock.now();

        let role = {
            let mut state = lock(&self.shared.state);

            if let Some(credential) = state.cached.as_ref().filter(|c| c.is_valid_at(now)) {
                tracing::trace!(
                    expires_at = credential.expires_at().0,
                    "using cached access token"
                );
                return Ok(credential.access_token().to_owned());
            }

            if let Some(op) = &state.in_flight {
                tracing::trace!(refresh = op.id, "joining in-flight refresh");
                Role::Follow(op.outcome.clone())
            } else {
                let min_interval = self.shared.config.min_refresh_interval;
                let forced = std::mem::take(&mut state.forced_refresh);
                if let Some(last) = state.last_attempt.filter(|_| !forced) {
                    let elapsed = now - last;
                    if elapsed < min_interval {
                        let retry_after = min_interval - elapsed;
                        tracing::debug!(
                            retry_after = retry_after.0,
                            "refresh attempted inside the rate limit window"
                        );
                        return Err(BrokerError::RateLimited { retry_after });
                    }
                }

                state.last_attempt = Some(now);
                state.next_id += 1;
                let id = state.next_id;
                let (tx, rx) = watch::channel(None);
                state.in_flight = Some(RefreshOperation { id, outcome: rx });
                let bypass_caches = std::mem::take(&mut state.bypass_caches);

                Role::Lead(
                    RefreshLease {
                        state: &self.shared.state,
                        id,
                        tx,
                        finished: false,
                    },
                    bypass_caches,
                )
            }
        };

        match role {
            Role::Follow(outcome) => follow(outcome).await,
            Role::Lead(lease, bypass_caches) => {
                tracing::debug!(refresh = lease.id, bypass_caches, "leading token refresh");
                let outcome = self.refresh(now, bypass_caches).await;
                lease.finish(outcome)
            }
        }
    }

    /// Discards the cached credential
    ///
    /// Call this after the provider rejects a token with a 401, so that the next
    /// request obtains a new token rather than reusing the rejected one. Shared
    /// caches are skipped on that next refresh, as they may hold the same token.
    ///
    /// When a credential was discarded, the next refresh is exempt from the
    /// minimum refresh interval. Invalidating again before that refresh, or with
    /// nothing cached, grants no further exemption.
    pub fn invalidate(&self) {
        let mut state = lock(&self.shared.state);
        if state.cached.take().is_some() {
            tracing::debug!("discarded cached access token");
            state.forced_refresh = true;
        }
        state.bypass_caches = true;
    }

    /// Forgets every credential this broker can reach
    ///
    /// The cached credential and shared caches are cleared and the store is asked
    /// to forget its refresh token. Until a refresh token is provided again,
    /// [`get_valid_access_token()`][Self::get_valid_access_token()] fails with
    /// [`BrokerError::MissingCredential`].
    pub async fn logout(&self) -> Result<(), StoreError> {
        {
            let mut state = lock(&self.shared.state);
            state.cached = None;
            state.in_flight = None;
            state.last_failure = None;
            state.bypass_caches = true;
            state.forced_refresh = false;
        }

        for (name, cache) in &self.shared.caches {
            if let Err(error) = cache.clear_credential().await {
                tracing::warn!(cache = %name, error = (&*error as &dyn error::Error), "unable to clear token cache");
            }
        }

        self.shared.store.forget().await?;
        tracing::info!("logged out, credentials forgotten");
        Ok(())
    }

    /// Takes a snapshot of the broker's state without contacting the authority
    pub fn status(&self) -> BrokerStatus {
        let now = self.shared.clock.now();
        let state = lock(&self.shared.state);

        BrokerStatus {
            credential: state.cached.as_ref().map(|c| CredentialSummary {
                issued: c.issued(),
                expires_at: c.expires_at(),
                expires_in: c.until_expired_at(now),
                valid: c.is_valid_at(now),
            }),
            refresh_in_flight: state.in_flight.is_some(),
            last_refresh_attempt: state.last_attempt,
            last_failure: state.last_failure,
        }
    }

    async fn refresh(
        &self,
        now: UnixTime,
        bypass_caches: bool,
    ) -> Result<AccessCredential, BrokerError> {
        if !bypass_caches {
            if let Some(credential) = self.credential_from_caches(now).await {
                return Ok(credential);
            }
        }

        let refresh_token = match self.shared.store.load().await {
            Ok(Some(refresh_token)) => refresh_token,
            Ok(None) => {
                tracing::error!("no refresh token available, authentication required");
                return Err(BrokerError::MissingCredential);
            }
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "unable to load refresh token"
                );
                return Err(BrokerError::store(error));
            }
        };

        let timeout = self.shared.config.exchange_timeout;
        let exchange = self.shared.endpoint.exchange_refresh_token(&refresh_token);
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to reach token endpoint"
                );
                return Err(BrokerError::transport(error));
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "token exchange timed out");
                return Err(BrokerError::transport(ExchangeInterrupted::TimedOut(timeout)));
            }
        };

        let Grant {
            access_token,
            expires_in,
            refresh_token: returned,
        } = response.classify()?;

        let credential = self.shared.config.lifetime.create_credential(
            access_token,
            expires_in,
            self.shared.clock.now(),
        );

        tracing::info!(
            lifetime = credential.lifetime().0,
            issued = credential.issued().0,
            expires_at = credential.expires_at().0,
            rotated = returned.is_some(),
            "received new access token"
        );

        if let Some(returned) = returned {
            if returned.as_str() != refresh_token.as_str() {
                self.persist_rotation(&returned).await;
            }
        }

        self.persist_to_caches(&credential, self.shared.caches.len())
            .await;

        Ok(credential)
    }

    async fn persist_rotation(&self, refresh_token: &RefreshTokenRef) {
        tracing::info!("authority rotated the refresh token");
        if let Err(error) = self.shared.store.rotate(refresh_token).await {
            tracing::error!(
                error = (&*error as &dyn error::Error),
                "unable to persist rotated refresh token, later refreshes may be rejected"
            );
        }
    }

    async fn credential_from_caches(&self, now: UnixTime) -> Option<AccessCredential> {
        for (idx, (name, cache)) in self.shared.caches.iter().enumerate() {
            match cache.load_credential().await {
                Ok(Some(credential)) if credential.is_valid_at(now) => {
                    tracing::debug!(
                        cache = %name,
                        expires_at = credential.expires_at().0,
                        "adopting access token from cache"
                    );
                    self.persist_to_caches(&credential, idx).await;
                    return Some(credential);
                }
                Ok(Some(credential)) => {
                    tracing::trace!(cache = %name, expires_at = credential.expires_at().0, "cached token has expired, trying next source");
                }
                Ok(None) => {
                    tracing::trace!(cache = %name, "cache is empty, trying next source");
                }
                Err(error) => {
                    tracing::warn!(cache = %name, error = (&*error as &dyn error::Error), "token cache returned error, trying next source");
                }
            }
        }

        None
    }

    async fn persist_to_caches(&self, credential: &AccessCredential, upto: usize) {
        for (name, cache) in self.shared.caches.iter().take(upto) {
            match cache.persist_credential(credential).await {
                Ok(()) => {
                    tracing::trace!(cache = %name, "pushed new token to cache");
                }
                Err(error) => {
                    tracing::warn!(cache = %name, error = (&*error as &dyn error::Error), "unable to push new token to cache");
                }
            }
        }
    }
}

/// A snapshot of a broker's state
#[derive(Clone, Debug, Serialize)]
pub struct BrokerStatus {
    /// The cached credential, if any
    pub credential: Option<CredentialSummary>,
    /// Whether a refresh is currently in flight
    pub refresh_in_flight: bool,
    /// When a refresh was last attempted
    pub last_refresh_attempt: Option<UnixTime>,
    /// The kind of failure of the last refresh, unless it succeeded
    pub last_failure: Option<ErrorKind>,
}

/// Non-secret details of a cached credential
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CredentialSummary {
    /// When the credential was issued
    pub issued: UnixTime,
    /// When the credential stops being used
    pub expires_at: UnixTime,
    /// How much longer the credential will be used
    pub expires_in: DurationSecs,
    /// Whether the credential is still used
    pub valid: bool,
}

/// A source of access tokens that can be told a token was rejected
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Gets an access token that is valid now
    async fn get_valid_access_token(&self) -> Result<AccessToken, BrokerError>;

    /// Discards the current access token
    fn invalidate(&self);
}

#[async_trait]
impl<E, S, C> AccessTokenProvider for TokenBroker<E, S, C>
where
    E: TokenEndpoint,
    S: RefreshCredentialStore,
    C: Clock + Send + Sync,
{
    async fn get_valid_access_token(&self) -> Result<AccessToken, BrokerError> {
        TokenBroker::get_valid_access_token(self).await
    }

    fn invalidate(&self) {
        TokenBroker::invalidate(self)
    }
}

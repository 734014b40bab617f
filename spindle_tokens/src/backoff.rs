//! Error backoff handling

use std::{error, future::Future, time::Duration};

use crate::BrokerError;

/// Configuration for how to manage backoff when an error is encountered
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u64,
    max_attempts: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 100 ms with a multiplier of 2. Maximum delay is
    /// capped at 15 seconds. An operation is attempted at most 3 times.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_millis(100),
            max_error_delay: Duration::from_secs(15),
            multiplier: 2,
            max_attempts: 3,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff should be multiplied by `multiplier`, with a cap of
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u64) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
            ..Self::default()
        }
    }

    /// Sets how many times [`retry_with_backoff()`] attempts an operation
    ///
    /// A value of zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The maximum number of attempts
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
        }
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn success(&mut self) {
        self.last_delay = None;
    }

    /// Reports a failure and returns the expected backoff delay
    ///
    /// This will apply the values in the backoff configuration, increasing the backoff delay
    /// if required, and then report the expected next delay.
    pub fn error(&mut self) -> Duration {
        let new_delay = self
            .last_delay
            .map(|s: Duration| {
                (Duration::from_millis(s.as_millis() as u64 * self.config.multiplier))
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        new_delay
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}

/// Runs `op` until it succeeds, fails terminally, or runs out of attempts
///
/// Only errors for which [`BrokerError::is_retryable()`] holds are retried. Between
/// attempts the delay grows according to `config`, but never undercuts a
/// [`retry_after()`][BrokerError::retry_after()] hint carried by the error.
pub async fn retry_with_backoff<T, F, Fut>(
    config: ErrorBackoffConfig,
    mut op: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let max_attempts = config.max_attempts();
    let mut handler = ErrorBackoffHandler::new(config);
    let mut attempt = 1;

    loop {
        match op().await.with_backoff(&mut handler) {
            Ok(value) => return Ok(value),
            Err((err, _)) if !err.is_retryable() => return Err(err),
            Err((err, _)) if attempt >= max_attempts => {
                tracing::debug!(
                    attempts = attempt,
                    error = (&err as &dyn error::Error),
                    "giving up after exhausting attempts"
                );
                return Err(err);
            }
            Err((err, delay)) => {
                let delay = err.retry_after().map_or(delay, |hint| hint.max(delay));
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = (&err as &dyn error::Error),
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use spindle_clock::DurationSecs;
    use tokio::time::Instant;

    use super::*;

    fn transient() -> BrokerError {
        BrokerError::TransientAuthFailure {
            error: "server_error".into(),
            description: None,
        }
    }

    #[test]
    fn delay_grows_until_capped_and_resets_on_success() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            2,
        ));

        assert_eq!(handler.error(), Duration::from_millis(100));
        assert_eq!(handler.error(), Duration::from_millis(200));
        assert_eq!(handler.error(), Duration::from_millis(350));
        assert_eq!(handler.error(), Duration::from_millis(350));

        handler.success();
        assert_eq!(handler.error(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let attempts = &AtomicU32::new(0);

        let value = retry_with_backoff(ErrorBackoffConfig::default(), || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok("BQD1")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "BQD1");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let attempts = &AtomicU32::new(0);

        let err = retry_with_backoff(ErrorBackoffConfig::default(), || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BrokerError::TransientAuthFailure { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_credential_is_not_retried() {
        let attempts = &AtomicU32::new(0);

        let err = retry_with_backoff(ErrorBackoffConfig::default(), || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BrokerError::RevokedCredential { description: None })
        })
        .await
        .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_honoured() {
        let attempts = &AtomicU32::new(0);
        let start = Instant::now();

        retry_with_backoff(ErrorBackoffConfig::default(), || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BrokerError::RateLimited {
                    retry_after: DurationSecs(2),
                })
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}

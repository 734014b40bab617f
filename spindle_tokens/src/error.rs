//! Classified failures when obtaining an access token

use std::{error, sync::Arc, time::Duration};

use serde::Serialize;
use spindle_clock::DurationSecs;
use thiserror::Error;

/// A shareable error cause
pub type SharedError = Arc<dyn error::Error + Send + Sync + 'static>;

/// A failure to obtain a valid access token
///
/// Every caller waiting on the same refresh observes the same value, so this
/// type is cheap to clone.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The authority reported the refresh token as invalid or revoked
    ///
    /// No refresh can succeed until the user authenticates again.
    #[error("refresh token was rejected as invalid or revoked: {}", .description.as_deref().unwrap_or("invalid_grant"))]
    RevokedCredential {
        /// The authority's description of the problem, if given
        description: Option<String>,
    },
    /// The authority refused the refresh for a reason that may clear up
    #[error("authority refused to refresh the access token: {error}")]
    TransientAuthFailure {
        /// The OAuth2 error code
        error: String,
        /// The authority's description of the problem, if given
        description: Option<String>,
    },
    /// The authority's response could not be understood
    #[error("unexpected response from token endpoint (status {status})")]
    ProtocolError {
        /// The HTTP status of the response
        status: u16,
        /// The raw body of the response
        body: String,
    },
    /// The token endpoint could not be reached, or the exchange did not finish
    #[error("unable to complete token exchange")]
    TransportError {
        /// The underlying transport failure
        #[source]
        source: SharedError,
    },
    /// A refresh was attempted too soon after the previous attempt
    #[error("refresh attempted too soon, retry in {retry_after}")]
    RateLimited {
        /// How long until another attempt will be permitted
        retry_after: DurationSecs,
    },
    /// The credential store has no refresh token
    #[error("no refresh token is available")]
    MissingCredential,
    /// The credential store could not be read
    #[error("unable to load refresh token from credential store")]
    CredentialStore {
        /// The underlying store failure
        #[source]
        source: SharedError,
    },
}

/// The kind of a [`BrokerError`], without its payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`BrokerError::RevokedCredential`]
    RevokedCredential,
    /// See [`BrokerError::TransientAuthFailure`]
    TransientAuthFailure,
    /// See [`BrokerError::ProtocolError`]
    ProtocolError,
    /// See [`BrokerError::TransportError`]
    TransportError,
    /// See [`BrokerError::RateLimited`]
    RateLimited,
    /// See [`BrokerError::MissingCredential`]
    MissingCredential,
    /// See [`BrokerError::CredentialStore`]
    CredentialStore,
}

impl ErrorKind {
    /// Whether a later attempt might succeed without a human re-authenticating
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::RevokedCredential | Self::MissingCredential)
    }

    /// The name of this kind, as it appears when serialized
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RevokedCredential => "revoked_credential",
            Self::TransientAuthFailure => "transient_auth_failure",
            Self::ProtocolError => "protocol_error",
            Self::TransportError => "transport_error",
            Self::RateLimited => "rate_limited",
            Self::MissingCredential => "missing_credential",
            Self::CredentialStore => "credential_store",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BrokerError {
    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RevokedCredential { .. } => ErrorKind::RevokedCredential,
            Self::TransientAuthFailure { .. } => ErrorKind::TransientAuthFailure,
            Self::ProtocolError { .. } => ErrorKind::ProtocolError,
            Self::TransportError { .. } => ErrorKind::TransportError,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::MissingCredential => ErrorKind::MissingCredential,
            Self::CredentialStore { .. } => ErrorKind::CredentialStore,
        }
    }

    /// Whether a later attempt might succeed without a human re-authenticating
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The minimum delay a caller must observe before trying again, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some((*retry_after).into()),
            _ => None,
        }
    }

    pub(crate) fn transport<E>(source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::TransportError {
            source: Arc::new(source),
        }
    }

    pub(crate) fn store(source: Box<dyn error::Error + Send + Sync + 'static>) -> Self {
        Self::CredentialStore {
            source: Arc::from(source),
        }
    }
}

/// A token exchange that ended without an answer from the authority
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ExchangeInterrupted {
    /// The authority did not answer within the configured timeout
    #[error("token exchange timed out after {0:?}")]
    TimedOut(Duration),
    /// The caller leading the exchange went away before it finished
    #[error("token exchange was abandoned before it completed")]
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_credential_problems_are_terminal() {
        assert!(!BrokerError::RevokedCredential { description: None }.is_retryable());
        assert!(!BrokerError::MissingCredential.is_retryable());
        assert!(BrokerError::RateLimited {
            retry_after: DurationSecs(1)
        }
        .is_retryable());
        assert!(BrokerError::transport(ExchangeInterrupted::Abandoned).is_retryable());
    }

    #[test]
    fn kinds_serialize_in_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TransientAuthFailure).unwrap();
        assert_eq!(json, "\"transient_auth_failure\"");
        assert_eq!(ErrorKind::TransientAuthFailure.to_string(), "transient_auth_failure");
    }

    #[test]
    fn transport_errors_keep_their_cause() {
        let err = BrokerError::transport(ExchangeInterrupted::TimedOut(Duration::from_secs(10)));
        let source = error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("token exchange timed out after 10s"));
    }
}

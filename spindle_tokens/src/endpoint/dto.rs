//! Token endpoint response bodies and their classification

use std::error;

use serde::Deserialize;
use spindle_clock::DurationSecs;

use super::EndpointResponse;
use crate::{AccessToken, BrokerError, RefreshToken};

const INVALID_GRANT: &str = "invalid_grant";

/// The union of the success and error bodies an authority may send
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<AccessToken>,
    expires_in: Option<DurationSecs>,
    refresh_token: Option<RefreshToken>,
    error: Option<String>,
    error_description: Option<String>,
}

/// A successful exchange
#[derive(Debug)]
pub(crate) struct Grant {
    pub access_token: AccessToken,
    pub expires_in: DurationSecs,
    pub refresh_token: Option<RefreshToken>,
}

impl EndpointResponse {
    /// Classifies the authority's answer
    ///
    /// An `error` field decides the outcome regardless of HTTP status. Without one,
    /// the body must carry both an access token and its lifetime.
    pub(crate) fn classify(&self) -> Result<Grant, BrokerError> {
        let parsed: TokenResponse = match serde_json::from_slice(self.body()) {
            Ok(parsed) => parsed,
            Err(error) => {
                let body = String::from_utf8_lossy(self.body()).into_owned();
                tracing::warn!(
                    response.status = self.status(),
                    response.body = %body,
                    error = (&error as &dyn error::Error),
                    "token endpoint returned a body that is not a token response"
                );
                return Err(BrokerError::ProtocolError {
                    status: self.status(),
                    body,
                });
            }
        };

        match parsed {
            TokenResponse {
                error: Some(code),
                error_description,
                ..
            } if code == INVALID_GRANT => {
                tracing::error!(
                    response.status = self.status(),
                    error_description = error_description.as_deref(),
                    "refresh token has been revoked, re-authentication required"
                );
                Err(BrokerError::RevokedCredential {
                    description: error_description,
                })
            }
            TokenResponse {
                error: Some(code),
                error_description,
                ..
            } => {
                tracing::warn!(
                    response.status = self.status(),
                    error = %code,
                    error_description = error_description.as_deref(),
                    "token endpoint refused refresh"
                );
                Err(BrokerError::TransientAuthFailure {
                    error: code,
                    description: error_description,
                })
            }
            TokenResponse {
                access_token: Some(access_token),
                expires_in: Some(expires_in),
                refresh_token,
                ..
            } => Ok(Grant {
                access_token,
                expires_in,
                refresh_token,
            }),
            _ => {
                let body = String::from_utf8_lossy(self.body()).into_owned();
                tracing::warn!(
                    response.status = self.status(),
                    response.body = %body,
                    "token response is missing an access token or its lifetime"
                );
                Err(BrokerError::ProtocolError {
                    status: self.status(),
                    body,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn classify(status: u16, body: &'static str) -> Result<Grant, BrokerError> {
        EndpointResponse::new(status, body).classify()
    }

    #[test]
    fn successful_body_yields_grant() {
        let grant = classify(
            200,
            r#"{"access_token":"BQD1","token_type":"Bearer","expires_in":3600,"scope":"user-read-currently-playing"}"#,
        )
        .unwrap();

        assert_eq!(grant.access_token.as_str(), "BQD1");
        assert_eq!(grant.expires_in, DurationSecs(3600));
        assert!(grant.refresh_token.is_none());
    }

    #[test]
    fn rotated_refresh_token_is_surfaced() {
        let grant = classify(
            200,
            r#"{"access_token":"BQD1","expires_in":3600,"refresh_token":"AQC2"}"#,
        )
        .unwrap();

        assert_eq!(grant.refresh_token.unwrap().as_str(), "AQC2");
    }

    #[test]
    fn invalid_grant_is_revocation() {
        let err = classify(
            400,
            r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#,
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RevokedCredential);
        assert!(err.to_string().contains("Refresh token revoked"));
    }

    #[test]
    fn other_oauth_errors_are_transient() {
        let err = classify(400, r#"{"error":"invalid_client"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientAuthFailure);
    }

    #[test]
    fn error_field_wins_even_on_success_status() {
        let err = classify(200, r#"{"error":"server_error"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientAuthFailure);
    }

    #[test]
    fn html_error_page_is_protocol_error() {
        match classify(502, "<html>Bad Gateway</html>").unwrap_err() {
            BrokerError::ProtocolError { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "<html>Bad Gateway</html>");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn json_without_lifetime_is_protocol_error() {
        let err = classify(200, r#"{"access_token":"BQD1"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}

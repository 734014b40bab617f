//! A token endpoint reached over HTTPS

use async_trait::async_trait;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Serialize, Serializer};
use thiserror::Error;

use super::{EndpointResponse, TokenEndpoint};
use crate::{ClientId, ClientSecret, RefreshTokenRef};

/// An OAuth2 token endpoint reached with a form-encoded `refresh_token` grant
#[derive(Debug)]
pub struct HttpTokenEndpoint {
    client: ClientWithMiddleware,
    token_url: Url,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
}

impl HttpTokenEndpoint {
    /// Constructs a new endpoint for a public client
    pub fn new(client: ClientWithMiddleware, token_url: Url, client_id: ClientId) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret: None,
        }
    }

    /// Identifies the client to the authority with a secret as well
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }
}

/// An error while attempting to reach the authority
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest_middleware::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
}

struct RefreshForm<'a> {
    client_id: &'a ClientId,
    client_secret: Option<&'a ClientSecret>,
    refresh_token: &'a RefreshTokenRef,
}

impl Serialize for RefreshForm<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshForm", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.serialize_field("client_id", self.client_id)?;
        if let Some(secret) = self.client_secret {
            ser.serialize_field("client_secret", secret)?;
        } else {
            ser.skip_field("client_secret")?;
        }
        ser.end()
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    type Error = ExchangeError;

    #[tracing::instrument(
        err,
        skip(self, refresh_token),
        fields(
            token_url = %self.token_url,
            client_id = %self.client_id,
            confidential = self.client_secret.is_some(),
        ),
    )]
    async fn exchange_refresh_token(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<EndpointResponse, Self::Error> {
        tracing::trace!("requesting token from authority");

        let form = RefreshForm {
            client_id: &self.client_id,
            client_secret: self.client_secret.as_ref(),
            refresh_token,
        };

        let resp = self
            .client
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(ExchangeError::RequestSend)?;

        let status = resp.status().as_u16();
        tracing::debug!(
            response.status = status,
            "received token response from issuing authority"
        );

        let body = resp.bytes().await.map_err(ExchangeError::BodyRead)?;
        Ok(EndpointResponse::new(status, body))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use reqwest::{Request, Response};
    use reqwest_middleware::{ClientBuilder, Middleware, Next};

    use super::*;

    /// Answers every request with a canned body, recording what was sent
    struct CannedAuthority {
        status: u16,
        body: &'static str,
        sent: Mutex<Vec<String>>,
    }

    impl CannedAuthority {
        fn new(status: u16, body: &'static str) -> Self {
            Self {
                status,
                body,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for CannedAuthority {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> reqwest_middleware::Result<Response> {
            assert_eq!(req.method(), reqwest::Method::POST);
            assert_eq!(
                req.headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok()),
                Some("application/x-www-form-urlencoded")
            );

            let body = req
                .body()
                .and_then(|b| b.as_bytes())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            self.sent.lock().unwrap().push(body);

            Ok(http::Response::builder()
                .status(self.status)
                .body(self.body)
                .unwrap()
                .into())
        }
    }

    fn endpoint_with(authority: Arc<CannedAuthority>) -> HttpTokenEndpoint {
        let client = ClientBuilder::new(reqwest::Client::default())
            .with_arc(authority)
            .build();

        HttpTokenEndpoint::new(
            client,
            Url::parse("https://accounts.example.com/api/token").unwrap(),
            ClientId::from_static("client-1"),
        )
    }

    mod when_client_is_public {
        use super::*;

        #[tokio::test]
        async fn form_omits_client_secret() {
            let authority = Arc::new(CannedAuthority::new(
                200,
                r#"{"access_token":"BQD1","expires_in":3600}"#,
            ));
            let endpoint = endpoint_with(authority.clone());

            let resp = endpoint
                .exchange_refresh_token(RefreshTokenRef::from_str("AQC1"))
                .await
                .unwrap();

            assert_eq!(resp.status(), 200);
            assert!(resp.classify().is_ok());

            let sent = authority.sent.lock().unwrap();
            assert_eq!(
                sent.as_slice(),
                ["grant_type=refresh_token&refresh_token=AQC1&client_id=client-1"]
            );
        }
    }

    mod when_client_is_confidential {
        use super::*;

        #[tokio::test]
        async fn form_includes_client_secret() {
            let authority = Arc::new(CannedAuthority::new(
                400,
                r#"{"error":"invalid_grant"}"#,
            ));
            let endpoint =
                endpoint_with(authority.clone()).with_client_secret(ClientSecret::from_static("s3cr3t"));

            let resp = endpoint
                .exchange_refresh_token(RefreshTokenRef::from_str("AQC1"))
                .await
                .unwrap();

            assert_eq!(resp.status(), 400);
            assert_eq!(resp.body(), br#"{"error":"invalid_grant"}"#);

            let sent = authority.sent.lock().unwrap();
            assert!(sent[0].ends_with("&client_secret=s3cr3t"));
        }
    }
}

//! Token endpoint interactions
//!
//! Two grants hit the same endpoint:
//! 1. `authorization_code` completes a login (code + PKCE verifier)
//! 2. `refresh_token` renews an access token without user interaction
//!
//! `TokenEndpoint` is the seam the gateway is built against; tests swap in
//! stub servers or counting fakes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Response body for both grants.
///
/// `expires_in` is a delta in seconds from the response time; the caller
/// turns it into an absolute expiry with its own clock.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Providers may omit this on refresh when they don't rotate
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Inputs to the `authorization_code` grant.
#[derive(Clone, Copy)]
pub struct CodeExchange<'a> {
    pub code: &'a str,
    pub verifier: &'a str,
    pub redirect_uri: &'a str,
}

/// Boxed future returned by `TokenEndpoint` methods.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

/// Injected HTTP capability for reaching the provider's token endpoint.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn TokenEndpoint>`.
pub trait TokenEndpoint: Send + Sync {
    fn exchange_code<'a>(&'a self, exchange: CodeExchange<'a>) -> TokenFuture<'a>;

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a>;
}

/// `TokenEndpoint` over reqwest with a bounded per-request timeout.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret<String>,
    timeout: Duration,
}

impl HttpTokenEndpoint {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Secret<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            timeout,
        }
    }

    async fn post_grant(&self, grant: &'static str, fields: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", grant),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose().as_str()),
        ];
        form.extend_from_slice(fields);

        let response = self
            .client
            .post(&self.token_url)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{grant} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let body: String = body.chars().take(300).collect();

            // invalid_grant comes back as 400; 401/403 for revoked clients
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::InvalidCredentials(format!(
                    "{grant} rejected ({status}): {body}"
                )));
            }
            return Err(Error::TokenExchange(format!(
                "{grant} returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {grant} response: {e}")))?;
        debug!(
            grant,
            rotated = token.refresh_token.is_some(),
            expires_in = token.expires_in,
            "token endpoint succeeded"
        );
        Ok(token)
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange_code<'a>(&'a self, exchange: CodeExchange<'a>) -> TokenFuture<'a> {
        Box::pin(async move {
            self.post_grant(
                "authorization_code",
                &[
                    ("code", exchange.code),
                    ("code_verifier", exchange.verifier),
                    ("redirect_uri", exchange.redirect_uri),
                ],
            )
            .await
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            self.post_grant("refresh_token", &[("refresh_token", refresh_token)])
                .await
        })
    }
}

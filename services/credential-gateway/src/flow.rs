//! OAuth Authorization-Code + PKCE handshake against the upstream provider
//!
//! Flow states per attempt: Idle → AwaitingCallback → Completed | Failed.
//! 1. `initiate` mints a verifier, its S256 challenge and an anti-CSRF state,
//!    and builds the upstream redirect. The caller keeps `{state, verifier}`
//!    server-side.
//! 2. `complete` runs on the callback after the caller has already purged
//!    the pending attempt: provider error → `UpstreamDenied`, missing or
//!    mismatched state → `InvalidState` (no token endpoint call), otherwise
//!    the code is exchanged and the session bundle persisted.
//!
//! The browser portal and the machine-client proxy login share this type
//! and differ only in redirect URI.

use std::sync::Arc;

use token_lifecycle::TokenManager;
use tracing::{info, instrument, warn};
use upstream_auth::pkce::{self, AuthorizationRequest};
use upstream_auth::{CodeExchange, TokenEndpoint};

use crate::error::GatewayError;
use crate::session::PendingLogin;

/// Which client population a login belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Portal,
    Machine,
}

impl Surface {
    pub fn label(&self) -> &'static str {
        match self {
            Surface::Portal => "portal",
            Surface::Machine => "machine",
        }
    }
}

/// Query parameters the provider sends to a callback.
#[derive(Debug, Default, serde::Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// An upstream redirect plus the secrets it must be matched against later.
pub struct LoginRedirect {
    pub url: String,
    pub pending: PendingLogin,
}

pub struct AuthorizationFlow {
    endpoint: Arc<dyn TokenEndpoint>,
    tokens: Arc<TokenManager>,
    authorization_endpoint: String,
    client_id: String,
    scopes: String,
    portal_redirect_uri: String,
    machine_redirect_uri: String,
}

impl AuthorizationFlow {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        tokens: Arc<TokenManager>,
        authorization_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        scopes: impl Into<String>,
        portal_redirect_uri: impl Into<String>,
        machine_redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            tokens,
            authorization_endpoint: authorization_endpoint.into(),
            client_id: client_id.into(),
            scopes: scopes.into(),
            portal_redirect_uri: portal_redirect_uri.into(),
            machine_redirect_uri: machine_redirect_uri.into(),
        }
    }

    pub fn redirect_uri(&self, surface: Surface) -> &str {
        match surface {
            Surface::Portal => &self.portal_redirect_uri,
            Surface::Machine => &self.machine_redirect_uri,
        }
    }

    /// Start an attempt: fresh verifier, challenge and state.
    pub fn initiate(&self, surface: Surface) -> Result<LoginRedirect, GatewayError> {
        let verifier = pkce::generate_verifier();
        let state = pkce::generate_state();
        let challenge = pkce::compute_challenge(&verifier);

        let url = pkce::build_authorization_url(
            &self.authorization_endpoint,
            &AuthorizationRequest {
                client_id: &self.client_id,
                redirect_uri: self.redirect_uri(surface),
                scope: &self.scopes,
                state: &state,
                code_challenge: &challenge,
            },
        )
        .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

        info!(surface = surface.label(), "authorization flow initiated");
        Ok(LoginRedirect {
            url,
            pending: PendingLogin {
                state,
                verifier,
                created_at: self.tokens.now(),
            },
        })
    }

    /// Finish an attempt and return the logged-in subject.
    ///
    /// `pending` must already have been removed from wherever the caller
    /// kept it, so a failed callback cannot be replayed.
    #[instrument(skip_all, fields(surface = surface.label()))]
    pub async fn complete(
        &self,
        surface: Surface,
        params: &CallbackParams,
        pending: Option<PendingLogin>,
    ) -> Result<String, GatewayError> {
        let result = self.complete_inner(surface, params, pending).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        crate::metrics::record_login(surface.label(), outcome);
        result
    }

    async fn complete_inner(
        &self,
        surface: Surface,
        params: &CallbackParams,
        pending: Option<PendingLogin>,
    ) -> Result<String, GatewayError> {
        if let Some(error) = &params.error {
            let detail = params.error_description.as_deref().unwrap_or_default();
            warn!(error = %error, "provider returned an authorization error");
            return Err(GatewayError::UpstreamDenied(
                format!("{error} {detail}").trim().to_owned(),
            ));
        }

        let pending = pending.ok_or_else(|| {
            GatewayError::InvalidState("no login in progress for this session (expired or already used)".into())
        })?;
        match params.state.as_deref() {
            None => return Err(GatewayError::InvalidState("callback carried no state".into())),
            Some(state) if !constant_time_eq(state, &pending.state) => {
                warn!("callback state does not match the stored login state");
                return Err(GatewayError::InvalidState("state mismatch".into()));
            }
            Some(_) => {}
        }
        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GatewayError::BadRequest("callback carried no authorization code".into()))?;

        self.exchange(surface, code, &pending.verifier).await
    }

    /// Exchange an authorization code and persist the resulting session.
    async fn exchange(
        &self,
        surface: Surface,
        code: &str,
        verifier: &str,
    ) -> Result<String, GatewayError> {
        let token = self
            .endpoint
            .exchange_code(CodeExchange {
                code,
                verifier,
                redirect_uri: self.redirect_uri(surface),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "code exchange failed");
                GatewayError::UpstreamUnavailable(e.to_string())
            })?;

        // The ID token came straight from the provider over TLS
        let claims = token
            .id_token
            .as_deref()
            .map(upstream_auth::claims::decode_unverified)
            .transpose()
            .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?
            .ok_or_else(|| {
                GatewayError::Unauthenticated("provider returned no identity token".into())
            })?;
        let subject = claims
            .subject()
            .ok_or_else(|| {
                GatewayError::Unauthenticated("identity token has neither sub nor email".into())
            })?
            .to_owned();

        self.tokens.store_new_session(&subject, token).await?;
        info!(subject = %subject, "login completed");
        Ok(subject)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

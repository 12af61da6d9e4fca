//! Request identity resolution
//!
//! Precedence: session cookie, then `Authorization: Bearer`. Bearer tokens
//! are checked against tokens this gateway issued (the token cache) before
//! HS256 development JWTs. Whatever carried the identity is resolved once
//! here into a `Subject`; handlers never look at claims again.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use common::Secret;
use tracing::debug;
use upstream_auth::{Claims, Hs256Verifier};

use crate::AppState;
use crate::error::GatewayError;

/// What authenticated a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    /// Subject stored in the browser's server-side session
    Session(String),
    /// Claims of a verified bearer token
    Bearer(Claims),
    /// Gateway-issued access token whose session carries no usable claims
    OpaqueClient(String),
}

impl Identity {
    /// Canonical subject. Bearer claims need `sub` or `email`.
    pub fn into_subject(self) -> Result<Subject, GatewayError> {
        match self {
            Identity::Session(subject) | Identity::OpaqueClient(subject) => Ok(Subject(subject)),
            Identity::Bearer(claims) => claims
                .subject()
                .map(|s| Subject(s.to_owned()))
                .ok_or_else(|| {
                    GatewayError::Unauthenticated("token has neither sub nor email claim".into())
                }),
        }
    }
}

/// The authenticated principal of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(pub String);

impl Subject {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// HS256 verification plus the scopes every bearer JWT must carry.
pub struct BearerPolicy {
    verifier: Hs256Verifier,
    required_scopes: Vec<String>,
}

impl BearerPolicy {
    pub fn new(
        secret: Secret<String>,
        issuer: Option<String>,
        audience: Option<String>,
        required_scopes: Vec<String>,
    ) -> Self {
        Self {
            verifier: Hs256Verifier::new(secret, issuer, audience),
            required_scopes,
        }
    }

    pub fn verifier(&self) -> &Hs256Verifier {
        &self.verifier
    }

    fn check(&self, token: &str, now: u64) -> Result<Claims, GatewayError> {
        let claims = self
            .verifier
            .verify(token, now)
            .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;
        let granted = claims.granted_scopes();
        if let Some(missing) = self
            .required_scopes
            .iter()
            .find(|required| !granted.contains(&required.as_str()))
        {
            return Err(GatewayError::PermissionDenied(format!(
                "token lacks required scope '{missing}'"
            )));
        }
        Ok(claims)
    }
}

/// Resolve the identity carried by a request.
pub async fn resolve(parts: &Parts, state: &AppState) -> Result<Identity, GatewayError> {
    if let Some(id) = state.sessions.session_id(&parts.headers) {
        if let Some(subject) = state.sessions.subject(&id).await {
            return Ok(Identity::Session(subject));
        }
    }

    let Some(token) = bearer_token(parts) else {
        return Err(GatewayError::Unauthenticated(
            "no session cookie or bearer token".into(),
        ));
    };

    if let Some(bundle) = state.tokens.bundle_for_access_token(token).await {
        debug!(subject = %bundle.subject, "bearer token issued by this gateway");
        return Ok(match bundle.id_claims() {
            Some(claims) if claims.subject().is_some() => Identity::Bearer(claims),
            _ => Identity::OpaqueClient(bundle.subject),
        });
    }

    match &state.bearer {
        Some(policy) => Ok(Identity::Bearer(policy.check(token, state.tokens.now())?)),
        None => Err(GatewayError::Unauthenticated(
            "bearer token not recognized".into(),
        )),
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for Subject {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        resolve(parts, state).await?.into_subject()
    }
}

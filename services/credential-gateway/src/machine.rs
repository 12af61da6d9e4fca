//! Machine-client proxy login and token endpoints
//!
//! The gateway stands in as the authorization server for tool-invocation
//! clients and relays the login to the upstream provider:
//!
//! 1. `GET /authorize` records the client's redirect URI, state and S256
//!    challenge under a fresh gateway state, then redirects upstream
//! 2. `GET /auth/callback` consumes that record, exchanges the upstream code
//!    and redirects back to the client with a one-time gateway code
//! 3. `POST /token` (`authorization_code`) checks the client's verifier
//!    against its challenge and hands out the session tokens;
//!    `refresh_token` behaves like `POST /token/refresh`
//!
//! Client registration and redirect-URI allow-listing happen elsewhere.

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use reqwest::Url;
use serde::Deserialize;
use token_lifecycle::SessionBundle;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use upstream_auth::pkce;

use crate::AppState;
use crate::body::JsonOrForm;
use crate::error::GatewayError;
use crate::flow::{CallbackParams, Surface};
use crate::session::PendingLogin;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/auth/callback", get(auth_callback))
        .route("/token", post(token))
        .route("/token/refresh", post(token_refresh))
}

/// A client login waiting for the upstream callback.
struct Transaction {
    upstream: PendingLogin,
    client_redirect_uri: String,
    client_state: Option<String>,
    client_challenge: String,
}

/// A completed upstream login waiting for the client to redeem its code.
struct Grant {
    subject: String,
    client_redirect_uri: String,
    client_challenge: String,
    created_at: u64,
}

/// Single-use transactions and gateway codes, both bounded by `ttl`.
pub struct MachineLogins {
    ttl: u64,
    transactions: Mutex<HashMap<String, Transaction>>,
    grants: Mutex<HashMap<String, Grant>>,
}

impl MachineLogins {
    pub fn new(ttl: u64) -> Self {
        Self {
            ttl,
            transactions: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
        }
    }

    async fn insert_transaction(&self, now: u64, txn: Transaction) {
        let mut transactions = self.transactions.lock().await;
        // Lazy cleanup of abandoned logins
        transactions.retain(|_, t| now.saturating_sub(t.upstream.created_at) < self.ttl);
        transactions.insert(txn.upstream.state.clone(), txn);
    }

    async fn take_transaction(&self, now: u64, state: &str) -> Option<Transaction> {
        let txn = self.transactions.lock().await.remove(state)?;
        (now.saturating_sub(txn.upstream.created_at) < self.ttl).then_some(txn)
    }

    async fn insert_grant(&self, now: u64, code: String, grant: Grant) {
        let mut grants = self.grants.lock().await;
        grants.retain(|_, g| now.saturating_sub(g.created_at) < self.ttl);
        grants.insert(code, grant);
    }

    async fn take_grant(&self, now: u64, code: &str) -> Option<Grant> {
        let grant = self.grants.lock().await.remove(code)?;
        (now.saturating_sub(grant.created_at) < self.ttl).then_some(grant)
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    redirect_uri: String,
    #[serde(default)]
    state: Option<String>,
    code_challenge: String,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

/// GET /authorize: start a relayed login for a machine client.
async fn authorize(
    State(state): State<AppState>,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, GatewayError> {
    let method = params.code_challenge_method.as_deref().unwrap_or("S256");
    if method != "S256" {
        return Err(GatewayError::BadRequest(format!(
            "unsupported code_challenge_method {method}"
        )));
    }
    if params.code_challenge.is_empty() {
        return Err(GatewayError::BadRequest("code_challenge is required".into()));
    }
    let client_redirect = Url::parse(&params.redirect_uri)
        .map_err(|e| GatewayError::BadRequest(format!("invalid redirect_uri: {e}")))?;
    if !matches!(client_redirect.scheme(), "http" | "https") {
        return Err(GatewayError::BadRequest(
            "redirect_uri must be http or https".into(),
        ));
    }

    let redirect = state.flow.initiate(Surface::Machine)?;
    state
        .machine
        .insert_transaction(
            state.tokens.now(),
            Transaction {
                upstream: redirect.pending,
                client_redirect_uri: params.redirect_uri,
                client_state: params.state,
                client_challenge: params.code_challenge,
            },
        )
        .await;

    Ok((StatusCode::FOUND, [(LOCATION, redirect.url)]).into_response())
}

/// GET /auth/callback: finish the upstream leg and bounce back to the client.
#[instrument(skip_all)]
async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let now = state.tokens.now();
    let txn = match params.state.as_deref() {
        Some(s) => state.machine.take_transaction(now, s).await,
        None => None,
    };
    let Some(txn) = txn else {
        // Nothing to redirect to without a transaction
        return state
            .flow
            .complete(Surface::Machine, &params, None)
            .await
            .err()
            .unwrap_or_else(|| GatewayError::InvalidState("unknown login state".into()))
            .into_html();
    };

    let subject = match state
        .flow
        .complete(Surface::Machine, &params, Some(txn.upstream))
        .await
    {
        Ok(subject) => subject,
        Err(e) => {
            let description = e.to_string();
            return client_redirect(
                &txn.client_redirect_uri,
                &[("error", e.kind()), ("error_description", description.as_str())],
                txn.client_state.as_deref(),
            );
        }
    };

    let code = pkce::generate_state();
    state
        .machine
        .insert_grant(
            now,
            code.clone(),
            Grant {
                subject: subject.clone(),
                client_redirect_uri: txn.client_redirect_uri.clone(),
                client_challenge: txn.client_challenge,
                created_at: now,
            },
        )
        .await;
    info!(subject = %subject, "issued gateway authorization code");

    client_redirect(
        &txn.client_redirect_uri,
        &[("code", code.as_str())],
        txn.client_state.as_deref(),
    )
}

fn client_redirect(base: &str, params: &[(&str, &str)], state: Option<&str>) -> Response {
    let mut url = match Url::parse(base) {
        Ok(url) => url,
        Err(e) => return GatewayError::BadRequest(format!("invalid redirect_uri: {e}")).into_html(),
    };
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in params {
            query.append_pair(k, v);
        }
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    (StatusCode::FOUND, [(LOCATION, String::from(url))]).into_response()
}

#[derive(Deserialize)]
struct TokenRequest {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

/// POST /token: `authorization_code` or `refresh_token` grant.
#[instrument(skip_all)]
async fn token(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<TokenRequest>,
) -> Result<Response, GatewayError> {
    match req.grant_type.as_str() {
        "authorization_code" => redeem_code(&state, &req).await,
        "refresh_token" => {
            let refresh_token = req
                .refresh_token
                .as_deref()
                .ok_or_else(|| GatewayError::BadRequest("refresh_token is required".into()))?;
            refresh(&state, refresh_token).await
        }
        other => Err(GatewayError::BadRequest(format!(
            "unsupported grant_type {other}"
        ))),
    }
}

async fn redeem_code(state: &AppState, req: &TokenRequest) -> Result<Response, GatewayError> {
    let (Some(code), Some(verifier)) = (req.code.as_deref(), req.code_verifier.as_deref()) else {
        return Err(GatewayError::BadRequest(
            "code and code_verifier are required".into(),
        ));
    };
    let grant = state
        .machine
        .take_grant(state.tokens.now(), code)
        .await
        .ok_or_else(|| GatewayError::InvalidState("unknown, used or expired code".into()))?;

    if req
        .redirect_uri
        .as_deref()
        .is_some_and(|uri| uri != grant.client_redirect_uri)
    {
        return Err(GatewayError::InvalidState("redirect_uri mismatch".into()));
    }
    if !pkce::verify_challenge(verifier, &grant.client_challenge) {
        warn!(subject = %grant.subject, "code_verifier does not match challenge");
        return Err(GatewayError::InvalidState("code_verifier mismatch".into()));
    }

    let bundle = state.tokens.ensure_fresh_access_token(&grant.subject).await?;
    Ok(token_response(&bundle, state.tokens.now()))
}

/// POST /token/refresh: refresh a session by its refresh token.
async fn token_refresh(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<RefreshRequest>,
) -> Result<Response, GatewayError> {
    refresh(&state, &req.refresh_token).await
}

async fn refresh(state: &AppState, refresh_token: &str) -> Result<Response, GatewayError> {
    let subject = state
        .tokens
        .subject_for_refresh_token(refresh_token)
        .await
        .ok_or_else(|| GatewayError::Unauthenticated("unknown refresh token".into()))?;
    let bundle = state.tokens.refresh(&subject, refresh_token).await?;
    Ok(token_response(&bundle, state.tokens.now()))
}

fn token_response(bundle: &SessionBundle, now: u64) -> Response {
    let body = serde_json::json!({
        "access_token": bundle.access_token,
        "token_type": bundle.token_type,
        "expires_in": bundle.remaining_secs(now),
        "refresh_token": bundle.refresh_token,
        "scope": bundle.scope,
    });
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json"), (CACHE_CONTROL, "no-store")],
        body.to_string(),
    )
        .into_response()
}

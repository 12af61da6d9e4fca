//! Shared fixtures for handler and flow tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::http::header::SET_COOKIE;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use metrics_exporter_prometheus::PrometheusBuilder;
use secret_store::MemoryStore;
use serde_json::Value;
use token_lifecycle::ManualClock;
use upstream_auth::{CodeExchange, TokenEndpoint, TokenFuture, TokenResponse};

use crate::AppState;
use crate::config::Config;

/// Fixed start time for the manual clock.
pub(crate) const T0: u64 = 1_700_000_000;

/// Unsigned JWT carrying only the identity claims the flow reads.
pub(crate) fn id_token(sub: Option<&str>, email: Option<&str>) -> String {
    let mut claims = serde_json::Map::new();
    if let Some(sub) = sub {
        claims.insert("sub".into(), Value::from(sub));
    }
    if let Some(email) = email {
        claims.insert("email".into(), Value::from(email));
    }
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(Value::Object(claims).to_string());
    format!("{header}.{body}.")
}

pub(crate) async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// `name=value` part of the response's Set-Cookie header.
pub(crate) fn cookie_from(response: &Response) -> String {
    response.headers()[SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_owned()
}

/// Counting fake of the provider's token endpoint.
///
/// Only `good-code` exchanges successfully; `rt-revoked` is rejected on
/// refresh. Refreshes are slow enough for concurrent callers to overlap.
pub(crate) struct StubUpstream {
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
    id_token: Mutex<String>,
}

impl StubUpstream {
    fn new() -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            id_token: Mutex::new(id_token(Some("user-1"), None)),
        }
    }

    pub(crate) fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id_token(&self, token: String) {
        *self.id_token.lock().unwrap() = token;
    }
}

impl TokenEndpoint for StubUpstream {
    fn exchange_code<'a>(&'a self, exchange: CodeExchange<'a>) -> TokenFuture<'a> {
        Box::pin(async move {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if exchange.code != "good-code" {
                return Err(upstream_auth::Error::TokenExchange(
                    "invalid_grant".into(),
                ));
            }
            Ok(TokenResponse {
                access_token: "at-login".into(),
                refresh_token: Some("rt-login".into()),
                expires_in: Some(3600),
                token_type: Some("Bearer".into()),
                scope: Some("openid email profile".into()),
                id_token: Some(self.id_token.lock().unwrap().clone()),
            })
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if refresh_token == "rt-revoked" {
                return Err(upstream_auth::Error::InvalidCredentials(
                    "invalid_grant".into(),
                ));
            }
            Ok(TokenResponse {
                access_token: format!("at-refreshed-{n}"),
                refresh_token: None,
                expires_in: Some(3600),
                token_type: Some("Bearer".into()),
                scope: None,
                id_token: None,
            })
        })
    }
}

pub(crate) fn test_config() -> Config {
    let mut config: Config = toml::from_str(
        r#"
[server]
base_url = "http://gateway.test"

[upstream]
client_id = "client-1"

[store]
backend = "memory"

[bearer]
issuer = "https://local-issuer"
audience = "credential-gateway"
"#,
    )
    .unwrap();
    config.upstream.client_secret = Some(Secret::new("client-secret".into()));
    config.session.secret = Some(Secret::new("0123456789abcdef0123456789abcdef".into()));
    config.bearer.jwt_secret = Some(Secret::new("test-jwt-secret".into()));
    config
}

/// Fully wired gateway over an in-memory store, a stub provider and a
/// manual clock.
pub(crate) struct Gateway {
    pub state: AppState,
    pub upstream: Arc<StubUpstream>,
    pub clock: Arc<ManualClock>,
}

impl Gateway {
    pub(crate) fn new() -> Self {
        Self::from_config(test_config())
    }

    pub(crate) fn with_required_scopes(scopes: &[&str]) -> Self {
        let mut config = test_config();
        config.bearer.required_scopes = scopes.iter().map(|s| s.to_string()).collect();
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Self {
        let upstream = Arc::new(StubUpstream::new());
        let clock = Arc::new(ManualClock::new(T0));
        let prometheus = PrometheusBuilder::new().build_recorder().handle();
        let state = AppState::new(
            &config,
            Arc::new(MemoryStore::new()),
            upstream.clone(),
            clock.clone(),
            prometheus,
        )
        .unwrap();
        Self {
            state,
            upstream,
            clock,
        }
    }

    pub(crate) fn router(&self) -> Router {
        crate::build_router(self.state.clone(), 100)
    }

    pub(crate) fn clock_now(&self) -> u64 {
        self.state.tokens.now()
    }

    /// Cookie header value for a freshly logged-in browser session.
    pub(crate) async fn login_cookie(&self, subject: &str) -> String {
        let id = self.state.sessions.log_in(None, subject).await;
        self.state
            .sessions
            .cookie(&id)
            .split(';')
            .next()
            .unwrap()
            .to_owned()
    }

    /// Persist an upstream session for `subject` that expires in an hour.
    pub(crate) async fn store_session(&self, subject: &str, access_token: &str, refresh_token: &str) {
        self.state
            .tokens
            .store_new_session(
                subject,
                TokenResponse {
                    access_token: access_token.into(),
                    refresh_token: Some(refresh_token.into()),
                    expires_in: Some(3600),
                    token_type: Some("Bearer".into()),
                    scope: None,
                    id_token: None,
                },
            )
            .await
            .unwrap();
    }
}

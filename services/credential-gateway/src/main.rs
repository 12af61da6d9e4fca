//! Credential Gateway
//!
//! Single-binary Rust service that:
//! 1. Logs browsers and machine clients in through an upstream OAuth
//!    provider (Authorization Code + PKCE)
//! 2. Keeps refresh-token-backed sessions alive without re-authentication
//! 3. Stores each subject's named platform credentials in a secret backend

mod backend;
mod body;
mod config;
mod error;
mod flow;
mod identity;
mod machine;
mod metrics;
mod portal;
mod session;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use profiles::ProfileManager;
use secret_store::SecretStore;
use token_lifecycle::{Clock, SystemClock, TokenManager};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream_auth::{HttpTokenEndpoint, TokenEndpoint};

use crate::config::Config;
use crate::flow::AuthorizationFlow;
use crate::identity::BearerPolicy;
use crate::machine::MachineLogins;
use crate::session::SessionStore;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    profiles: Arc<ProfileManager>,
    tokens: Arc<TokenManager>,
    flow: Arc<AuthorizationFlow>,
    sessions: Arc<SessionStore>,
    machine: Arc<MachineLogins>,
    bearer: Option<Arc<BearerPolicy>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AppState {
    /// Wire every component once. Nothing here is re-initialized later.
    fn new(
        config: &Config,
        store: Arc<dyn SecretStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
        prometheus: PrometheusHandle,
    ) -> common::Result<Self> {
        let session_secret = config
            .session
            .secret
            .as_ref()
            .ok_or_else(|| common::Error::MissingSecret("SESSION_SECRET".into()))?;

        let profiles = Arc::new(ProfileManager::new(store, config.profiles.max_profiles));
        let tokens = Arc::new(TokenManager::new(
            profiles.clone(),
            endpoint.clone(),
            clock.clone(),
            config.tokens.near_expiry_buffer_secs,
        ));
        let flow = Arc::new(AuthorizationFlow::new(
            endpoint,
            tokens.clone(),
            config.upstream.authorization_endpoint.clone(),
            config.upstream.client_id.clone(),
            config.upstream.scopes.clone(),
            config.portal_redirect_uri(),
            config.machine_redirect_uri(),
        ));
        let sessions = Arc::new(SessionStore::new(
            session_secret,
            config.session.max_age_secs,
            config.session.login_ttl_secs,
            config.server.base_url.starts_with("https://"),
            clock,
        )?);
        let bearer = config.bearer.jwt_secret.clone().map(|secret| {
            Arc::new(BearerPolicy::new(
                secret,
                config.bearer.issuer.clone(),
                config.bearer.audience.clone(),
                config.bearer.required_scopes.clone(),
            ))
        });

        Ok(Self {
            profiles,
            tokens,
            flow,
            sessions,
            machine: Arc::new(MachineLogins::new(config.session.login_ttl_secs)),
            bearer,
            prometheus,
            started_at: Instant::now(),
        })
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(portal::router())
        .merge(machine::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting credential-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.server.base_url,
        store_backend = config.store.backend.label(),
        max_profiles = config.profiles.max_profiles,
        near_expiry_buffer_secs = config.tokens.near_expiry_buffer_secs,
        bearer_jwt = config.bearer.jwt_secret.is_some(),
        "configuration loaded"
    );

    let store = backend::open(&config.store).await?;

    let client_secret = config
        .upstream
        .client_secret
        .clone()
        .context("upstream client secret missing")?;
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let endpoint: Arc<dyn TokenEndpoint> = Arc::new(HttpTokenEndpoint::new(
        http,
        config.upstream.token_endpoint.clone(),
        config.upstream.client_id.clone(),
        client_secret,
        Duration::from_secs(config.upstream.timeout_secs),
    ));

    let app_state = AppState::new(
        &config,
        store,
        endpoint,
        Arc::new(SystemClock),
        prometheus_handle,
    )
    .context("failed to initialize gateway state")?;

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the
    // timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness plus a few gauges an operator wants at a glance.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "store_backend": state.profiles.backend(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_sessions": state.sessions.active_sessions().await,
    });
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

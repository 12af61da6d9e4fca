//! Browser portal: login, logout and credential profile management
//!
//! Endpoints:
//! - GET    /                  minimal home page
//! - GET    /login             start the authorization flow (302 upstream)
//! - GET    /callback          finish it (302 home, or an error page)
//! - GET    /logout            drop the server session
//! - GET    /session           subject and OAuth session state
//! - POST   /credentials       create or update a profile
//! - GET    /profiles          list profiles
//! - DELETE /profiles/{name}   delete a profile

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use profiles::SaveOutcome;
use secret_store::Payload;
use serde::Deserialize;
use token_lifecycle::SessionState;
use tracing::{info, instrument, warn};

use crate::AppState;
use crate::body::JsonOrForm;
use crate::error::{GatewayError, html_escape};
use crate::flow::{CallbackParams, Surface};
use crate::identity::Subject;
use crate::metrics::record_profile_operation;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(home))
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/logout", get(logout))
        .route("/session", get(session))
        .route("/credentials", post(save_credentials))
        .route("/profiles", get(list_profiles))
        .route("/profiles/{name}", delete(delete_profile))
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

async fn home(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let subject = match state.sessions.session_id(&headers) {
        Some(id) => state.sessions.subject(&id).await,
        None => None,
    };
    let body = match subject {
        Some(subject) => format!(
            "<p>Signed in as <strong>{}</strong>.</p>\
             <p><a href=\"/profiles\">Profiles</a> · <a href=\"/logout\">Sign out</a></p>",
            html_escape(&subject)
        ),
        None => "<p><a href=\"/login\">Sign in</a></p>".to_owned(),
    };
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/html; charset=utf-8")],
        format!(
            "<!doctype html><html><head><title>Credential gateway</title></head>\
             <body><h1>Credential gateway</h1>{body}</body></html>"
        ),
    )
        .into_response()
}

/// GET /login: store `{state, verifier}` in the session and redirect upstream.
async fn login(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let redirect = match state.flow.initiate(Surface::Portal) {
        Ok(redirect) => redirect,
        Err(e) => return e.into_html(),
    };
    let existing = state.sessions.session_id(&headers);
    let id = state
        .sessions
        .begin_login(existing.as_deref(), redirect.pending)
        .await;

    (
        StatusCode::FOUND,
        [
            (LOCATION, redirect.url),
            (SET_COOKIE, state.sessions.cookie(&id)),
        ],
    )
        .into_response()
}

/// GET /callback: purge the pending login first, then validate and exchange.
#[instrument(skip_all)]
async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let session_id = state.sessions.session_id(&headers);
    let pending = match &session_id {
        Some(id) => state.sessions.take_pending(id).await,
        None => None,
    };

    match state.flow.complete(Surface::Portal, &params, pending).await {
        Ok(subject) => {
            let id = state.sessions.log_in(session_id.as_deref(), &subject).await;
            (
                StatusCode::FOUND,
                [
                    (LOCATION, "/".to_owned()),
                    (SET_COOKIE, state.sessions.cookie(&id)),
                ],
            )
                .into_response()
        }
        Err(e) => e.into_html(),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(id) = state.sessions.session_id(&headers) {
        state.sessions.log_out(&id).await;
        info!("session logged out");
    }
    (
        StatusCode::FOUND,
        [
            (LOCATION, "/".to_owned()),
            (SET_COOKIE, state.sessions.clear_cookie()),
        ],
    )
        .into_response()
}

/// GET /session: refresh if needed, then report where the session stands.
#[instrument(skip_all, fields(subject = %subject.as_str()))]
async fn session(State(state): State<AppState>, subject: Subject) -> Result<Response, GatewayError> {
    let expires_at = match state.tokens.ensure_fresh_access_token(subject.as_str()).await {
        Ok(bundle) => Some(bundle.expires_at),
        Err(token_lifecycle::Error::Invalid(_)) => None,
        Err(token_lifecycle::Error::UpstreamUnavailable(e)) => {
            warn!(error = %e, "refresh failed, reporting current state");
            None
        }
        Err(e) => return Err(e.into()),
    };
    let session_state = state.tokens.state(subject.as_str()).await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({
            "subject": subject.as_str(),
            "session_state": session_state.label(),
            "reauthentication_required": matches!(session_state, SessionState::Invalid | SessionState::NoSession),
            "expires_at": expires_at,
        }),
    ))
}

#[derive(Deserialize)]
struct SaveCredentials {
    profile_name: String,
    /// Every other field is the opaque profile payload
    #[serde(flatten)]
    fields: Payload,
}

/// POST /credentials: create or update one of the subject's profiles.
async fn save_credentials(
    State(state): State<AppState>,
    subject: Subject,
    JsonOrForm(body): JsonOrForm<SaveCredentials>,
) -> Result<Response, GatewayError> {
    let name = body.profile_name.trim();
    if body.fields.is_empty() {
        record_profile_operation("save", "invalid");
        return Err(GatewayError::BadRequest(
            "profile payload must contain at least one field".into(),
        ));
    }

    match state
        .profiles
        .create_or_update(subject.as_str(), name, &body.fields)
        .await
    {
        Ok(outcome) => {
            record_profile_operation("save", outcome.label());
            let verb = match outcome {
                SaveOutcome::Created => "created",
                SaveOutcome::Updated => "updated",
            };
            Ok(json(
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "message": format!("Profile '{name}' {verb}"),
                }),
            ))
        }
        Err(e) => {
            let e = GatewayError::from(e);
            record_profile_operation("save", e.kind());
            Err(e)
        }
    }
}

/// GET /profiles: names and timestamps only, never payloads.
async fn list_profiles(
    State(state): State<AppState>,
    subject: Subject,
) -> Result<Response, GatewayError> {
    let entries = state.profiles.list(subject.as_str()).await?;
    record_profile_operation("list", "success");
    let profiles: Vec<_> = entries
        .iter()
        .map(|e| serde_json::json!({ "name": e.profile, "updated_at": e.updated_at }))
        .collect();
    Ok(json(
        StatusCode::OK,
        serde_json::json!({
            "profiles": profiles,
            "max_profiles": state.profiles.max_profiles(),
        }),
    ))
}

async fn delete_profile(
    State(state): State<AppState>,
    subject: Subject,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    match state.profiles.delete(subject.as_str(), &name).await {
        Ok(()) => {
            record_profile_operation("delete", "success");
            Ok(json(
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "message": format!("Profile '{name}' deleted"),
                }),
            ))
        }
        Err(e) => {
            let e = GatewayError::from(e);
            record_profile_operation("delete", e.kind());
            Err(e)
        }
    }
}

//! Request-level error taxonomy
//!
//! Every handler failure funnels into `GatewayError`. JSON clients get
//! `{"error": {"type", "message"}}`; the browser callback gets a short HTML
//! page telling the user to start over. Messages carry subject and profile
//! identifiers and backend diagnostics only, never credential values.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Login state missing, expired, or not matching the callback
    #[error("invalid login state: {0}")]
    InvalidState(String),

    #[error("identity provider denied the request: {0}")]
    UpstreamDenied(String),

    #[error("identity provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid profile name: {0}")]
    InvalidName(String),

    #[error("profile limit reached: at most {limit} profiles per user")]
    ProfileLimitExceeded { limit: usize },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("authentication required: {0}")]
    Unauthenticated(String),

    /// Session exists but can no longer be used; the user must log in again
    #[error("session invalid, re-authentication required: {0}")]
    Invalid(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("secret store unavailable: {0}")]
    BackendUnavailable(String),

    #[error("secret store refused access: {0}")]
    BackendPermissionDenied(String),
}

impl GatewayError {
    /// Stable machine-readable class.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidState(_) => "invalid_state",
            GatewayError::UpstreamDenied(_) => "upstream_denied",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::InvalidName(_) => "invalid_name",
            GatewayError::ProfileLimitExceeded { .. } => "profile_limit_exceeded",
            GatewayError::PermissionDenied(_) => "permission_denied",
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::Invalid(_) => "reauthentication_required",
            GatewayError::BadRequest(_) => "invalid_request",
            GatewayError::BackendUnavailable(_) => "backend_unavailable",
            GatewayError::BackendPermissionDenied(_) => "backend_permission_denied",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidState(_)
            | GatewayError::NotFound(_)
            | GatewayError::InvalidName(_)
            | GatewayError::ProfileLimitExceeded { .. }
            | GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated(_) | GatewayError::Invalid(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamDenied(_) | GatewayError::PermissionDenied(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendPermissionDenied(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// HTML rendering for browser-facing flow endpoints.
    pub fn into_html(self) -> Response {
        self.log();
        let status = self.status();
        let body = format!(
            "<!doctype html><html><head><title>Sign-in failed</title></head><body>\
             <h1>Sign-in failed</h1><p>{}</p><p><code>{}</code></p>\
             <p><a href=\"/login\">Start over</a></p></body></html>",
            html_escape(&self.to_string()),
            self.kind()
        );
        (status, [(CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
    }

    fn log(&self) {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "request failed");
        } else {
            warn!(kind = self.kind(), error = %self, "request rejected");
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.log();
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        (
            self.status(),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<secret_store::Error> for GatewayError {
    fn from(e: secret_store::Error) -> Self {
        match e {
            secret_store::Error::NotFound(what) => GatewayError::NotFound(what),
            secret_store::Error::InvalidKey(msg) => GatewayError::BadRequest(msg),
            secret_store::Error::PermissionDenied(msg) => GatewayError::BackendPermissionDenied(msg),
            secret_store::Error::BackendUnavailable(msg) => GatewayError::BackendUnavailable(msg),
        }
    }
}

impl From<profiles::Error> for GatewayError {
    fn from(e: profiles::Error) -> Self {
        match e {
            profiles::Error::InvalidName(msg) => GatewayError::InvalidName(msg),
            profiles::Error::ProfileLimitExceeded { limit } => {
                GatewayError::ProfileLimitExceeded { limit }
            }
            profiles::Error::NotFound(name) => GatewayError::NotFound(format!("profile '{name}'")),
            profiles::Error::Store(e) => e.into(),
        }
    }
}

impl From<token_lifecycle::Error> for GatewayError {
    fn from(e: token_lifecycle::Error) -> Self {
        match e {
            token_lifecycle::Error::Invalid(msg) => GatewayError::Invalid(msg),
            token_lifecycle::Error::UpstreamUnavailable(msg) => {
                GatewayError::UpstreamUnavailable(msg)
            }
            token_lifecycle::Error::Profile(e) => e.into(),
        }
    }
}

/// Minimal escaping for text interpolated into HTML.
pub fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn json_body_carries_type_and_message() {
        let response = GatewayError::ProfileLimitExceeded { limit: 10 }.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "profile_limit_exceeded");
        assert_eq!(
            json["error"]["message"],
            "profile limit reached: at most 10 profiles per user"
        );
    }

    #[test]
    fn status_mapping_follows_error_class() {
        assert_eq!(
            GatewayError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::Invalid("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::PermissionDenied("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::NotFound("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::UpstreamUnavailable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::BackendUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn store_errors_map_to_operational_classes() {
        let err: GatewayError = profiles::Error::Store(secret_store::Error::BackendUnavailable(
            "connection refused".into(),
        ))
        .into();
        assert_eq!(err.kind(), "backend_unavailable");
        assert!(err.to_string().contains("connection refused"));

        let err: GatewayError = profiles::Error::NotFound("prod".into()).into();
        assert_eq!(err.kind(), "not_found");
        assert!(err.to_string().contains("prod"));
    }

    #[test]
    fn lifecycle_errors_map_to_reauthentication() {
        let err: GatewayError = token_lifecycle::Error::Invalid("refresh rejected".into()).into();
        assert_eq!(err.kind(), "reauthentication_required");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn html_page_escapes_message() {
        let response = GatewayError::UpstreamDenied("<script>x</script>".into()).into_html();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("upstream_denied"));
        assert!(html.contains("/login"));
    }
}

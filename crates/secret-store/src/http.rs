//! Shared HTTP plumbing for the cloud backends

use std::time::Duration;

use reqwest::StatusCode;

use crate::error::Error;

/// Per-request timeout for secret manager calls.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn client() -> Result<reqwest::Client, Error> {
    client_with_timeout(REQUEST_TIMEOUT)
}

fn client_with_timeout(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::BackendUnavailable(format!("building HTTP client: {e}")))
}

/// Map a non-success response to a store error.
///
/// The body is kept for operators but truncated; backend error bodies never
/// carry secret values.
pub(crate) fn classify_status(status: StatusCode, context: &str, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(context.to_owned()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::PermissionDenied(format!("{context}: HTTP {status}: {snippet}"))
        }
        _ => Error::BackendUnavailable(format!("{context}: HTTP {status}: {snippet}")),
    }
}

pub(crate) fn transport(context: &str, e: reqwest::Error) -> Error {
    Error::BackendUnavailable(format!("{context}: {e}"))
}

/// Read a response, returning the body on success and a classified error otherwise.
pub(crate) async fn expect_success(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, context, &body))
}

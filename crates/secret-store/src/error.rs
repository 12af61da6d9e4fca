//! Error types for secret store operations

/// Errors from secret store backends.
///
/// Backends classify every failure into one of these kinds so callers can
/// tell an expected miss (`NotFound`) from an operational fault without
/// inspecting messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("secret backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied by secret backend: {0}")]
    PermissionDenied(String),

    #[error("cannot encode secret key: {0}")]
    InvalidKey(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result alias for secret store operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for session lifecycle operations

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable session; the caller must run the authorization flow again.
    #[error("session invalid, re-authentication required: {0}")]
    Invalid(String),

    /// The provider could not be reached or answered with a server error.
    #[error("identity provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Profile(#[from] profiles::Error),
}

/// Result alias for session lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

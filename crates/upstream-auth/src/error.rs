//! Error types for upstream OAuth operations

/// Errors from upstream OAuth operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure or timeout; the request may be retried.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Non-success status or malformed body from the token endpoint.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The provider rejected the grant (revoked, expired, or reused).
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid token claims: {0}")]
    Claims(String),
}

/// Result alias for upstream OAuth operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for profile operations

/// Errors from profile operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid profile name: {0}")]
    InvalidName(String),

    #[error("profile limit reached: at most {limit} profiles per user")]
    ProfileLimitExceeded { limit: usize },

    #[error("profile not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(secret_store::Error),
}

impl From<secret_store::Error> for Error {
    fn from(e: secret_store::Error) -> Self {
        match e {
            secret_store::Error::NotFound(what) => Error::NotFound(what),
            other => Error::Store(other),
        }
    }
}

/// Result alias for profile operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Shared types for the credential gateway workspace

mod error;
mod keyed;
mod secret;

pub use error::{Error, Result};
pub use keyed::{KeyedGuard, KeyedLocks};
pub use secret::Secret;

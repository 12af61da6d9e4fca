//! Refresh-token-backed OAuth sessions
//!
//! Session lifecycle per subject:
//! 1. Code exchange succeeds → bundle persisted as the subject's system
//!    profile, cached in memory, state `Valid`
//! 2. `now + buffer >= expires_at` → `NearExpiry`
//! 3. `ensure_fresh_access_token` refreshes under a per-subject single-flight
//!    guard (`Refreshing`); concurrent callers wait and reuse the result
//! 4. Provider rejects the refresh token or the access token → `Invalid`
//!    until the subject logs in again
//!
//! The secret store is the source of truth. The cache is a read mirror that
//! is only updated after a write-through succeeds.

pub mod bundle;
pub mod clock;
pub mod error;
pub mod manager;

pub use bundle::SessionBundle;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use manager::{DEFAULT_NEAR_EXPIRY_BUFFER_SECS, SessionState, TokenManager};

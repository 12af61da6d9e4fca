//! Credential profile policy over a `SecretStore`
//!
//! Each subject owns up to `max_profiles` named profiles of downstream
//! platform credentials. One extra name per subject, `SYSTEM_PROFILE`, holds
//! the subject's OAuth session bundle; it is invisible to list/get/delete and
//! cannot be written through `create_or_update`. Only the token lifecycle
//! layer reaches it, through `get_system_bundle` / `put_system_bundle`.

pub mod error;
pub mod manager;

pub use error::{Error, Result};
pub use manager::{
    DEFAULT_MAX_PROFILES, MAX_PROFILE_NAME_LEN, ProfileManager, SYSTEM_PROFILE, SaveOutcome,
};

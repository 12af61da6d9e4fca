//! Profile cap and reserved-name enforcement

use std::sync::Arc;

use common::KeyedLocks;
use secret_store::{Payload, ProfileEntry, SecretStore};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Reserved profile holding a subject's OAuth session bundle.
pub const SYSTEM_PROFILE: &str = "_oauth_tokens";

/// Default cap on user-created profiles per subject.
pub const DEFAULT_MAX_PROFILES: usize = 10;

pub const MAX_PROFILE_NAME_LEN: usize = 64;

/// Whether `create_or_update` added a profile or replaced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
}

impl SaveOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SaveOutcome::Created => "created",
            SaveOutcome::Updated => "updated",
        }
    }
}

pub struct ProfileManager {
    store: Arc<dyn SecretStore>,
    max_profiles: usize,
    // Serializes count-then-put per subject so two concurrent creates can't
    // both squeeze under the cap
    create_guards: KeyedLocks,
}

impl ProfileManager {
    pub fn new(store: Arc<dyn SecretStore>, max_profiles: usize) -> Self {
        Self {
            store,
            max_profiles,
            create_guards: KeyedLocks::new(),
        }
    }

    pub fn max_profiles(&self) -> usize {
        self.max_profiles
    }

    /// Backend label of the underlying store.
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Reject names the user-facing surface may not use.
    pub fn validate_profile_name(name: &str) -> Result<()> {
        if name == SYSTEM_PROFILE {
            return Err(Error::InvalidName(format!("'{name}' is reserved")));
        }
        if name.trim().is_empty() {
            return Err(Error::InvalidName("profile name must not be empty".into()));
        }
        if name.chars().count() > MAX_PROFILE_NAME_LEN {
            return Err(Error::InvalidName(format!(
                "profile name longer than {MAX_PROFILE_NAME_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Create a new profile or replace an existing one.
    ///
    /// New names fail `ProfileLimitExceeded` once the subject already has
    /// `max_profiles` user profiles; updates to existing names always pass.
    pub async fn create_or_update(
        &self,
        subject: &str,
        name: &str,
        payload: &Payload,
    ) -> Result<SaveOutcome> {
        Self::validate_profile_name(name)?;

        let _held = self.create_guards.lock(subject).await;

        let existing = self.store.list(subject).await?;
        let exists = existing.iter().any(|e| e.profile == name);
        if !exists {
            let count = existing
                .iter()
                .filter(|e| e.profile != SYSTEM_PROFILE)
                .count();
            if count >= self.max_profiles {
                info!(subject, profile = name, count, "profile limit reached");
                return Err(Error::ProfileLimitExceeded {
                    limit: self.max_profiles,
                });
            }
        }

        self.store.put(subject, name, payload).await?;
        let outcome = if exists {
            SaveOutcome::Updated
        } else {
            SaveOutcome::Created
        };
        info!(subject, profile = name, outcome = outcome.label(), "saved profile");
        Ok(outcome)
    }

    /// User profiles of `subject`, in store order, without the system entry.
    pub async fn list(&self, subject: &str) -> Result<Vec<ProfileEntry>> {
        let mut entries = self.store.list(subject).await?;
        entries.retain(|e| e.profile != SYSTEM_PROFILE);
        Ok(entries)
    }

    /// Payload of one user profile, for handing to platform calls.
    pub async fn get(&self, subject: &str, name: &str) -> Result<Payload> {
        Self::validate_profile_name(name)?;
        self.store
            .get(subject, name)
            .await
            .map_err(|e| not_found_as(e, name))
    }

    pub async fn delete(&self, subject: &str, name: &str) -> Result<()> {
        Self::validate_profile_name(name)?;
        self.store
            .delete(subject, name)
            .await
            .map_err(|e| not_found_as(e, name))?;
        info!(subject, profile = name, "deleted profile");
        Ok(())
    }

    /// Stored OAuth session bundle, `None` if the subject never logged in.
    pub async fn get_system_bundle(&self, subject: &str) -> Result<Option<Payload>> {
        match self.store.get(subject, SYSTEM_PROFILE).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::Store(e)),
        }
    }

    pub async fn put_system_bundle(&self, subject: &str, bundle: &Payload) -> Result<()> {
        self.store
            .put(subject, SYSTEM_PROFILE, bundle)
            .await
            .map_err(Error::Store)?;
        debug!(subject, "persisted session bundle");
        Ok(())
    }
}

fn not_found_as(e: secret_store::Error, name: &str) -> Error {
    if e.is_not_found() {
        Error::NotFound(name.to_owned())
    } else {
        Error::from(e)
    }
}

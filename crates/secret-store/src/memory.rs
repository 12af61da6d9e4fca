//! In-process secret store
//!
//! Nothing survives a restart. Used by tests and by dev instances started
//! with `backend = "memory"`.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::{Payload, ProfileEntry, SecretStore, StoreFuture, unix_now};

#[derive(Debug, Clone)]
struct Stored {
    payload: Payload,
    updated_at: u64,
}

/// Process-local `SecretStore` keyed by `(subject, profile)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(String, String), Stored>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn put<'a>(
        &'a self,
        subject: &'a str,
        profile: &'a str,
        payload: &'a Payload,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            entries.insert(
                (subject.to_owned(), profile.to_owned()),
                Stored {
                    payload: payload.clone(),
                    updated_at: unix_now(),
                },
            );
            debug!(subject, profile, "stored secret in memory");
            Ok(())
        })
    }

    fn get<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, Payload> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            entries
                .get(&(subject.to_owned(), profile.to_owned()))
                .map(|stored| stored.payload.clone())
                .ok_or_else(|| Error::NotFound(format!("profile '{profile}'")))
        })
    }

    fn list<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Vec<ProfileEntry>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            // BTreeMap keys are (subject, profile), so this is already sorted
            Ok(entries
                .iter()
                .filter(|((owner, _), _)| owner == subject)
                .map(|((_, profile), stored)| ProfileEntry {
                    profile: profile.clone(),
                    updated_at: stored.updated_at,
                })
                .collect())
        })
    }

    fn delete<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            entries
                .remove(&(subject.to_owned(), profile.to_owned()))
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("profile '{profile}'")))
        })
    }
}

//! Session cache, near-expiry detection and single-flight refresh

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use common::KeyedLocks;
use profiles::ProfileManager;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use upstream_auth::{TokenEndpoint, TokenResponse};

use crate::bundle::SessionBundle;
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Refresh this many seconds before the access token expires.
pub const DEFAULT_NEAR_EXPIRY_BUFFER_SECS: u64 = 300;

/// Observable lifecycle state of a subject's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Valid,
    NearExpiry,
    Refreshing,
    Invalid,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::NoSession => "none",
            SessionState::Valid => "valid",
            SessionState::NearExpiry => "near_expiry",
            SessionState::Refreshing => "refreshing",
            SessionState::Invalid => "invalid",
        }
    }
}

/// Owns every subject's OAuth session bundle.
///
/// Built once at startup and shared as `Arc<TokenManager>`.
pub struct TokenManager {
    profiles: Arc<ProfileManager>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    near_expiry_buffer: u64,
    cache: RwLock<HashMap<String, SessionBundle>>,
    invalid: RwLock<HashSet<String>>,
    refreshing: Mutex<HashSet<String>>,
    refresh_guards: KeyedLocks,
}

impl TokenManager {
    pub fn new(
        profiles: Arc<ProfileManager>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
        near_expiry_buffer: u64,
    ) -> Self {
        Self {
            profiles,
            endpoint,
            clock,
            near_expiry_buffer,
            cache: RwLock::new(HashMap::new()),
            invalid: RwLock::new(HashSet::new()),
            refreshing: Mutex::new(HashSet::new()),
            refresh_guards: KeyedLocks::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    pub fn near_expiry_buffer(&self) -> u64 {
        self.near_expiry_buffer
    }

    /// Persist the tokens from a successful code exchange.
    ///
    /// NoSession/Invalid → Valid. The store write completes before the cache
    /// is touched, so a restart never loses an acknowledged session.
    pub async fn store_new_session(&self, subject: &str, token: TokenResponse) -> Result<SessionBundle> {
        let bundle = SessionBundle::from_token_response(subject, token, self.now());
        self.write_through(&bundle).await?;
        self.invalid.write().await.remove(subject);
        info!(
            subject,
            expires_at = bundle.expires_at,
            has_refresh_token = bundle.refresh_token.is_some(),
            "stored new session"
        );
        Ok(bundle)
    }

    pub fn is_near_expiry(&self, bundle: &SessionBundle) -> bool {
        bundle.is_near_expiry(self.now(), self.near_expiry_buffer)
    }

    /// Current session bundle: cache first, then the store.
    pub async fn bundle(&self, subject: &str) -> Result<Option<SessionBundle>> {
        if let Some(bundle) = self.cache.read().await.get(subject) {
            return Ok(Some(bundle.clone()));
        }
        let Some(payload) = self.profiles.get_system_bundle(subject).await? else {
            return Ok(None);
        };
        let bundle = SessionBundle::from_payload(payload)?;
        debug!(subject, "loaded session from store");
        self.cache
            .write()
            .await
            .insert(subject.to_owned(), bundle.clone());
        Ok(Some(bundle))
    }

    pub async fn state(&self, subject: &str) -> Result<SessionState> {
        if self.is_refreshing(subject) {
            return Ok(SessionState::Refreshing);
        }
        if self.invalid.read().await.contains(subject) {
            return Ok(SessionState::Invalid);
        }
        Ok(match self.bundle(subject).await {
            Ok(None) => SessionState::NoSession,
            Ok(Some(bundle)) if self.is_near_expiry(&bundle) => SessionState::NearExpiry,
            Ok(Some(_)) => SessionState::Valid,
            Err(Error::Invalid(_)) => SessionState::Invalid,
            Err(e) => return Err(e),
        })
    }

    /// Bundle whose access token is good for at least the near-expiry buffer.
    ///
    /// Refreshes at most once per subject no matter how many callers arrive
    /// together: latecomers wait on the subject's guard, then find the
    /// refreshed bundle in the cache.
    pub async fn ensure_fresh_access_token(&self, subject: &str) -> Result<SessionBundle> {
        self.reject_if_invalid(subject).await?;
        let bundle = self
            .bundle(subject)
            .await?
            .ok_or_else(|| Error::Invalid("no session for subject".into()))?;
        if !self.is_near_expiry(&bundle) {
            return Ok(bundle);
        }

        let _singleflight = self.refresh_guards.lock(subject).await;

        // Another caller may have refreshed or invalidated while we waited
        self.reject_if_invalid(subject).await?;
        let current = self
            .bundle(subject)
            .await?
            .ok_or_else(|| Error::Invalid("no session for subject".into()))?;
        if !self.is_near_expiry(&current) {
            debug!(subject, "reusing refresh performed by concurrent caller");
            return Ok(current);
        }
        self.refresh_locked(current).await
    }

    /// Explicit client refresh with the refresh token the client presented.
    ///
    /// Clients racing with the same token share one upstream refresh: if the
    /// session moved on while this caller waited for the guard, the current
    /// bundle is returned instead of spending the token again.
    pub async fn refresh(&self, subject: &str, presented: &str) -> Result<SessionBundle> {
        self.reject_if_invalid(subject).await?;
        let observed = self
            .bundle(subject)
            .await?
            .ok_or_else(|| Error::Invalid("no session for subject".into()))?;
        let _singleflight = self.refresh_guards.lock(subject).await;

        self.reject_if_invalid(subject).await?;
        let current = self
            .bundle(subject)
            .await?
            .ok_or_else(|| Error::Invalid("no session for subject".into()))?;
        let refreshed_meanwhile = current.access_token != observed.access_token
            || current.refresh_token.as_deref() != Some(presented);
        if refreshed_meanwhile {
            debug!(subject, "reusing refresh performed by concurrent caller");
            return Ok(current);
        }
        self.refresh_locked(current).await
    }

    /// Mark the session unusable after the provider rejected its access
    /// token. The subject stays `Invalid` until the next login.
    pub async fn invalidate(&self, subject: &str) {
        self.invalid.write().await.insert(subject.to_owned());
        self.cache.write().await.remove(subject);
        warn!(subject, "session invalidated, re-authentication required");
    }

    /// Owner of a refresh token, looked up in the cache only.
    pub async fn subject_for_refresh_token(&self, refresh_token: &str) -> Option<String> {
        self.cache
            .read()
            .await
            .values()
            .find(|b| b.refresh_token.as_deref() == Some(refresh_token))
            .map(|b| b.subject.clone())
    }

    /// Unexpired cached bundle issued with `access_token`.
    pub async fn bundle_for_access_token(&self, access_token: &str) -> Option<SessionBundle> {
        let now = self.now();
        let cache = self.cache.read().await;
        let bundle = cache.values().find(|b| b.access_token == access_token)?;
        if bundle.is_expired(now) {
            return None;
        }
        Some(bundle.clone())
    }

    async fn refresh_locked(&self, current: SessionBundle) -> Result<SessionBundle> {
        let subject = current.subject.clone();
        let Some(refresh_token) = current.refresh_token.clone() else {
            record_refresh("no_refresh_token");
            self.invalidate(&subject).await;
            return Err(Error::Invalid("session has no refresh token".into()));
        };

        let result = {
            let _mark = RefreshingMark::new(&self.refreshing, &subject);
            self.endpoint.refresh(&refresh_token).await
        };

        match result {
            Ok(token) => {
                let bundle = current.merge_refresh(token, self.now());
                self.write_through(&bundle).await?;
                record_refresh("success");
                info!(
                    subject = %subject,
                    expires_at = bundle.expires_at,
                    rotated = bundle.refresh_token.as_deref() != Some(refresh_token.as_str()),
                    "refreshed session"
                );
                Ok(bundle)
            }
            Err(upstream_auth::Error::InvalidCredentials(msg)) => {
                record_refresh("rejected");
                warn!(subject = %subject, error = %msg, "refresh token rejected");
                self.invalidate(&subject).await;
                Err(Error::Invalid("refresh token rejected by provider".into()))
            }
            Err(e) => {
                record_refresh("upstream_error");
                warn!(subject = %subject, error = %e, "refresh failed");
                Err(Error::UpstreamUnavailable(e.to_string()))
            }
        }
    }

    async fn write_through(&self, bundle: &SessionBundle) -> Result<()> {
        let payload = bundle.to_payload()?;
        self.profiles
            .put_system_bundle(&bundle.subject, &payload)
            .await?;
        self.cache
            .write()
            .await
            .insert(bundle.subject.clone(), bundle.clone());
        Ok(())
    }

    async fn reject_if_invalid(&self, subject: &str) -> Result<()> {
        if self.invalid.read().await.contains(subject) {
            return Err(Error::Invalid("session was invalidated".into()));
        }
        Ok(())
    }

    fn is_refreshing(&self, subject: &str) -> bool {
        self.refreshing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(subject)
    }
}

/// Marks a subject `Refreshing` for as long as it lives, including when the
/// refreshing future is dropped mid-flight.
struct RefreshingMark<'a> {
    set: &'a Mutex<HashSet<String>>,
    subject: &'a str,
}

impl<'a> RefreshingMark<'a> {
    fn new(set: &'a Mutex<HashSet<String>>, subject: &'a str) -> Self {
        set.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subject.to_owned());
        Self { set, subject }
    }
}

impl Drop for RefreshingMark<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(self.subject);
    }
}

fn record_refresh(outcome: &'static str) {
    metrics::counter!("gateway_token_refresh_total", "outcome" => outcome).increment(1);
}

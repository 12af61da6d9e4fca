//! Server-side browser sessions
//!
//! The cookie carries only a random session id plus an HMAC over it; the
//! subject and any in-progress login (PKCE state + verifier) stay in memory
//! on the server. The id is rotated when a login completes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use token_lifecycle::Clock;
use tokio::sync::Mutex;
use tracing::debug;

pub const SESSION_COOKIE: &str = "gateway_session";

type HmacSha256 = Hmac<Sha256>;

/// An authorization attempt waiting for its callback. Single-use.
#[derive(Clone)]
pub struct PendingLogin {
    pub state: String,
    pub verifier: String,
    pub created_at: u64,
}

impl std::fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLogin")
            .field("state", &self.state)
            .field("verifier", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

struct SessionRecord {
    subject: Option<String>,
    pending: Option<PendingLogin>,
    created_at: u64,
}

pub struct SessionStore {
    mac: HmacSha256,
    max_age: u64,
    login_ttl: u64,
    secure: bool,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new(
        key: &Secret<String>,
        max_age: u64,
        login_ttl: u64,
        secure: bool,
        clock: Arc<dyn Clock>,
    ) -> common::Result<Self> {
        let mac = HmacSha256::new_from_slice(key.expose().as_bytes())
            .map_err(|_| common::Error::Config("unusable session secret".into()))?;
        Ok(Self {
            mac,
            max_age,
            login_ttl,
            secure,
            clock,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Verified session id from the request's cookies.
    pub fn session_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(name, _)| *name == SESSION_COOKIE)
            .find_map(|(_, value)| self.verify(value))
    }

    /// Logged-in subject of a live session.
    pub async fn subject(&self, id: &str) -> Option<String> {
        let now = self.clock.now_secs();
        let sessions = self.sessions.lock().await;
        let record = sessions.get(id)?;
        if now.saturating_sub(record.created_at) >= self.max_age {
            return None;
        }
        record.subject.clone()
    }

    /// Attach a login attempt to the browser's session, creating one if the
    /// browser has none. Returns the id the cookie must carry.
    pub async fn begin_login(&self, existing: Option<&str>, pending: PendingLogin) -> String {
        let now = self.clock.now_secs();
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions, now);

        if let Some(id) = existing {
            if let Some(record) = sessions.get_mut(id) {
                record.pending = Some(pending);
                return id.to_owned();
            }
        }
        let id = new_session_id();
        sessions.insert(
            id.clone(),
            SessionRecord {
                subject: None,
                pending: Some(pending),
                created_at: now,
            },
        );
        id
    }

    /// Remove and return the session's pending login.
    ///
    /// The entry is gone after this call whatever the callback's outcome.
    /// Attempts older than the login TTL come back as `None`.
    pub async fn take_pending(&self, id: &str) -> Option<PendingLogin> {
        let now = self.clock.now_secs();
        let pending = self.sessions.lock().await.get_mut(id)?.pending.take()?;
        if now.saturating_sub(pending.created_at) >= self.login_ttl {
            debug!("discarding expired login attempt");
            return None;
        }
        Some(pending)
    }

    /// Mark the browser as logged in under a fresh session id.
    pub async fn log_in(&self, previous: Option<&str>, subject: &str) -> String {
        let now = self.clock.now_secs();
        let mut sessions = self.sessions.lock().await;
        if let Some(old) = previous {
            sessions.remove(old);
        }
        let id = new_session_id();
        sessions.insert(
            id.clone(),
            SessionRecord {
                subject: Some(subject.to_owned()),
                pending: None,
                created_at: now,
            },
        );
        id
    }

    pub async fn log_out(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    /// Logged-in sessions that have not expired.
    pub async fn active_sessions(&self) -> usize {
        let now = self.clock.now_secs();
        self.sessions
            .lock()
            .await
            .values()
            .filter(|r| r.subject.is_some() && now.saturating_sub(r.created_at) < self.max_age)
            .count()
    }

    /// `Set-Cookie` value carrying the signed id.
    pub fn cookie(&self, id: &str) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.sign(id),
            self.max_age
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn prune(&self, sessions: &mut HashMap<String, SessionRecord>, now: u64) {
        sessions.retain(|_, record| {
            let login_expired = record
                .pending
                .as_ref()
                .is_some_and(|p| now.saturating_sub(p.created_at) >= self.login_ttl);
            if login_expired {
                record.pending = None;
            }
            let live = now.saturating_sub(record.created_at) < self.max_age;
            live && (record.subject.is_some() || record.pending.is_some())
        });
    }

    fn sign(&self, id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        format!("{id}.{}", URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, value: &str) -> Option<String> {
        let (id, signature) = value.rsplit_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(id.to_owned())
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use token_lifecycle::ManualClock;

    const T0: u64 = 1_700_000_000;

    fn store() -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = SessionStore::new(
            &Secret::new("0123456789abcdef0123456789abcdef".into()),
            3600,
            600,
            false,
            clock.clone(),
        )
        .unwrap();
        (store, clock)
    }

    fn pending(state: &str, at: u64) -> PendingLogin {
        PendingLogin {
            state: state.into(),
            verifier: "verifier".into(),
            created_at: at,
        }
    }

    fn headers_with(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    fn cookie_value(set_cookie: &str) -> String {
        set_cookie
            .split(';')
            .next()
            .unwrap()
            .trim_start_matches("gateway_session=")
            .to_owned()
    }

    #[tokio::test]
    async fn signed_cookie_roundtrips() {
        let (store, _) = store();
        let id = store.begin_login(None, pending("s1", T0)).await;
        let set_cookie = store.cookie(&id);
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("SameSite=Lax"));
        assert!(!set_cookie.contains("Secure"));

        let headers = headers_with(&format!(
            "theme=dark; gateway_session={}",
            cookie_value(&set_cookie)
        ));
        assert_eq!(store.session_id(&headers).as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn tampered_cookie_is_ignored() {
        let (store, _) = store();
        let id = store.log_in(None, "u1").await;
        let value = cookie_value(&store.cookie(&id));
        let (_, signature) = value.rsplit_once('.').unwrap();

        let forged = format!("gateway_session=someone-else.{signature}");
        assert!(store.session_id(&headers_with(&forged)).is_none());
        assert!(store.session_id(&headers_with("gateway_session=no-signature")).is_none());
    }

    #[tokio::test]
    async fn pending_login_is_single_use() {
        let (store, _) = store();
        let id = store.begin_login(None, pending("s1", T0)).await;
        assert_eq!(store.take_pending(&id).await.unwrap().state, "s1");
        assert!(store.take_pending(&id).await.is_none());
    }

    #[tokio::test]
    async fn pending_login_expires() {
        let (store, clock) = store();
        let id = store.begin_login(None, pending("s1", T0)).await;
        clock.advance(600);
        assert!(store.take_pending(&id).await.is_none());
    }

    #[tokio::test]
    async fn new_login_replaces_pending_attempt() {
        let (store, _) = store();
        let id = store.begin_login(None, pending("s1", T0)).await;
        let same = store.begin_login(Some(&id), pending("s2", T0)).await;
        assert_eq!(id, same);
        assert_eq!(store.take_pending(&id).await.unwrap().state, "s2");
    }

    #[tokio::test]
    async fn login_rotates_session_id() {
        let (store, _) = store();
        let anonymous = store.begin_login(None, pending("s1", T0)).await;
        let logged_in = store.log_in(Some(&anonymous), "u1").await;

        assert_ne!(anonymous, logged_in);
        assert!(store.subject(&anonymous).await.is_none());
        assert_eq!(store.subject(&logged_in).await.as_deref(), Some("u1"));
        assert_eq!(store.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn sessions_expire_after_max_age() {
        let (store, clock) = store();
        let id = store.log_in(None, "u1").await;
        clock.advance(3600);
        assert!(store.subject(&id).await.is_none());
        assert_eq!(store.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn logout_forgets_subject() {
        let (store, _) = store();
        let id = store.log_in(None, "u1").await;
        store.log_out(&id).await;
        assert!(store.subject(&id).await.is_none());
        assert!(store.clear_cookie().contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn abandoned_logins_are_pruned() {
        let (store, clock) = store();
        let stale = store.begin_login(None, pending("old", T0)).await;
        clock.advance(700);
        store.begin_login(None, pending("new", T0 + 700)).await;

        assert!(!store.sessions.lock().await.contains_key(&stale));
    }

    #[test]
    fn pending_debug_redacts_verifier() {
        let login = PendingLogin {
            verifier: "pkce-verifier-value".into(),
            ..pending("s1", T0)
        };
        let debug = format!("{login:?}");
        assert!(!debug.contains("pkce-verifier-value"), "{debug}");
        assert!(debug.contains("s1"));
    }
}

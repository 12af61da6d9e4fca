//! OAuth session bundle and its stored form

use std::fmt;

use secret_store::Payload;
use serde::{Deserialize, Serialize};
use upstream_auth::token::DEFAULT_EXPIRES_IN;
use upstream_auth::{Claims, TokenResponse};

use crate::error::{Error, Result};

const DEFAULT_TOKEN_TYPE: &str = "Bearer";
const DEFAULT_SCOPE: &str = "openid email profile";

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_owned()
}

/// Tokens and metadata for one subject's upstream session.
///
/// `expires_at` is always computed here from the provider's `expires_in`
/// and the server clock, never taken from client input.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBundle {
    pub subject: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: u64,
    /// Unix seconds
    pub expires_at: u64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Unix seconds of the last write
    pub updated_at: u64,
}

impl SessionBundle {
    /// Bundle for a fresh login.
    pub fn from_token_response(subject: &str, token: TokenResponse, now: u64) -> Self {
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        Self {
            subject: subject.to_owned(),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type.unwrap_or_else(default_token_type),
            expires_in,
            expires_at: now.saturating_add(expires_in),
            scope: token.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_owned()),
            id_token: token.id_token,
            updated_at: now,
        }
    }

    /// Apply a refresh response.
    ///
    /// Fields the provider leaves out keep their stored values; in particular
    /// a non-rotating provider never wipes the refresh token.
    pub fn merge_refresh(&self, token: TokenResponse, now: u64) -> Self {
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        Self {
            subject: self.subject.clone(),
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| self.refresh_token.clone()),
            token_type: token.token_type.unwrap_or_else(|| self.token_type.clone()),
            expires_in,
            expires_at: now.saturating_add(expires_in),
            scope: token.scope.unwrap_or_else(|| self.scope.clone()),
            id_token: token.id_token.or_else(|| self.id_token.clone()),
            updated_at: now,
        }
    }

    /// True once `now + buffer` reaches `expires_at`.
    pub fn is_near_expiry(&self, now: u64, buffer: u64) -> bool {
        now.saturating_add(buffer) >= self.expires_at
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Seconds until expiry, zero once expired.
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Claims of the stored ID token, if there is one and it decodes.
    pub fn id_claims(&self) -> Option<Claims> {
        self.id_token
            .as_deref()
            .and_then(|token| upstream_auth::claims::decode_unverified(token).ok())
    }

    pub fn to_payload(&self) -> Result<Payload> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::Invalid("session bundle did not serialize to an object".into())),
            Err(e) => Err(Error::Invalid(format!("serializing session bundle: {e}"))),
        }
    }

    /// Parse a stored bundle. A corrupt entry is treated as no usable session.
    pub fn from_payload(payload: Payload) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(payload))
            .map_err(|e| Error::Invalid(format!("stored session bundle unreadable: {e}")))
    }
}

impl fmt::Debug for SessionBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBundle")
            .field("subject", &self.subject)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

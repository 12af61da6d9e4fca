//! Bearer tokens for the GCP and Azure REST APIs
//!
//! Production instances run on the cloud they store secrets in, so the
//! default source is the instance metadata endpoint. A fixed token (e.g.
//! `gcloud auth print-access-token` output) is accepted for local runs.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::{http, unix_now};

/// GCP metadata server token endpoint for the default service account.
pub const GCP_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Azure IMDS managed identity endpoint scoped to Key Vault.
pub const AZURE_IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource=https://vault.azure.net";

/// Refresh cached tokens this many seconds before they expire.
const EXPIRY_MARGIN_SECS: u64 = 60;

enum Source {
    Fixed(Secret<String>),
    Metadata {
        url: String,
        header: (&'static str, &'static str),
        client: reqwest::Client,
    },
}

struct Cached {
    token: Secret<String>,
    expires_at: u64,
}

/// Supplies bearer tokens to a cloud backend, caching metadata tokens until
/// shortly before expiry.
pub struct AccessTokenSource {
    source: Source,
    cached: Mutex<Option<Cached>>,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    // IMDS returns this as a string, GCP as a number
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl AccessTokenSource {
    /// Always hand out the same token.
    pub fn fixed(token: Secret<String>) -> Self {
        Self::with_source(Source::Fixed(token))
    }

    pub fn gcp_metadata() -> Result<Self> {
        Self::metadata(GCP_METADATA_TOKEN_URL, ("Metadata-Flavor", "Google"))
    }

    pub fn azure_imds() -> Result<Self> {
        Self::metadata(AZURE_IMDS_TOKEN_URL, ("Metadata", "true"))
    }

    /// Fetch tokens from a metadata-style endpoint that requires `header`.
    pub fn metadata(url: impl Into<String>, header: (&'static str, &'static str)) -> Result<Self> {
        Ok(Self::with_source(Source::Metadata {
            url: url.into(),
            header,
            client: http::client()?,
        }))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, fetching a new one when the cache is stale.
    pub async fn bearer(&self) -> Result<Secret<String>> {
        let (url, header, client) = match &self.source {
            Source::Fixed(token) => return Ok(token.clone()),
            Source::Metadata {
                url,
                header,
                client,
            } => (url, *header, client),
        };

        let mut cached = self.cached.lock().await;
        let now = unix_now();
        if let Some(entry) = cached.as_ref().filter(|c| c.expires_at > now + EXPIRY_MARGIN_SECS) {
            return Ok(entry.token.clone());
        }

        let response = client
            .get(url.as_str())
            .header(header.0, header.1)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| http::transport("fetching metadata access token", e))?;
        let response = http::expect_success(response, "fetching metadata access token").await?;
        let body: MetadataToken = response
            .json()
            .await
            .map_err(|e| http::transport("parsing metadata access token", e))?;

        let lifetime = body.expires_in.as_ref().and_then(parse_lifetime).unwrap_or(300);
        let token = Secret::new(body.access_token);
        debug!(lifetime, "fetched metadata access token");
        *cached = Some(Cached {
            token: token.clone(),
            expires_at: now + lifetime,
        });
        Ok(token)
    }
}

fn parse_lifetime(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl std::fmt::Debug for AccessTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Source::Fixed(_) => f.write_str("AccessTokenSource::Fixed([REDACTED])"),
            Source::Metadata { url, .. } => write!(f, "AccessTokenSource::Metadata({url})"),
        }
    }
}

/// Build an `Authorization` header value.
pub(crate) fn bearer_header(token: &Secret<String>) -> Result<reqwest::header::HeaderValue> {
    let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token.expose()))
        .map_err(|_| Error::PermissionDenied("access token is not a valid header value".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

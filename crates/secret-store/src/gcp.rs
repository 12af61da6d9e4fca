//! Google Secret Manager backend
//!
//! Each `(subject, profile)` is one secret; every `put` adds a version and
//! reads always access `versions/latest`. Secrets are created on first write
//! with automatic replication.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::access_token::{AccessTokenSource, bearer_header};
use crate::error::{Error, Result};
use crate::naming::KeyEncoder;
use crate::{Payload, ProfileEntry, SecretStore, StoreFuture, http, sort_entries};

pub const DEFAULT_API_BASE: &str = "https://secretmanager.googleapis.com/v1";

/// GCP secret IDs are limited to 255 characters.
const MAX_SECRET_ID_LEN: usize = 255;

const LIST_PAGE_SIZE: &str = "250";

pub struct GcpSecretManager {
    api_base: String,
    project_id: String,
    encoder: KeyEncoder,
    tokens: AccessTokenSource,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: PayloadData,
}

#[derive(Deserialize)]
struct PayloadData {
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    secrets: Vec<SecretResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretResource {
    name: String,
    #[serde(default)]
    create_time: Option<String>,
}

impl GcpSecretManager {
    pub fn new(
        project_id: impl Into<String>,
        prefix: &str,
        tokens: AccessTokenSource,
    ) -> Result<Self> {
        Ok(Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            project_id: project_id.into(),
            encoder: KeyEncoder::new(prefix, MAX_SECRET_ID_LEN),
            tokens,
            client: http::client()?,
        })
    }

    /// Point at a different API root (emulators, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }

    fn secrets_url(&self) -> String {
        format!("{}/projects/{}/secrets", self.api_base, self.project_id)
    }

    fn url(&self, raw: &str) -> Result<Url> {
        Url::parse(raw).map_err(|e| Error::BackendUnavailable(format!("invalid GCP URL: {e}")))
    }

    async fn request(&self, method: reqwest::Method, url: Url) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.bearer().await?;
        Ok(self
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, bearer_header(&token)?))
    }

    async fn add_version(&self, name: &str, data: &str) -> Result<reqwest::Response> {
        let url = self.url(&format!("{}/{name}:addVersion", self.secrets_url()))?;
        self.request(reqwest::Method::POST, url)
            .await?
            .json(&json!({ "payload": { "data": data } }))
            .send()
            .await
            .map_err(|e| http::transport("adding GCP secret version", e))
    }

    async fn create_secret(&self, name: &str) -> Result<()> {
        let mut url = self.url(&self.secrets_url())?;
        url.query_pairs_mut().append_pair("secretId", name);
        let response = self
            .request(reqwest::Method::POST, url)
            .await?
            .json(&json!({ "replication": { "automatic": {} } }))
            .send()
            .await
            .map_err(|e| http::transport("creating GCP secret", e))?;
        // Lost a creation race with another writer; the secret exists either way
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        http::expect_success(response, "creating GCP secret").await?;
        info!(secret = name, "created GCP secret");
        Ok(())
    }
}

impl SecretStore for GcpSecretManager {
    fn backend(&self) -> &'static str {
        "gcp"
    }

    fn put<'a>(
        &'a self,
        subject: &'a str,
        profile: &'a str,
        payload: &'a Payload,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let raw = serde_json::to_vec(payload)
                .map_err(|e| Error::BackendUnavailable(format!("serializing payload: {e}")))?;
            let data = STANDARD.encode(raw);

            let mut response = self.add_version(&name, &data).await?;
            if response.status() == StatusCode::NOT_FOUND {
                self.create_secret(&name).await?;
                response = self.add_version(&name, &data).await?;
            }
            http::expect_success(response, "adding GCP secret version").await?;
            debug!(secret = %name, "stored GCP secret version");
            Ok(())
        })
    }

    fn get<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, Payload> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let url = self.url(&format!(
                "{}/{name}/versions/latest:access",
                self.secrets_url()
            ))?;
            let response = self
                .request(reqwest::Method::GET, url)
                .await?
                .send()
                .await
                .map_err(|e| http::transport("reading GCP secret", e))?;
            let response = http::expect_success(response, &format!("profile '{profile}'")).await?;
            let body: AccessResponse = response
                .json()
                .await
                .map_err(|e| http::transport("parsing GCP secret", e))?;
            let raw = STANDARD
                .decode(body.payload.data.as_bytes())
                .map_err(|e| Error::BackendUnavailable(format!("decoding GCP payload: {e}")))?;
            serde_json::from_slice(&raw)
                .map_err(|e| Error::BackendUnavailable(format!("GCP payload is not an object: {e}")))
        })
    }

    fn list<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Vec<ProfileEntry>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut page_token: Option<String> = None;
            // Server-side narrowing; ids are still matched exactly below
            let filter = format!("name:{}", self.encoder.subject_prefix(subject));
            loop {
                let mut url = self.url(&self.secrets_url())?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("pageSize", LIST_PAGE_SIZE);
                    query.append_pair("filter", &filter);
                    if let Some(token) = &page_token {
                        query.append_pair("pageToken", token);
                    }
                }
                let response = self
                    .request(reqwest::Method::GET, url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| http::transport("listing GCP secrets", e))?;
                let response = http::expect_success(response, "listing GCP secrets").await?;
                let page: ListResponse = response
                    .json()
                    .await
                    .map_err(|e| http::transport("parsing GCP secret list", e))?;

                for secret in page.secrets {
                    // Resource names are projects/{project}/secrets/{id}
                    let id = secret.name.rsplit('/').next().unwrap_or_default();
                    if let Some(profile) = self.encoder.profile_from_name(subject, id) {
                        entries.push(ProfileEntry {
                            profile,
                            updated_at: secret
                                .create_time
                                .as_deref()
                                .and_then(parse_rfc3339)
                                .unwrap_or(0),
                        });
                    }
                }

                match page.next_page_token.filter(|t| !t.is_empty()) {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            sort_entries(&mut entries);
            Ok(entries)
        })
    }

    fn delete<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let url = self.url(&format!("{}/{name}", self.secrets_url()))?;
            let response = self
                .request(reqwest::Method::DELETE, url)
                .await?
                .send()
                .await
                .map_err(|e| http::transport("deleting GCP secret", e))?;
            http::expect_success(response, &format!("profile '{profile}'")).await?;
            info!(secret = %name, "deleted GCP secret");
            Ok(())
        })
    }
}

fn parse_rfc3339(raw: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|t| u64::try_from(t.timestamp()).ok())
}

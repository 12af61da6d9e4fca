//! Azure Key Vault backend
//!
//! Key Vault secret names only allow `[0-9a-zA-Z-]` and fold case, so the
//! encoder escapes uppercase letters as well. Vaults have soft-delete
//! enabled by default; `delete` purges after deleting so the name can be
//! reused immediately (best-effort, the vault may forbid purging).

use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::access_token::{AccessTokenSource, bearer_header};
use crate::error::{Error, Result};
use crate::naming::KeyEncoder;
use crate::{Payload, ProfileEntry, SecretStore, StoreFuture, http, sort_entries};

const API_VERSION: &str = "7.4";

/// Key Vault secret names are limited to 127 characters.
const MAX_SECRET_NAME_LEN: usize = 127;

pub struct AzureKeyVault {
    vault_url: String,
    encoder: KeyEncoder,
    tokens: AccessTokenSource,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretListPage {
    #[serde(default)]
    value: Vec<SecretItem>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct SecretItem {
    id: String,
    #[serde(default)]
    attributes: Option<SecretAttributes>,
}

#[derive(Deserialize)]
struct SecretAttributes {
    #[serde(default)]
    updated: Option<u64>,
}

impl AzureKeyVault {
    /// `vault_url` is the vault root, e.g. `https://my-vault.vault.azure.net`.
    pub fn new(vault_url: &str, prefix: &str, tokens: AccessTokenSource) -> Result<Self> {
        Ok(Self {
            vault_url: vault_url.trim_end_matches('/').to_owned(),
            encoder: KeyEncoder::new(prefix, MAX_SECRET_NAME_LEN).case_insensitive(),
            tokens,
            client: http::client()?,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{path}", self.vault_url))
            .map_err(|e| Error::BackendUnavailable(format!("invalid Key Vault URL: {e}")))?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<serde_json::Value>,
        context: &str,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.bearer().await?;
        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, bearer_header(&token)?);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| http::transport(context, e))?;
        http::expect_success(response, context).await
    }
}

impl SecretStore for AzureKeyVault {
    fn backend(&self) -> &'static str {
        "azure"
    }

    fn put<'a>(
        &'a self,
        subject: &'a str,
        profile: &'a str,
        payload: &'a Payload,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let value = serde_json::to_string(payload)
                .map_err(|e| Error::BackendUnavailable(format!("serializing payload: {e}")))?;
            let url = self.url(&format!("secrets/{name}"))?;
            self.send(
                reqwest::Method::PUT,
                url,
                Some(json!({ "value": value, "contentType": "application/json" })),
                "writing Key Vault secret",
            )
            .await?;
            debug!(secret = %name, "stored Key Vault secret version");
            Ok(())
        })
    }

    fn get<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, Payload> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let context = format!("profile '{profile}'");
            let url = self.url(&format!("secrets/{name}"))?;
            let bundle: SecretBundle = self
                .send(reqwest::Method::GET, url, None, &context)
                .await?
                .json()
                .await
                .map_err(|e| http::transport("parsing Key Vault secret", e))?;
            serde_json::from_str(&bundle.value).map_err(|e| {
                Error::BackendUnavailable(format!("{context}: payload is not an object: {e}"))
            })
        })
    }

    fn list<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Vec<ProfileEntry>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut next = Some(self.url("secrets")?);
            while let Some(url) = next.take() {
                let page: SecretListPage = self
                    .send(reqwest::Method::GET, url, None, "listing Key Vault secrets")
                    .await?
                    .json()
                    .await
                    .map_err(|e| http::transport("parsing Key Vault secret list", e))?;

                for item in page.value {
                    // ids look like https://{vault}/secrets/{name}
                    let name = item.id.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
                    if let Some(profile) = self.encoder.profile_from_name(subject, name) {
                        entries.push(ProfileEntry {
                            profile,
                            updated_at: item.attributes.and_then(|a| a.updated).unwrap_or(0),
                        });
                    }
                }

                if let Some(link) = page.next_link.filter(|l| !l.is_empty()) {
                    next = Some(Url::parse(&link).map_err(|e| {
                        Error::BackendUnavailable(format!("invalid Key Vault nextLink: {e}"))
                    })?);
                }
            }
            sort_entries(&mut entries);
            Ok(entries)
        })
    }

    fn delete<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let url = self.url(&format!("secrets/{name}"))?;
            self.send(
                reqwest::Method::DELETE,
                url,
                None,
                &format!("profile '{profile}'"),
            )
            .await?;
            info!(secret = %name, "deleted Key Vault secret");

            let purge = self.url(&format!("deletedsecrets/{name}"))?;
            if let Err(e) = self
                .send(reqwest::Method::DELETE, purge, None, "purging Key Vault secret")
                .await
            {
                warn!(secret = %name, error = %e, "Key Vault purge failed, name stays reserved until retention ends");
            }
            Ok(())
        })
    }
}

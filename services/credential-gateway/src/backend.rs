//! Secret store construction from configuration

use std::sync::Arc;

use anyhow::{Context, Result};
use common::Secret;
use secret_store::{
    AccessTokenSource, AwsCredentials, AwsSecretsManager, AzureKeyVault, BackendKind, FileStore,
    GcpSecretManager, MemoryStore, SecretStore,
};
use tracing::{info, warn};

use crate::config::StoreConfig;

/// Build the configured backend. Called once at startup.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn SecretStore>> {
    let store: Arc<dyn SecretStore> = match config.backend {
        BackendKind::Memory => {
            warn!("memory secret store selected, profiles and sessions are lost on restart");
            Arc::new(MemoryStore::new())
        }
        BackendKind::File => Arc::new(
            FileStore::load(config.path.clone())
                .await
                .with_context(|| format!("failed to open {}", config.path.display()))?,
        ),
        BackendKind::Gcp => {
            let project = config
                .project_id
                .as_deref()
                .context("gcp backend requires a project id")?;
            let tokens = token_source("GCP_ACCESS_TOKEN", AccessTokenSource::gcp_metadata)?;
            let mut store = GcpSecretManager::new(project, &config.prefix, tokens)
                .context("failed to build gcp secret store")?;
            if let Some(endpoint) = &config.endpoint {
                store = store.with_api_base(endpoint.clone());
            }
            Arc::new(store)
        }
        BackendKind::Aws => {
            let region = config
                .region
                .as_deref()
                .context("aws backend requires a region")?;
            let credentials = AwsCredentials::from_env()
                .context("aws backend requires AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY")?;
            let mut store = AwsSecretsManager::new(region, &config.prefix, credentials)
                .context("invalid aws region")?;
            if let Some(endpoint) = &config.endpoint {
                store = store
                    .with_endpoint(endpoint)
                    .context("invalid aws endpoint")?;
            }
            Arc::new(store)
        }
        BackendKind::Azure => {
            let vault_url = config
                .vault_url
                .as_deref()
                .context("azure backend requires a vault url")?;
            let tokens = token_source("AZURE_ACCESS_TOKEN", AccessTokenSource::azure_imds)?;
            Arc::new(
                AzureKeyVault::new(vault_url, &config.prefix, tokens)
                    .context("failed to build azure secret store")?,
            )
        }
    };
    info!(backend = store.backend(), "secret store ready");
    Ok(store)
}

/// Static token from `env` if set, otherwise the platform metadata endpoint.
fn token_source(
    env: &str,
    metadata: fn() -> secret_store::Result<AccessTokenSource>,
) -> Result<AccessTokenSource> {
    match std::env::var(env).ok().filter(|v| !v.trim().is_empty()) {
        Some(token) => Ok(AccessTokenSource::fixed(Secret::new(token))),
        None => metadata().context("failed to build metadata token source"),
    }
}

//! Secret storage for per-subject credential profiles
//!
//! A `SecretStore` maps `(subject, profile)` to an opaque JSON object. The
//! store never interprets the payload and never applies policy: profile caps
//! and reserved names live in the `profiles` crate one layer up.
//!
//! Backends:
//! - `MemoryStore`: process-local map (tests, throwaway dev instances)
//! - `FileStore`: a single JSON file written atomically with 0600 permissions
//! - `GcpSecretManager`: Google Secret Manager REST API
//! - `AwsSecretsManager`: AWS Secrets Manager JSON API with SigV4 signing
//! - `AzureKeyVault`: Azure Key Vault REST API
//!
//! Cloud backends encode `(subject, profile)` into a backend-legal secret name
//! with `naming::KeyEncoder`; each `put` writes a new latest version and older
//! versions stay a backend concern.

pub mod access_token;
pub mod aws;
pub mod azure;
pub mod error;
pub mod file;
pub mod gcp;
mod http;
pub mod memory;
pub mod naming;

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use access_token::AccessTokenSource;
pub use aws::{AwsCredentials, AwsSecretsManager};
pub use azure::AzureKeyVault;
pub use error::{Error, Result};
pub use file::FileStore;
pub use gcp::GcpSecretManager;
pub use memory::MemoryStore;
pub use naming::KeyEncoder;

/// Opaque profile payload. Only the layer above knows its shape.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One stored profile as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub profile: String,
    /// Unix seconds of the last write the backend knows about
    pub updated_at: u64,
}

/// Boxed future returned by `SecretStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key-value contract every secret backend honors.
///
/// Uses `Pin<Box<dyn Future>>` return types so the store can be shared as
/// `Arc<dyn SecretStore>` and picked at startup from configuration.
pub trait SecretStore: Send + Sync {
    /// Backend label for logs and the health endpoint (e.g. "gcp")
    fn backend(&self) -> &'static str;

    /// Store `payload` as the latest value for `(subject, profile)`.
    fn put<'a>(&'a self, subject: &'a str, profile: &'a str, payload: &'a Payload)
    -> StoreFuture<'a, ()>;

    /// Fetch the latest payload. Fails `NotFound` if absent.
    fn get<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, Payload>;

    /// All profiles stored for `subject`, ordered by profile name.
    fn list<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Vec<ProfileEntry>>;

    /// Remove `(subject, profile)`. Fails `NotFound` if absent.
    fn delete<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, ()>;
}

/// Backend selector as written in config / `SECRETS_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    #[serde(alias = "local")]
    File,
    Gcp,
    Aws,
    Azure,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::File => "file",
            BackendKind::Gcp => "gcp",
            BackendKind::Aws => "aws",
            BackendKind::Azure => "azure",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "file" | "local" => Ok(BackendKind::File),
            "gcp" => Ok(BackendKind::Gcp),
            "aws" => Ok(BackendKind::Aws),
            "azure" => Ok(BackendKind::Azure),
            other => Err(format!(
                "unknown secrets backend: {other} (supported: memory, file, gcp, aws, azure)"
            )),
        }
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Sort entries the way every backend reports them.
pub(crate) fn sort_entries(entries: &mut [ProfileEntry]) {
    entries.sort_by(|a, b| a.profile.cmp(&b.profile));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("GCP".parse::<BackendKind>().unwrap(), BackendKind::Gcp);
        assert_eq!(" aws ".parse::<BackendKind>().unwrap(), BackendKind::Aws);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::File);
    }

    #[test]
    fn unknown_backend_lists_supported_values() {
        let err = "vault".parse::<BackendKind>().unwrap_err();
        assert!(err.contains("supported: memory, file, gcp, aws, azure"), "{err}");
    }

    #[test]
    fn entries_sort_by_profile_name() {
        let mut entries = vec![
            ProfileEntry { profile: "sandbox".into(), updated_at: 2 },
            ProfileEntry { profile: "dev".into(), updated_at: 9 },
            ProfileEntry { profile: "prod".into(), updated_at: 1 },
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.profile.as_str()).collect();
        assert_eq!(names, ["dev", "prod", "sandbox"]);
    }
}

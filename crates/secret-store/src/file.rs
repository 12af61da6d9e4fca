//! Local JSON file secret store
//!
//! One file holds every subject's profiles:
//!
//! ```json
//! { "alice@example.com": { "prod": { "payload": {...}, "updated_at": 1735500000 } } }
//! ```
//!
//! All writes use atomic temp-file + rename so a crash never leaves a torn
//! file. A tokio Mutex serializes writers; the in-memory copy is the source
//! of truth between restarts.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{Payload, ProfileEntry, SecretStore, StoreFuture, unix_now};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stored {
    payload: Payload,
    updated_at: u64,
}

type Contents = BTreeMap<String, BTreeMap<String, Stored>>;

/// File-backed `SecretStore` for single-host deployments and development.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Contents>,
}

impl FileStore {
    /// Load the store from `path`, creating an empty file on first start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let parsed: Contents = serde_json::from_str(&contents).map_err(|e| {
                    Error::BackendUnavailable(format!("parsing secrets file: {e}"))
                })?;
                info!(path = %path.display(), subjects = parsed.len(), "loaded secrets file");
                parsed
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "secrets file not found, starting empty");
                let empty = Contents::new();
                write_atomic(&path, &empty).await?;
                empty
            }
            Err(e) => return Err(io_error("reading secrets file", e)),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn put<'a>(
        &'a self,
        subject: &'a str,
        profile: &'a str,
        payload: &'a Payload,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.entry(subject.to_owned()).or_default().insert(
                profile.to_owned(),
                Stored {
                    payload: payload.clone(),
                    updated_at: unix_now(),
                },
            );
            // Only swap in-memory state once the file write succeeded
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(subject, profile, "stored secret in file");
            Ok(())
        })
    }

    fn get<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, Payload> {
        Box::pin(async move {
            let state = self.state.lock().await;
            state
                .get(subject)
                .and_then(|profiles| profiles.get(profile))
                .map(|stored| stored.payload.clone())
                .ok_or_else(|| Error::NotFound(format!("profile '{profile}'")))
        })
    }

    fn list<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Vec<ProfileEntry>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .get(subject)
                .map(|profiles| {
                    profiles
                        .iter()
                        .map(|(profile, stored)| ProfileEntry {
                            profile: profile.clone(),
                            updated_at: stored.updated_at,
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn delete<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            let profiles = next
                .get_mut(subject)
                .ok_or_else(|| Error::NotFound(format!("profile '{profile}'")))?;
            if profiles.remove(profile).is_none() {
                return Err(Error::NotFound(format!("profile '{profile}'")));
            }
            if profiles.is_empty() {
                next.remove(subject);
            }
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(subject, profile, "removed secret from file");
            Ok(())
        })
    }
}

fn io_error(context: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::PermissionDenied {
        Error::PermissionDenied(format!("{context}: {e}"))
    } else {
        Error::BackendUnavailable(format!("{context}: {e}"))
    }
}

/// Write the store atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &Contents) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::BackendUnavailable(format!("serializing secrets: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let tmp_path = dir.join(format!(".secrets.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| io_error("writing temp secrets file", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| io_error("setting secrets file permissions", e))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| io_error("renaming temp secrets file", e))?;

    debug!(path = %path.display(), "persisted secrets file");
    Ok(())
}

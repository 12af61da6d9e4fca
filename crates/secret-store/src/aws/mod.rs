//! AWS Secrets Manager backend
//!
//! Talks the JSON 1.1 protocol directly: every call is a signed POST to `/`
//! with the operation in `X-Amz-Target`. Deletes schedule removal with a
//! 7-day recovery window; writing to a profile whose secret is pending
//! deletion restores it first.

pub mod sigv4;

use common::Secret;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::naming::KeyEncoder;
use crate::{Payload, ProfileEntry, SecretStore, StoreFuture, http, sort_entries};

/// AWS secret names are limited to 512 characters.
const MAX_SECRET_NAME_LEN: usize = 512;

const RECOVERY_WINDOW_DAYS: u64 = 7;

const SERVICE: &str = "secretsmanager";

/// Static credentials for request signing.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    pub session_token: Option<Secret<String>>,
}

impl AwsCredentials {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optional
    /// `AWS_SESSION_TOKEN`. Returns `None` when the key pair is incomplete.
    pub fn from_env() -> Option<Self> {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            access_key_id: non_empty("AWS_ACCESS_KEY_ID")?,
            secret_access_key: Secret::new(non_empty("AWS_SECRET_ACCESS_KEY")?),
            session_token: non_empty("AWS_SESSION_TOKEN").map(Secret::new),
        })
    }
}

pub struct AwsSecretsManager {
    region: String,
    endpoint: Url,
    encoder: KeyEncoder,
    credentials: AwsCredentials,
    client: reqwest::Client,
}

/// Error body returned by the JSON protocol.
#[derive(Debug, Deserialize)]
struct AwsErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

/// A classified failure, kept distinct from `Error` so callers can react to
/// specific exception types before collapsing it.
#[derive(Debug)]
struct AwsFailure {
    kind: String,
    message: String,
    status: reqwest::StatusCode,
}

impl AwsFailure {
    fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    fn marked_for_deletion(&self) -> bool {
        self.is("InvalidRequestException") && self.message.contains("marked for deletion")
    }

    fn into_error(self, context: &str) -> Error {
        match self.kind.as_str() {
            "ResourceNotFoundException" => Error::NotFound(context.to_owned()),
            _ if self.marked_for_deletion() => Error::NotFound(context.to_owned()),
            "AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "ExpiredTokenException"
            | "IncompleteSignature" => {
                Error::PermissionDenied(format!("{context}: {}: {}", self.kind, self.message))
            }
            _ => Error::BackendUnavailable(format!(
                "{context}: HTTP {} {}: {}",
                self.status, self.kind, self.message
            )),
        }
    }
}

enum CallError {
    Aws(AwsFailure),
    Store(Error),
}

impl CallError {
    fn into_error(self, context: &str) -> Error {
        match self {
            CallError::Aws(failure) => failure.into_error(context),
            CallError::Store(e) => e,
        }
    }
}

impl From<Error> for CallError {
    fn from(e: Error) -> Self {
        CallError::Store(e)
    }
}

impl AwsSecretsManager {
    pub fn new(region: impl Into<String>, prefix: &str, credentials: AwsCredentials) -> Result<Self> {
        let region = region.into();
        let endpoint = format!("https://secretsmanager.{region}.amazonaws.com/");
        Ok(Self {
            endpoint: parse_endpoint(&endpoint)?,
            region,
            encoder: KeyEncoder::new(prefix, MAX_SECRET_NAME_LEN),
            credentials,
            client: http::client()?,
        })
    }

    /// Point at a different endpoint (LocalStack, tests).
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.endpoint = parse_endpoint(endpoint)?;
        Ok(self)
    }

    async fn call(&self, operation: &str, body: Value) -> std::result::Result<Value, CallError> {
        let payload = serde_json::to_vec(&body)
            .map_err(|e| Error::BackendUnavailable(format!("serializing request: {e}")))?;
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let target = format!("secretsmanager.{operation}");
        let host = match (self.endpoint.host_str(), self.endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            (None, _) => return Err(Error::BackendUnavailable("endpoint has no host".into()).into()),
        };

        let content_type = "application/x-amz-json-1.1";
        let mut signed: Vec<(&str, &str)> = vec![
            ("content-type", content_type),
            ("host", host.as_str()),
            ("x-amz-date", amz_date.as_str()),
            ("x-amz-target", target.as_str()),
        ];
        if let Some(token) = &self.credentials.session_token {
            signed.push(("x-amz-security-token", token.expose().as_str()));
        }

        let authorization = sigv4::authorization(
            &sigv4::SigningParams {
                access_key_id: &self.credentials.access_key_id,
                secret_access_key: self.credentials.secret_access_key.expose(),
                region: &self.region,
                service: SERVICE,
                amz_date: &amz_date,
            },
            &sigv4::CanonicalRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: "",
                headers: &signed,
                payload: &payload,
            },
        );

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::AUTHORIZATION, authorization);
        // reqwest sets host itself from the URL
        for (name, value) in signed.iter().filter(|(name, _)| *name != "host") {
            request = request.header(*name, *value);
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| http::transport(operation, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| http::transport(operation, e))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| {
                Error::BackendUnavailable(format!("{operation}: invalid response: {e}")).into()
            });
        }

        let parsed: AwsErrorBody = serde_json::from_str(&text).unwrap_or(AwsErrorBody {
            kind: String::new(),
            message: text.chars().take(200).collect(),
        });
        // Types may be namespaced: "com.amazonaws.secretsmanager#ResourceNotFoundException"
        let kind = parsed.kind.rsplit('#').next().unwrap_or_default().to_owned();
        Err(CallError::Aws(AwsFailure {
            kind,
            message: parsed.message,
            status,
        }))
    }

    async fn put_value(&self, name: &str, value: &str) -> std::result::Result<(), CallError> {
        self.call(
            "PutSecretValue",
            json!({ "SecretId": name, "SecretString": value }),
        )
        .await
        .map(|_| ())
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::BackendUnavailable(format!("invalid AWS endpoint: {e}")))
}

impl SecretStore for AwsSecretsManager {
    fn backend(&self) -> &'static str {
        "aws"
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
            let context = format!("profile '{profile}'");

            match self.put_value(&name, &value).await {
                Ok(()) => {}
                Err(CallError::Aws(f)) if f.is("ResourceNotFoundException") => {
                    match self
                        .call(
                            "CreateSecret",
                            json!({ "Name": name, "SecretString": value }),
                        )
                        .await
                    {
                        Ok(_) => info!(secret = %name, "created AWS secret"),
                        // Another writer created it first
                        Err(CallError::Aws(f)) if f.is("ResourceExistsException") => {
                            self.put_value(&name, &value)
                                .await
                                .map_err(|e| e.into_error(&context))?;
                        }
                        Err(e) => return Err(e.into_error(&context)),
                    }
                }
                Err(CallError::Aws(f)) if f.marked_for_deletion() => {
                    self.call("RestoreSecret", json!({ "SecretId": name }))
                        .await
                        .map_err(|e| e.into_error(&context))?;
                    info!(secret = %name, "restored AWS secret pending deletion");
                    self.put_value(&name, &value)
                        .await
                        .map_err(|e| e.into_error(&context))?;
                }
                Err(e) => return Err(e.into_error(&context)),
            }
            debug!(secret = %name, "stored AWS secret value");
            Ok(())
        })
    }

    fn get<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, Payload> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            let context = format!("profile '{profile}'");
            let response = self
                .call("GetSecretValue", json!({ "SecretId": name }))
                .await
                .map_err(|e| e.into_error(&context))?;
            let raw = response
                .get("SecretString")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::BackendUnavailable(format!("{context}: no SecretString")))?;
            serde_json::from_str(raw).map_err(|e| {
                Error::BackendUnavailable(format!("{context}: payload is not an object: {e}"))
            })
        })
    }

    fn list<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Vec<ProfileEntry>> {
        Box::pin(async move {
            let prefix = self.encoder.subject_prefix(subject);
            let mut entries = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                let mut body = json!({
                    "MaxResults": 100,
                    "Filters": [{ "Key": "name", "Values": [prefix] }],
                });
                if let Some(token) = &next_token {
                    body["NextToken"] = json!(token);
                }
                let page = self
                    .call("ListSecrets", body)
                    .await
                    .map_err(|e| e.into_error("listing AWS secrets"))?;

                for secret in page
                    .get("SecretList")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(name) = secret.get("Name").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some(profile) = self.encoder.profile_from_name(subject, name) {
                        let changed = secret
                            .get("LastChangedDate")
                            .or_else(|| secret.get("CreatedDate"))
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0);
                        entries.push(ProfileEntry {
                            profile,
                            updated_at: changed.max(0.0) as u64,
                        });
                    }
                }

                match page.get("NextToken").and_then(Value::as_str) {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_owned()),
                    _ => break,
                }
            }
            sort_entries(&mut entries);
            Ok(entries)
        })
    }

    fn delete<'a>(&'a self, subject: &'a str, profile: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let name = self.encoder.secret_name(subject, profile)?;
            self.call(
                "DeleteSecret",
                json!({ "SecretId": name, "RecoveryWindowInDays": RECOVERY_WINDOW_DAYS }),
            )
            .await
            .map_err(|e| e.into_error(&format!("profile '{profile}'")))?;
            info!(secret = %name, recovery_days = RECOVERY_WINDOW_DAYS, "scheduled AWS secret deletion");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Emulator {
        // name -> (value, pending deletion)
        secrets: Mutex<BTreeMap<String, (String, bool)>>,
    }

    fn aws_error(kind: &str, message: &str) -> (StatusCode, String) {
        (
            StatusCode::BAD_REQUEST,
            json!({ "__type": kind, "message": message }).to_string(),
        )
    }

    async fn handle(
        State(emu): State<Arc<Emulator>>,
        headers: HeaderMap,
        body: String,
    ) -> (StatusCode, String) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDTEST/")
            || !auth.contains("/us-east-1/secretsmanager/aws4_request")
        {
            return aws_error("UnrecognizedClientException", "bad signature");
        }
        let target = headers
            .get("x-amz-target")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_start_matches("secretsmanager.")
            .to_owned();
        let req: Value = serde_json::from_str(&body).unwrap();
        let id = req["SecretId"].as_str().unwrap_or_default().to_owned();
        let mut secrets = emu.secrets.lock().unwrap();

        match target.as_str() {
            "PutSecretValue" => match secrets.get_mut(&id) {
                None => aws_error("ResourceNotFoundException", "not found"),
                Some((_, true)) => aws_error(
                    "InvalidRequestException",
                    "You can't perform this operation on the secret because it was marked for deletion.",
                ),
                Some(entry) => {
                    entry.0 = req["SecretString"].as_str().unwrap().to_owned();
                    (StatusCode::OK, "{}".into())
                }
            },
            "CreateSecret" => {
                let name = req["Name"].as_str().unwrap().to_owned();
                if secrets.contains_key(&name) {
                    return aws_error("ResourceExistsException", "exists");
                }
                secrets.insert(name, (req["SecretString"].as_str().unwrap().to_owned(), false));
                (StatusCode::OK, "{}".into())
            }
            "RestoreSecret" => match secrets.get_mut(&id) {
                Some(entry) => {
                    entry.1 = false;
                    (StatusCode::OK, "{}".into())
                }
                None => aws_error("ResourceNotFoundException", "not found"),
            },
            "GetSecretValue" => match secrets.get(&id) {
                Some((value, false)) => (
                    StatusCode::OK,
                    json!({ "Name": id, "SecretString": value }).to_string(),
                ),
                Some((_, true)) => aws_error(
                    "InvalidRequestException",
                    "You can't perform this operation on the secret because it was marked for deletion.",
                ),
                None => aws_error("ResourceNotFoundException", "not found"),
            },
            "DeleteSecret" => {
                assert_eq!(req["RecoveryWindowInDays"], 7);
                match secrets.get_mut(&id) {
                    Some(entry) if !entry.1 => {
                        entry.1 = true;
                        (StatusCode::OK, "{}".into())
                    }
                    Some(_) => aws_error(
                        "InvalidRequestException",
                        "You can't perform this operation on the secret because it was marked for deletion.",
                    ),
                    None => aws_error("ResourceNotFoundException", "not found"),
                }
            }
            "ListSecrets" => {
                let prefix = req["Filters"][0]["Values"][0].as_str().unwrap_or_default();
                let skip: usize = req["NextToken"]
                    .as_str()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
                let matching: Vec<_> = secrets
                    .iter()
                    .filter(|(name, (_, deleted))| name.starts_with(prefix) && !deleted)
                    .map(|(name, _)| json!({ "Name": name, "LastChangedDate": 1767225600.5 }))
                    .collect();
                let page: Vec<_> = matching.iter().skip(skip).take(2).cloned().collect();
                let mut out = json!({ "SecretList": page });
                if skip + 2 < matching.len() {
                    out["NextToken"] = json!((skip + 2).to_string());
                }
                (StatusCode::OK, out.to_string())
            }
            _ => aws_error("InvalidAction", "unknown target"),
        }
    }

    async fn start_emulator(access_key_id: &str) -> (AwsSecretsManager, Arc<Emulator>) {
        let emu = Arc::new(Emulator::default());
        let app = Router::new().fallback(handle).with_state(emu.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let credentials = AwsCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: Secret::new("test-secret".into()),
            session_token: None,
        };
        let store = AwsSecretsManager::new("us-east-1", "gw/", credentials)
            .unwrap()
            .with_endpoint(&format!("http://{addr}/"))
            .unwrap();
        (store, emu)
    }

    fn payload(user: &str) -> Payload {
        let mut map = Payload::new();
        map.insert("username".into(), json!(user));
        map
    }

    #[tokio::test]
    async fn put_creates_then_updates() {
        let (store, emu) = start_emulator("AKIDTEST").await;
        store.put("a@b.io", "prod", &payload("v1")).await.unwrap();
        store.put("a@b.io", "prod", &payload("v2")).await.unwrap();

        assert_eq!(emu.secrets.lock().unwrap().len(), 1);
        let got = store.get("a@b.io", "prod").await.unwrap();
        assert_eq!(got["username"], "v2");
    }

    #[tokio::test]
    async fn delete_schedules_and_hides_secret() {
        let (store, _) = start_emulator("AKIDTEST").await;
        store.put("a@b.io", "prod", &payload("v1")).await.unwrap();
        store.delete("a@b.io", "prod").await.unwrap();

        assert!(store.get("a@b.io", "prod").await.unwrap_err().is_not_found());
        assert!(store.list("a@b.io").await.unwrap().is_empty());
        assert!(store.delete("a@b.io", "prod").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn put_restores_secret_pending_deletion() {
        let (store, _) = start_emulator("AKIDTEST").await;
        store.put("a@b.io", "prod", &payload("old")).await.unwrap();
        store.delete("a@b.io", "prod").await.unwrap();

        store.put("a@b.io", "prod", &payload("new")).await.unwrap();
        let got = store.get("a@b.io", "prod").await.unwrap();
        assert_eq!(got["username"], "new");
    }

    #[tokio::test]
    async fn list_paginates_by_subject_prefix() {
        let (store, _) = start_emulator("AKIDTEST").await;
        for profile in ["c", "a", "b"] {
            store.put("a@b.io", profile, &payload("x")).await.unwrap();
        }
        store.put("z@b.io", "a", &payload("x")).await.unwrap();

        let entries = store.list("a@b.io").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.profile.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(entries[0].updated_at, 1_767_225_600);
    }

    #[tokio::test]
    async fn rejected_signature_is_permission_denied() {
        let (store, _) = start_emulator("SOMEONE-ELSE").await;
        let err = store.get("a@b.io", "prod").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)), "{err}");
    }
}

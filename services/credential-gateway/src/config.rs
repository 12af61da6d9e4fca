//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (upstream client secret, session-signing key, bearer JWT key) come
//! from an env var or a `*_file` path, never from the TOML body, so a config
//! file can be committed or mounted without leaking them.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use common::Secret;
use secret_store::BackendKind;
use serde::Deserialize;

/// Minimum session-signing key length in bytes.
pub const MIN_SESSION_SECRET_LEN: usize = 32;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub bearer: BearerConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Public origin of the gateway; redirect URIs are derived from it
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream identity provider
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_authorization_endpoint")]
    pub authorization_endpoint: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OIDC_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

/// Browser session cookie
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    #[serde(default = "default_session_max_age")]
    pub max_age_secs: u64,
    /// Lifetime of an unfinished login (PKCE state + verifier)
    #[serde(default = "default_login_ttl")]
    pub login_ttl_secs: u64,
}

/// Secret store backend and its locator
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// GCP project (gcp backend)
    #[serde(default)]
    pub project_id: Option<String>,
    /// AWS region (aws backend)
    #[serde(default)]
    pub region: Option<String>,
    /// Key Vault URL (azure backend)
    #[serde(default)]
    pub vault_url: Option<String>,
    /// JSON file (file backend)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// API endpoint override for emulators (gcp, aws)
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,
}

#[derive(Debug, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_near_expiry_buffer")]
    pub near_expiry_buffer_secs: u64,
}

/// Optional HS256 bearer tokens for development and automation
#[derive(Debug, Default, Deserialize)]
pub struct BearerConfig {
    #[serde(skip)]
    pub jwt_secret: Option<Secret<String>>,
    #[serde(default)]
    pub jwt_secret_file: Option<PathBuf>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_base_url() -> String {
    "http://localhost:8000".into()
}

fn default_max_connections() -> usize {
    1000
}

fn default_authorization_endpoint() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".into()
}

fn default_token_endpoint() -> String {
    "https://oauth2.googleapis.com/token".into()
}

fn default_scopes() -> String {
    "openid email profile".into()
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_session_max_age() -> u64 {
    3600
}

fn default_login_ttl() -> u64 {
    600
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

fn default_prefix() -> String {
    "credential-gateway-".into()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("credential-gateway-secrets.json")
}

fn default_max_profiles() -> usize {
    profiles::DEFAULT_MAX_PROFILES
}

fn default_near_expiry_buffer() -> u64 {
    token_lifecycle::DEFAULT_NEAR_EXPIRY_BUFFER_SECS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            base_url: default_base_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            authorization_endpoint: default_authorization_endpoint(),
            token_endpoint: default_token_endpoint(),
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            scopes: default_scopes(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_file: None,
            max_age_secs: default_session_max_age(),
            login_ttl_secs: default_login_ttl(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            prefix: default_prefix(),
            project_id: None,
            region: None,
            vault_url: None,
            path: default_store_path(),
            endpoint: None,
        }
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            max_profiles: default_max_profiles(),
        }
    }
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            near_expiry_buffer_secs: default_near_expiry_buffer(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// resolve secrets, then validate.
    ///
    /// Secret resolution order for each secret:
    /// 1. its env var
    /// 2. its `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        config.resolve_secrets()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("credential-gateway.toml")
    }

    /// Redirect URI registered for the browser portal.
    pub fn portal_redirect_uri(&self) -> String {
        format!("{}/callback", self.server.base_url.trim_end_matches('/'))
    }

    /// Redirect URI registered for machine-client logins.
    pub fn machine_redirect_uri(&self) -> String {
        format!("{}/auth/callback", self.server.base_url.trim_end_matches('/'))
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Some(addr) = env_value("LISTEN_ADDR") {
            self.server.listen_addr = parse_env("LISTEN_ADDR", &addr)?;
        }
        if let Some(url) = env_value("OIDC_BASE_URL") {
            self.server.base_url = url;
        }
        if let Some(id) = env_value("OIDC_CLIENT_ID") {
            self.upstream.client_id = id;
        }
        if let Some(backend) = env_value("SECRETS_BACKEND") {
            self.store.backend = backend
                .parse::<BackendKind>()
                .map_err(common::Error::Config)?;
        }
        if let Some(project) = env_value("GCP_PROJECT_ID") {
            self.store.project_id = Some(project);
        }
        if let Some(region) = env_value("AWS_REGION") {
            self.store.region = Some(region);
        }
        if let Some(url) = env_value("AZURE_KEY_VAULT_URL") {
            self.store.vault_url = Some(url);
        }
        if let Some(max) = env_value("MAX_PROFILES") {
            self.profiles.max_profiles = parse_env("MAX_PROFILES", &max)?;
        }
        if let Some(buffer) = env_value("TOKEN_REFRESH_BUFFER_SECS") {
            self.tokens.near_expiry_buffer_secs = parse_env("TOKEN_REFRESH_BUFFER_SECS", &buffer)?;
        }
        Ok(())
    }

    fn resolve_secrets(&mut self) -> common::Result<()> {
        self.upstream.client_secret = resolve_secret(
            "OIDC_CLIENT_SECRET",
            self.upstream.client_secret_file.as_deref(),
        )?;
        self.session.secret = resolve_secret("SESSION_SECRET", self.session.secret_file.as_deref())?;
        self.bearer.jwt_secret =
            resolve_secret("MCP_JWT_SECRET", self.bearer.jwt_secret_file.as_deref())?;
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("base_url", &self.server.base_url)?;
        require_http_url(
            "authorization_endpoint",
            &self.upstream.authorization_endpoint,
        )?;
        require_http_url("token_endpoint", &self.upstream.token_endpoint)?;

        for (name, value) in [
            ("max_connections", self.server.max_connections as u64),
            ("timeout_secs", self.upstream.timeout_secs),
            ("max_age_secs", self.session.max_age_secs),
            ("login_ttl_secs", self.session.login_ttl_secs),
            ("max_profiles", self.profiles.max_profiles as u64),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.upstream.client_id.trim().is_empty() {
            return Err(common::Error::Config(
                "upstream client_id is required (OIDC_CLIENT_ID)".into(),
            ));
        }
        if self.upstream.client_secret.is_none() {
            return Err(common::Error::MissingSecret(
                "OIDC_CLIENT_SECRET or upstream.client_secret_file".into(),
            ));
        }
        match &self.session.secret {
            None => {
                return Err(common::Error::MissingSecret(
                    "SESSION_SECRET or session.secret_file".into(),
                ));
            }
            Some(secret) if secret.len() < MIN_SESSION_SECRET_LEN => {
                return Err(common::Error::Config(format!(
                    "session secret must be at least {MIN_SESSION_SECRET_LEN} bytes"
                )));
            }
            Some(_) => {}
        }

        match self.store.backend {
            BackendKind::Gcp if self.store.project_id.is_none() => {
                return Err(common::Error::Config(
                    "gcp backend requires store.project_id (GCP_PROJECT_ID)".into(),
                ));
            }
            BackendKind::Aws if self.store.region.is_none() => {
                return Err(common::Error::Config(
                    "aws backend requires store.region (AWS_REGION)".into(),
                ));
            }
            BackendKind::Azure => match &self.store.vault_url {
                None => {
                    return Err(common::Error::Config(
                        "azure backend requires store.vault_url (AZURE_KEY_VAULT_URL)".into(),
                    ));
                }
                Some(url) => require_http_url("vault_url", url)?,
            },
            _ => {}
        }
        if let Some(endpoint) = &self.store.endpoint {
            require_http_url("store endpoint", endpoint)?;
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> common::Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| common::Error::Config(format!("invalid {name}={raw}: {e}")))
}

fn resolve_secret(env: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Some(value) = env_value(env) {
        return Ok(Some(Secret::new(value.trim().to_owned())));
    }
    let Some(path) = file else {
        return Ok(None);
    };
    Secret::from_file(path).map_err(|e| {
        common::Error::Config(format!("failed to read secret file {}: {e}", path.display()))
    })
}

fn require_http_url(name: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "LISTEN_ADDR",
        "OIDC_BASE_URL",
        "OIDC_CLIENT_ID",
        "OIDC_CLIENT_SECRET",
        "SESSION_SECRET",
        "MCP_JWT_SECRET",
        "SECRETS_BACKEND",
        "GCP_PROJECT_ID",
        "AWS_REGION",
        "AZURE_KEY_VAULT_URL",
        "MAX_PROFILES",
        "TOKEN_REFRESH_BUFFER_SECS",
    ];

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    /// SAFETY: Callers must hold ENV_MUTEX.
    unsafe fn clear_env() {
        for key in ENV_VARS {
            unsafe { remove_env(key) };
        }
    }

    const SESSION_SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "0.0.0.0:8000"
base_url = "https://gateway.example.com/"

[upstream]
client_id = "client-123"

[store]
backend = "memory"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
            set_env("SESSION_SECRET", SESSION_SECRET);
        }

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8000);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.upstream.client_id, "client-123");
        assert_eq!(config.upstream.scopes, "openid email profile");
        assert_eq!(config.upstream.timeout_secs, 10);
        assert_eq!(config.session.login_ttl_secs, 600);
        assert_eq!(config.store.backend, BackendKind::Memory);
        assert_eq!(config.profiles.max_profiles, 10);
        assert_eq!(config.tokens.near_expiry_buffer_secs, 300);
        assert!(config.bearer.jwt_secret.is_none());
        assert_eq!(
            config.portal_redirect_uri(),
            "https://gateway.example.com/callback"
        );
        assert_eq!(
            config.machine_redirect_uri(),
            "https://gateway.example.com/auth/callback"
        );

        unsafe { clear_env() };
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_missing_session_secret_refuses_to_start() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
        }
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, common::Error::MissingSecret(_)), "{err}");
        assert!(err.to_string().contains("SESSION_SECRET"), "{err}");

        unsafe { clear_env() };
    }

    #[test]
    fn test_short_session_secret_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
            set_env("SESSION_SECRET", "too-short");
        }
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("at least 32 bytes"), "{err}");

        unsafe { clear_env() };
    }

    #[test]
    fn test_secrets_from_files() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let client_secret = dir.path().join("client_secret");
        let session_secret = dir.path().join("session_secret");
        let jwt_secret = dir.path().join("jwt_secret");
        std::fs::write(&client_secret, "from-file\n").unwrap();
        std::fs::write(&session_secret, format!("{SESSION_SECRET}\n")).unwrap();
        std::fs::write(&jwt_secret, "jwt-key").unwrap();

        let toml_content = format!(
            r#"
[upstream]
client_id = "client-123"
client_secret_file = "{}"

[session]
secret_file = "{}"

[store]
backend = "memory"

[bearer]
jwt_secret_file = "{}"
required_scopes = ["profiles:write"]
"#,
            client_secret.display(),
            session_secret.display(),
            jwt_secret.display()
        );
        let path = write_config(&dir, &toml_content);

        unsafe { clear_env() };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.upstream.client_secret.as_ref().unwrap().expose(),
            "from-file"
        );
        assert_eq!(
            config.session.secret.as_ref().unwrap().expose(),
            SESSION_SECRET
        );
        assert_eq!(config.bearer.jwt_secret.as_ref().unwrap().expose(), "jwt-key");
        assert_eq!(config.bearer.required_scopes, ["profiles:write"]);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
            set_env("SESSION_SECRET", SESSION_SECRET);
            set_env("OIDC_CLIENT_ID", "client-from-env");
            set_env("LISTEN_ADDR", "127.0.0.1:9000");
            set_env("SECRETS_BACKEND", "gcp");
            set_env("GCP_PROJECT_ID", "my-project");
            set_env("MAX_PROFILES", "3");
            set_env("TOKEN_REFRESH_BUFFER_SECS", "120");
        }

        let config = Config::load(&path).unwrap();
        assert_eq!(config.upstream.client_id, "client-from-env");
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.store.backend, BackendKind::Gcp);
        assert_eq!(config.store.project_id.as_deref(), Some("my-project"));
        assert_eq!(config.profiles.max_profiles, 3);
        assert_eq!(config.tokens.near_expiry_buffer_secs, 120);

        unsafe { clear_env() };
    }

    #[test]
    fn test_invalid_numeric_env_is_config_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            clear_env();
            set_env("MAX_PROFILES", "lots");
        }
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("MAX_PROFILES"), "{err}");

        unsafe { clear_env() };
    }

    #[test]
    fn test_backend_locator_is_required() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
            set_env("SESSION_SECRET", SESSION_SECRET);
        }

        for (backend, needle) in [
            ("gcp", "project_id"),
            ("aws", "region"),
            ("azure", "vault_url"),
        ] {
            let path = write_config(
                &dir,
                &format!("[upstream]\nclient_id = \"c\"\n\n[store]\nbackend = \"{backend}\"\n"),
            );
            let err = Config::load(&path).unwrap_err();
            assert!(err.to_string().contains(needle), "{backend}: {err}");
        }

        unsafe { clear_env() };
    }

    #[test]
    fn test_non_http_endpoint_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[upstream]
client_id = "c"
token_endpoint = "ftp://example.com/token"

[store]
backend = "memory"
"#,
        );

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
            set_env("SESSION_SECRET", SESSION_SECRET);
        }
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("token_endpoint"), "{err}");

        unsafe { clear_env() };
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[upstream]\nclient_id = \"c\"\n\n[store]\nbackend = \"memory\"\n\n[profiles]\nmax_profiles = 0\n",
        );

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "client-secret");
            set_env("SESSION_SECRET", SESSION_SECRET);
        }
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_profiles"), "{err}");

        unsafe { clear_env() };
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            clear_env();
            set_env("OIDC_CLIENT_SECRET", "very-secret-client");
            set_env("SESSION_SECRET", SESSION_SECRET);
        }
        let config = Config::load(&path).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("very-secret-client"));
        assert!(!debug.contains(SESSION_SECRET));

        unsafe { clear_env() };
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/from/cli.toml")),
            PathBuf::from("/from/cli.toml")
        );
        assert_eq!(Config::resolve_path(None), PathBuf::from("/from/env.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("credential-gateway.toml")
        );
    }
}

//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! The verifier stays server-side and is sent during code exchange; the S256
//! challenge goes in the authorization URL so the provider can bind the
//! exchange to whoever started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Generate a random PKCE code verifier.
///
/// 32 random bytes encoded as URL-safe base64 without padding: 43
/// characters, the RFC 7636 minimum length.
pub fn generate_verifier() -> String {
    random_token()
}

/// Generate an anti-CSRF `state` value.
pub fn generate_state() -> String {
    random_token()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge: `BASE64URL(SHA256(verifier))`.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Check a client-presented verifier against a stored S256 challenge.
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    let computed = compute_challenge(verifier);
    if computed.len() != challenge.len() {
        return false;
    }
    computed
        .bytes()
        .zip(challenge.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Parameters of the upstream authorization redirect.
pub struct AuthorizationRequest<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
}

/// Build the provider authorization URL.
///
/// Always asks for `access_type=offline` and `prompt=consent`; without them
/// the provider does not issue a refresh token on repeat logins.
pub fn build_authorization_url(endpoint: &str, request: &AuthorizationRequest<'_>) -> Result<String> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::TokenExchange(format!("invalid authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", request.client_id)
        .append_pair("response_type", "code")
        .append_pair("scope", request.scope)
        .append_pair("redirect_uri", request.redirect_uri)
        .append_pair("state", request.state)
        .append_pair("code_challenge", request.code_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(url.into())
}

//! JWT claim decoding
//!
//! ID tokens from the code exchange arrive over a direct TLS connection to
//! the provider, so their claims are read without signature verification.
//! Bearer JWTs presented by clients are a different matter: only HS256
//! tokens signed with the configured development secret are accepted, with
//! `exp`, `iss` and `aud` enforced.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Registered and provider claims the gateway cares about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// Space-separated scope string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Some issuers send scopes as an array instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// String or array of strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
}

impl Claims {
    /// Stable subject: `sub`, then `email`. Empty strings don't count.
    pub fn subject(&self) -> Option<&str> {
        [self.sub.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
    }

    /// Client identifier: `client_id`, then `azp`.
    pub fn client(&self) -> Option<&str> {
        self.client_id.as_deref().or(self.azp.as_deref())
    }

    /// All granted scopes from either claim shape.
    pub fn granted_scopes(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default();
        if let Some(list) = &self.scopes {
            out.extend(list.iter().map(String::as_str));
        }
        out
    }
}

/// Decode a JWT payload without checking its signature.
pub fn decode_unverified(token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(Error::Claims("token is not a three-part JWT".into())),
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Claims(format!("invalid base64url segment: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::Claims(format!("invalid JSON segment: {e}")))
}

/// Verifies HS256 bearer JWTs minted for development and automation.
pub struct Hs256Verifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Hs256Verifier {
    pub fn new(secret: Secret<String>, issuer: Option<String>, audience: Option<String>) -> Self {
        let key = secret.expose().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock in `verify`
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(issuer) = &issuer {
            validation.set_issuer(&[issuer]);
        }
        match &audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
        }
    }

    /// Verify signature, expiry, issuer and audience; return the claims.
    pub fn verify(&self, token: &str, now: u64) -> Result<Claims> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(rejection)?
            .claims;
        match claims.exp {
            Some(exp) if exp > now => Ok(claims),
            Some(_) => Err(Error::Claims("token expired".into())),
            None => Err(Error::Claims("token has no exp claim".into())),
        }
    }

    /// Mint a token with this verifier's secret. Used by tooling and tests.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Claims(format!("signing token: {e}")))
    }
}

fn rejection(e: jsonwebtoken::errors::Error) -> Error {
    let reason = match e.kind() {
        ErrorKind::InvalidSignature => "signature mismatch".to_owned(),
        ErrorKind::InvalidAlgorithm => "unsupported algorithm".to_owned(),
        ErrorKind::InvalidIssuer => "issuer mismatch".to_owned(),
        ErrorKind::InvalidAudience => "audience mismatch".to_owned(),
        ErrorKind::MissingRequiredClaim(claim) => format!("token has no {claim} claim"),
        _ => format!("invalid token: {e}"),
    };
    Error::Claims(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verifier() -> Hs256Verifier {
        Hs256Verifier::new(
            Secret::new("dev-signing-secret".into()),
            Some("https://local-issuer".into()),
            Some("credential-gateway".into()),
        )
    }

    fn valid_claims() -> Claims {
        Claims {
            sub: Some("user-1".into()),
            scope: Some("profiles:read profiles:write".into()),
            exp: Some(2_000),
            iss: Some("https://local-issuer".into()),
            aud: Some(json!("credential-gateway")),
            ..Claims::default()
        }
    }

    #[test]
    fn decodes_id_token_payload() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"1234","email":"a@b.io","aud":"c"}"#);
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");
        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims.subject(), Some("1234"));
        assert_eq!(claims.email.as_deref(), Some("a@b.io"));
    }

    #[test]
    fn subject_falls_back_to_email() {
        let claims = Claims {
            sub: Some(String::new()),
            email: Some("a@b.io".into()),
            ..Claims::default()
        };
        assert_eq!(claims.subject(), Some("a@b.io"));
        assert_eq!(Claims::default().subject(), None);
    }

    #[test]
    fn malformed_tokens_are_claims_errors() {
        assert!(matches!(decode_unverified("opaque-token"), Err(Error::Claims(_))));
        assert!(matches!(decode_unverified("a.b.c.d"), Err(Error::Claims(_))));
        assert!(matches!(decode_unverified("a.!!!.c"), Err(Error::Claims(_))));
    }

    #[test]
    fn signed_token_verifies() {
        let verifier = verifier();
        let token = verifier.sign(&valid_claims()).unwrap();
        let claims = verifier.verify(&token, 1_000).unwrap();
        assert_eq!(claims.subject(), Some("user-1"));
        assert_eq!(claims.granted_scopes(), ["profiles:read", "profiles:write"]);
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = verifier();
        let token = verifier.sign(&valid_claims()).unwrap();
        assert!(verifier.verify(&token, 2_000).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = verifier().sign(&valid_claims()).unwrap();
        let other = Hs256Verifier::new(Secret::new("other".into()), None, None);
        let err = other.verify(&token, 1_000).unwrap_err();
        assert!(err.to_string().contains("signature"), "{err}");
    }

    #[test]
    fn issuer_and_audience_are_enforced() {
        let verifier = verifier();
        let wrong_iss = Claims {
            iss: Some("https://elsewhere".into()),
            ..valid_claims()
        };
        assert!(verifier.verify(&verifier.sign(&wrong_iss).unwrap(), 1_000).is_err());

        let list_aud = Claims {
            aud: Some(json!(["other", "credential-gateway"])),
            ..valid_claims()
        };
        assert!(verifier.verify(&verifier.sign(&list_aud).unwrap(), 1_000).is_ok());

        let wrong_aud = Claims {
            aud: Some(json!("other")),
            ..valid_claims()
        };
        assert!(verifier.verify(&verifier.sign(&wrong_aud).unwrap(), 1_000).is_err());
    }

    #[test]
    fn missing_exp_is_rejected() {
        let verifier = verifier();
        let token = verifier
            .sign(&Claims {
                exp: None,
                ..valid_claims()
            })
            .unwrap();
        let err = verifier.verify(&token, 1_000).unwrap_err();
        assert!(err.to_string().contains("exp"), "{err}");
    }

    #[test]
    fn unsigned_token_is_rejected() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&valid_claims()).unwrap());
        let token = format!("{header}.{body}.");
        assert!(matches!(verifier().verify(&token, 1_000), Err(Error::Claims(_))));
    }

    #[test]
    fn audience_is_optional_when_unconfigured() {
        let open = Hs256Verifier::new(Secret::new("dev-signing-secret".into()), None, None);
        let token = verifier().sign(&valid_claims()).unwrap();
        assert!(open.verify(&token, 1_000).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let verifier = verifier();
        let token = verifier.sign(&valid_claims()).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: Some("admin".into()),
                ..valid_claims()
            })
            .unwrap(),
        );
        parts[1] = &forged;
        assert!(verifier.verify(&parts.join("."), 1_000).is_err());
    }

    #[test]
    fn scopes_array_is_accepted() {
        let claims = Claims {
            scopes: Some(vec!["a".into(), "b".into()]),
            ..Claims::default()
        };
        assert_eq!(claims.granted_scopes(), ["a", "b"]);
    }
}

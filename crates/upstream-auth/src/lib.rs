//! OAuth 2.0 mechanics against the upstream identity provider
//!
//! Leaf crate with no session or storage knowledge:
//! - `pkce`: code verifier / S256 challenge / anti-CSRF state and the
//!   authorization redirect URL
//! - `token`: the injectable `TokenEndpoint` capability (code exchange and
//!   refresh) and its reqwest implementation
//! - `claims`: unverified ID-token decoding (tokens obtained server-to-server)
//!   and HS256 verification for development bearer tokens

pub mod claims;
pub mod error;
pub mod pkce;
pub mod token;

pub use claims::{Claims, Hs256Verifier};
pub use error::{Error, Result};
pub use token::{CodeExchange, HttpTokenEndpoint, TokenEndpoint, TokenFuture, TokenResponse};

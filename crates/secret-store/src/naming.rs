//! Backend-legal secret names
//!
//! Cloud secret managers restrict names to a small alphabet (GCP: `[A-Za-z0-9_-]`,
//! Azure: `[0-9a-zA-Z-]` case-insensitive). Subjects are usually email
//! addresses, so both parts of the key are escaped:
//!
//! - ASCII alphanumerics pass through (lowercase only when the backend is
//!   case-insensitive)
//! - every other byte becomes `-hh` with lowercase hex
//!
//! An escaped string never contains `--`, which makes `--` an unambiguous
//! separator: `{prefix}{escape(subject)}--{escape(profile)}`. The encoding is
//! reversible so `list` can recover exact profile names.

use crate::error::{Error, Result};

const SEPARATOR: &str = "--";

/// Encodes `(subject, profile)` pairs into secret names for one backend.
#[derive(Debug, Clone)]
pub struct KeyEncoder {
    prefix: String,
    max_len: usize,
    case_insensitive: bool,
}

impl KeyEncoder {
    pub fn new(prefix: impl Into<String>, max_len: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_len,
            case_insensitive: false,
        }
    }

    /// Escape uppercase letters too, for backends that fold case.
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full secret name for `(subject, profile)`.
    pub fn secret_name(&self, subject: &str, profile: &str) -> Result<String> {
        let name = format!(
            "{}{}",
            self.subject_prefix(subject),
            escape(profile, self.case_insensitive)
        );
        if name.len() > self.max_len {
            return Err(Error::InvalidKey(format!(
                "encoded name for profile '{profile}' is {} characters, backend limit is {}",
                name.len(),
                self.max_len
            )));
        }
        Ok(name)
    }

    /// Name prefix shared by every secret of `subject`.
    pub fn subject_prefix(&self, subject: &str) -> String {
        format!(
            "{}{}{SEPARATOR}",
            self.prefix,
            escape(subject, self.case_insensitive)
        )
    }

    /// Recover the profile name from a secret name listed by the backend.
    ///
    /// Returns `None` for names that belong to another subject or were not
    /// written by this encoder.
    pub fn profile_from_name(&self, subject: &str, name: &str) -> Option<String> {
        let prefix = self.subject_prefix(subject);
        if !self.case_insensitive {
            return unescape(name.strip_prefix(&prefix)?);
        }
        if name.len() < prefix.len() || !name.is_char_boundary(prefix.len()) {
            return None;
        }
        let (head, tail) = name.split_at(prefix.len());
        if !head.eq_ignore_ascii_case(&prefix) {
            return None;
        }
        // Every literal letter was lowercase when written
        unescape(&tail.to_ascii_lowercase())
    }
}

/// Escape a key component.
pub fn escape(raw: &str, case_insensitive: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        let passthrough = byte.is_ascii_digit()
            || byte.is_ascii_lowercase()
            || (!case_insensitive && byte.is_ascii_uppercase());
        if passthrough {
            out.push(byte as char);
        } else {
            out.push_str(&format!("-{byte:02x}"));
        }
    }
    out
}

/// Reverse `escape`. Returns `None` on malformed input.
pub fn unescape(encoded: &str) -> Option<String> {
    let raw = encoded.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut index = 0usize;
    while index < raw.len() {
        if raw[index] == b'-' {
            let hex = encoded.get(index + 1..index + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else if raw[index].is_ascii_alphanumeric() {
            bytes.push(raw[index]);
            index += 1;
        } else {
            return None;
        }
    }
    String::from_utf8(bytes).ok()
}

//! Relay fingerprints
//!
//! Votes carry identities as unpadded base64 of the 20-byte identity digest;
//! everything else (bandwidth files, CollecTor, Onionoo) uses 40 uppercase
//! hex characters. `Fingerprint` is the hex form and the only key used by
//! the index.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a relay identity digest (SHA-1)
pub const FINGERPRINT_BYTES: usize = 20;

/// Canonical 40-character uppercase hex fingerprint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Decode the base64 identity used on vote `r` lines
    pub fn from_base64(encoded: &str) -> Option<Self> {
        let trimmed = encoded.trim_end_matches('=');
        let bytes = STANDARD_NO_PAD.decode(trimmed).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Parse hex, tolerating lowercase and a leading `$`
    pub fn from_hex(text: &str) -> Option<Self> {
        let text = text.strip_prefix('$').unwrap_or(text);
        if text.len() != FINGERPRINT_BYTES * 2 {
            return None;
        }
        let bytes = hex::decode(text).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Accept any of the forms a caller might hand us: hex (with or without
    /// `$`) or padded/unpadded base64
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        Self::from_hex(text).or_else(|| Self::from_base64(text))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FINGERPRINT_BYTES {
            return None;
        }
        Some(Fingerprint(hex::encode_upper(bytes)))
    }

    /// Re-encode to the vote form (unpadded base64)
    pub fn to_base64(&self) -> String {
        // Invariant: self.0 is always valid hex of FINGERPRINT_BYTES
        let bytes = hex::decode(&self.0).unwrap_or_default();
        STANDARD_NO_PAD.encode(bytes)
    }

    /// Padded base64, as some tools print it
    pub fn to_base64_padded(&self) -> String {
        let bytes = hex::decode(&self.0).unwrap_or_default();
        STANDARD.encode(bytes)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

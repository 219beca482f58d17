//! Ciphertext-at-rest representation.
//!
//! Format: `ENC1:<version>:<base64(nonce || ciphertext || tag)>`
//!
//! The prefix names the envelope layout (AES-256-GCM, 12-byte nonce,
//! 16-byte tag); the version names the tenant key that sealed it. Once
//! written to a column this layout must keep parsing forever.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::models::tenant_key::{KeyVersion, TenantId};
use crate::services::encryption_service::{EncryptionError, Result};

pub const ENVELOPE_PREFIX: &str = "ENC1";
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: KeyVersion,
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended
    pub sealed: Vec<u8>,
}

impl Envelope {
    pub fn new(version: KeyVersion, nonce: [u8; NONCE_LEN], sealed: Vec<u8>) -> Self {
        Self { version, nonce, sealed }
    }

    /// Parse a stored envelope; never touches key material
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        if prefix != ENVELOPE_PREFIX {
            return Err(EncryptionError::MalformedEnvelope("unknown envelope prefix".to_string()));
        }

        // Canonical decimal only, so one version has exactly one header
        let version = parts
            .next()
            .filter(|v| v.bytes().all(|b| b.is_ascii_digit()) && !v.starts_with('0'))
            .and_then(|v| v.parse::<u32>().ok())
            .and_then(KeyVersion::new)
            .ok_or_else(|| EncryptionError::MalformedEnvelope("invalid key version".to_string()))?;

        let payload = parts
            .next()
            .ok_or_else(|| EncryptionError::MalformedEnvelope("missing payload".to_string()))?;

        let bytes = BASE64
            .decode(payload)
            .map_err(|_| EncryptionError::MalformedEnvelope("payload is not valid base64".to_string()))?;

        // Must have at least nonce (12) + tag (16) = 28 bytes
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::MalformedEnvelope("payload too short".to_string()));
        }

        let (nonce_bytes, sealed) = bytes.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            version,
            nonce,
            sealed: sealed.to_vec(),
        })
    }

    /// Key version of a stored value without decoding the payload
    pub fn peek_version(raw: &str) -> Result<KeyVersion> {
        Self::parse(raw).map(|e| e.version)
    }

    /// Serialized form stored in the caller's column
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(NONCE_LEN + self.sealed.len());
        payload.extend_from_slice(&self.nonce);
        payload.extend_from_slice(&self.sealed);
        format!("{}:{}:{}", ENVELOPE_PREFIX, self.version.get(), BASE64.encode(payload))
    }

    /// Associated data binding a ciphertext to its tenant and key version
    pub fn associated_data(tenant: &TenantId, version: KeyVersion) -> Vec<u8> {
        format!("{}:{}", tenant, version).into_bytes()
    }
}

/// Cheap check for values that already carry an envelope
pub fn is_envelope(raw: &str) -> bool {
    raw.starts_with(ENVELOPE_PREFIX) && raw[ENVELOPE_PREFIX.len()..].starts_with(':')
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("version", &self.version)
            .field("sealed_len", &self.sealed.len())
            .finish_non_exhaustive()
    }
}

impl FromStr for Envelope {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

//! Tenant (district) keys and the identifiers used to address them.
//!
//! A tenant owns exactly one `Active` key at a time plus any number of
//! `Archived` keys kept so that older envelopes stay decryptable.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::services::encryption_service::{EncryptionError, Result};
use crate::utils::log_sanitizer::sanitize_for_log;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// Tenant ids end up inside secret-store paths, so only a safe charset is allowed
static TENANT_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("tenant id regex is valid")
});

/// Identifier of an isolated administrative unit (district)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if !TENANT_ID_REGEX.is_match(&raw) {
            return Err(EncryptionError::InvalidTenant(sanitize_for_log(&raw)));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = EncryptionError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Monotonic key version; the first key of a tenant is `v1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(u32);

impl KeyVersion {
    pub const INITIAL: KeyVersion = KeyVersion(1);

    pub fn new(n: u32) -> Option<Self> {
        (n > 0).then_some(Self(n))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Result<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| EncryptionError::InvalidKey("key version space exhausted".to_string()))
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// 256-bit symmetric key, wiped from memory when dropped
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            EncryptionError::InvalidKey(format!(
                "expected {} bytes of key material, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Fresh key from the OS-seeded CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| EncryptionError::InvalidKey("key material is not valid base64".to_string()))?;
        let key = Self::from_slice(&decoded);
        decoded.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,   // Used for new encryptions
    Archived, // Decryption only, immutable
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Archived => "archived",
        }
    }
}

impl FromStr for KeyStatus {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "archived" => Ok(KeyStatus::Archived),
            other => Err(EncryptionError::InvalidKey(format!("unknown key status '{}'", other))),
        }
    }
}

/// A tenant key as resolved through the key provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantKey {
    pub tenant_id: TenantId,
    pub version: KeyVersion,
    pub material: KeyMaterial,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl TenantKey {
    /// New active key with fresh material
    pub fn generate(tenant_id: TenantId, version: KeyVersion) -> Self {
        Self {
            tenant_id,
            version,
            material: KeyMaterial::generate(),
            status: KeyStatus::Active,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    /// Same key, retired: keeps its creation time, stamps the archive date
    pub fn archived(&self) -> Self {
        Self {
            status: KeyStatus::Archived,
            archived_at: Some(self.archived_at.unwrap_or_else(Utc::now)),
            ..self.clone()
        }
    }

    /// Same key, (re)activated
    pub fn activated(&self) -> Self {
        Self {
            status: KeyStatus::Active,
            archived_at: None,
            ..self.clone()
        }
    }

    /// Dated label used for archived copies, e.g. `D001_v3_20261016`
    pub fn archive_label(&self) -> String {
        let date = self.archived_at.unwrap_or_else(Utc::now);
        format!("{}_{}_{}", self.tenant_id, self.version, date.format("%Y%m%d"))
    }

    pub fn age_days(&self) -> i64 {
        (Utc::now() - self.created_at).num_days()
    }

    pub fn to_record(&self) -> StoredKeyRecord {
        StoredKeyRecord {
            tenant_id: self.tenant_id.to_string(),
            version: self.version.get(),
            key: self.material.to_base64(),
            status: self.status,
            created_at: self.created_at,
            archived_at: self.archived_at,
        }
    }
}

/// Serialized form of a key inside a secret-store value
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredKeyRecord {
    pub tenant_id: String,
    pub version: u32,
    pub key: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl StoredKeyRecord {
    pub fn into_tenant_key(self) -> Result<TenantKey> {
        let tenant_id = TenantId::new(self.tenant_id.clone())?;
        let version = KeyVersion::new(self.version).ok_or_else(|| {
            EncryptionError::InvalidKey(format!("stored key for {} has version 0", tenant_id))
        })?;
        Ok(TenantKey {
            tenant_id,
            version,
            material: KeyMaterial::from_base64(&self.key)?,
            status: self.status,
            created_at: self.created_at,
            archived_at: self.archived_at,
        })
    }
}

impl Drop for StoredKeyRecord {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for StoredKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKeyRecord")
            .field("tenant_id", &self.tenant_id)
            .field("version", &self.version)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

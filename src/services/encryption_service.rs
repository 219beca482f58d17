///! AES-256-GCM Field Encryption Service
///!
///! Per-district authenticated encryption for personally identifiable fields
///! (names, birthdays, registry numbers) stored in the registry database.
///!
///! Security properties:
///! - AES-256: one 256-bit key per district, resolved through the KeyProvider
///! - GCM: authenticated encryption (detects tampering)
///! - Fresh random 96-bit nonce per call (equal plaintexts never correlate)
///! - Ciphertext bound to tenant and key version via associated data
///! - Self-describing envelope: the key version travels with the value

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::models::envelope::{Envelope, NONCE_LEN};
use crate::models::tenant_key::{KeyMaterial, KeyVersion, TenantId, TenantKey};
use crate::services::key_provider::KeyProvider;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("No encryption key for tenant {tenant} ({})", .version.map(|v| v.to_string()).unwrap_or_else(|| "active".to_string()))]
    KeyNotFound {
        tenant: String,
        version: Option<KeyVersion>,
    },

    #[error("Key provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Decryption failed for tenant {tenant} with key {version}")]
    DecryptionFailed {
        tenant: String,
        version: KeyVersion,
    },

    #[error("Rotation verification failed for tenant {tenant} with key {version}")]
    RotationVerificationFailed {
        tenant: String,
        version: KeyVersion,
    },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid tenant id: {0}")]
    InvalidTenant(String),

    #[error("Archived key {version} of tenant {tenant} already exists with different material")]
    ArchiveConflict {
        tenant: String,
        version: KeyVersion,
    },

    #[error("Rotation already in progress for tenant {0}")]
    RotationInProgress(String),

    #[error("Rollback failed for tenant {tenant}: {reason}")]
    RollbackFailed {
        tenant: String,
        reason: String,
    },
}

impl EncryptionError {
    /// Transient infrastructure failure; the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, EncryptionError::ProviderUnavailable(_))
    }

    pub(crate) fn key_not_found(tenant: &TenantId, version: Option<KeyVersion>) -> Self {
        EncryptionError::KeyNotFound {
            tenant: tenant.to_string(),
            version,
        }
    }
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Encryption engine for tenant-scoped fields
///
/// Holds no mutable state of its own; cloning shares the provider.
#[derive(Clone)]
pub struct EncryptionService {
    provider: Arc<KeyProvider>,
}

impl EncryptionService {
    pub fn new(provider: Arc<KeyProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<KeyProvider> {
        &self.provider
    }

    /// Encrypt with the tenant's active key
    ///
    /// Returns the serialized envelope `ENC1:<version>:<base64>`
    pub async fn encrypt(&self, plaintext: &str, tenant: &TenantId) -> Result<String> {
        let key = self.provider.get_active_key(tenant).await?;
        let envelope = Self::seal_with(&key, plaintext.as_bytes())?;
        Ok(envelope.encode())
    }

    /// Decrypt with exactly the key version named by the envelope
    ///
    /// An authentication failure is reported as-is; no other key is tried.
    pub async fn decrypt(&self, envelope: &str, tenant: &TenantId) -> Result<String> {
        let envelope = Envelope::parse(envelope)?;
        let key = self.provider.get_key_by_version(tenant, envelope.version).await?;
        let plaintext = Self::open_with(&key, &envelope)?;

        String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptionFailed {
            tenant: tenant.to_string(),
            version: envelope.version,
        })
    }

    /// Encrypt optional string (for nullable columns)
    pub async fn encrypt_optional(
        &self,
        plaintext: Option<&str>,
        tenant: &TenantId,
    ) -> Result<Option<String>> {
        match plaintext {
            Some(text) => Ok(Some(self.encrypt(text, tenant).await?)),
            None => Ok(None),
        }
    }

    /// Decrypt optional string
    pub async fn decrypt_optional(
        &self,
        envelope: Option<&str>,
        tenant: &TenantId,
    ) -> Result<Option<String>> {
        match envelope {
            Some(text) => Ok(Some(self.decrypt(text, tenant).await?)),
            None => Ok(None),
        }
    }

    /// Seal bytes under a specific key (no provider lookup)
    pub fn seal_with(key: &TenantKey, plaintext: &[u8]) -> Result<Envelope> {
        let cipher = cipher_for(&key.material)?;

        // Generate unique 96-bit nonce - MUST be unique per encryption
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let aad = Envelope::associated_data(&key.tenant_id, key.version);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: plaintext, aad: &aad },
            )
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        Ok(Envelope::new(key.version, nonce_bytes, sealed))
    }

    /// Open an envelope with a specific key (no provider lookup)
    pub fn open_with(key: &TenantKey, envelope: &Envelope) -> Result<Vec<u8>> {
        let failed = || EncryptionError::DecryptionFailed {
            tenant: key.tenant_id.to_string(),
            version: envelope.version,
        };

        if key.version != envelope.version {
            return Err(failed());
        }

        let cipher = cipher_for(&key.material)?;
        let aad = Envelope::associated_data(&key.tenant_id, envelope.version);

        // Decrypt and verify authentication tag
        cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload { msg: &envelope.sealed, aad: &aad },
            )
            .map_err(|_| failed())
    }

    /// Generate a new 256-bit key, base64-encoded
    pub fn generate_key() -> String {
        KeyMaterial::generate().to_base64()
    }
}

fn cipher_for(material: &KeyMaterial) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(material.as_bytes())
        .map_err(|_| EncryptionError::InvalidKey("AES-256 requires a 32-byte key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::envelope::is_envelope;
    use crate::services::secret_store::MemoryKeyStore;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

    async fn service_with(tenants: &[&str]) -> EncryptionService {
        let store = Arc::new(MemoryKeyStore::new());
        for t in tenants {
            store.seed(TenantKey::generate(TenantId::new(*t).unwrap(), KeyVersion::INITIAL));
        }
        EncryptionService::new(Arc::new(KeyProvider::new(store)))
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_encryption_decryption() {
        let service = service_with(&["D001"]).await;

        let plaintext = "Juan Dela Cruz";
        let envelope = service.encrypt(plaintext, &tenant("D001")).await.unwrap();
        let decrypted = service.decrypt(&envelope, &tenant("D001")).await.unwrap();

        assert_eq!(plaintext, decrypted);
        assert!(is_envelope(&envelope));
        assert!(!envelope.contains(plaintext));
    }

    #[tokio::test]
    async fn test_empty_string_is_still_sealed() {
        let service = service_with(&["D001"]).await;

        let envelope = service.encrypt("", &tenant("D001")).await.unwrap();
        assert!(is_envelope(&envelope));
        assert_eq!(service.decrypt(&envelope, &tenant("D001")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_unique_nonces() {
        let service = service_with(&["D001"]).await;

        let plaintext = "1987-04-12";
        let e1 = service.encrypt(plaintext, &tenant("D001")).await.unwrap();
        let e2 = service.encrypt(plaintext, &tenant("D001")).await.unwrap();

        // Same plaintext should produce different envelopes (different nonces)
        assert_ne!(e1, e2);

        assert_eq!(service.decrypt(&e1, &tenant("D001")).await.unwrap(), plaintext);
        assert_eq!(service.decrypt(&e2, &tenant("D001")).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_every_payload_bit_flip_is_detected() {
        let service = service_with(&["D001"]).await;
        let encoded = service.encrypt("REG-000123", &tenant("D001")).await.unwrap();
        let envelope = Envelope::parse(&encoded).unwrap();

        let mut payload = envelope.nonce.to_vec();
        payload.extend_from_slice(&envelope.sealed);

        for byte in 0..payload.len() {
            for bit in 0..8 {
                let mut tampered = payload.clone();
                tampered[byte] ^= 1 << bit;
                let raw = format!("ENC1:{}:{}", envelope.version.get(), BASE64.encode(&tampered));

                let result = service.decrypt(&raw, &tenant("D001")).await;
                assert!(
                    matches!(result, Err(EncryptionError::DecryptionFailed { .. })),
                    "flip at byte {} bit {} not detected",
                    byte,
                    bit
                );
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_envelope_is_rejected() {
        let service = service_with(&["D001"]).await;
        let mut encoded = service.encrypt("Maria Santos", &tenant("D001")).await.unwrap();
        encoded.truncate(encoded.len() - 4);

        assert!(service.decrypt(&encoded, &tenant("D001")).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_envelope() {
        let service = service_with(&["D001"]).await;
        let result = service.decrypt("Juan Dela Cruz", &tenant("D001")).await;
        assert!(matches!(result, Err(EncryptionError::MalformedEnvelope(_))));
    }

    #[tokio::test]
    async fn test_cross_tenant_isolation() {
        let service = service_with(&["D001", "D002"]).await;
        let envelope = service.encrypt("Maria Santos", &tenant("D001")).await.unwrap();

        let result = service.decrypt(&envelope, &tenant("D002")).await;
        assert!(matches!(result, Err(EncryptionError::DecryptionFailed { .. })));
    }

    #[tokio::test]
    async fn test_same_key_different_tenant_still_fails() {
        // Associated data binds the tenant even if two tenants shared material
        let key = TenantKey::generate(tenant("D001"), KeyVersion::INITIAL);
        let envelope = EncryptionService::seal_with(&key, b"secret").unwrap();

        let impostor = TenantKey {
            tenant_id: tenant("D002"),
            ..key.clone()
        };
        assert!(EncryptionService::open_with(&impostor, &envelope).is_err());
        assert_eq!(EncryptionService::open_with(&key, &envelope).unwrap(), b"secret");
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let service = service_with(&["D001"]).await;
        let result = service.encrypt("x", &tenant("D999")).await;
        assert!(matches!(result, Err(EncryptionError::KeyNotFound { version: None, .. })));
    }

    #[tokio::test]
    async fn test_unknown_version() {
        let service = service_with(&["D001"]).await;
        let envelope = service.encrypt("x", &tenant("D001")).await.unwrap();
        let bumped = envelope.replacen("ENC1:1:", "ENC1:7:", 1);

        let result = service.decrypt(&bumped, &tenant("D001")).await;
        assert!(matches!(result, Err(EncryptionError::KeyNotFound { version: Some(_), .. })));
    }

    #[tokio::test]
    async fn test_optional_encryption() {
        let service = service_with(&["D001"]).await;
        let t = tenant("D001");

        let encrypted = service.encrypt_optional(Some("data"), &t).await.unwrap();
        let decrypted = service.decrypt_optional(encrypted.as_deref(), &t).await.unwrap();
        assert_eq!(decrypted.as_deref(), Some("data"));

        assert!(service.encrypt_optional(None, &t).await.unwrap().is_none());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EncryptionError::ProviderUnavailable("timeout".into()).is_retryable());
        assert!(!EncryptionError::MalformedEnvelope("x".into()).is_retryable());
    }
}

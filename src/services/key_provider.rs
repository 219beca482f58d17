// ============================================================================
// Key Provider - Tenant key resolution
// ============================================================================
//
// Resolves the key a tenant (district) encrypts with, and any older version
// still referenced by stored envelopes.
//
// Resolution chain:
//   1. Provider-owned cache (see KeyCache)
//   2. Primary store (remote secret manager) - authoritative
//   3. Fallback store (local database mirror) - only when the primary is
//      unavailable, and only for version lookups; an answer from the
//      fallback never decides which key is active. Each fallback lookup is
//      bounded by `fallback_timeout`
//
// Writes go to the primary store only; a successful write is then mirrored
// into the fallback best-effort. The encrypt/decrypt path never writes.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use crate::models::tenant_key::{KeyStatus, KeyVersion, TenantId, TenantKey};
use crate::services::encryption_service::{EncryptionError, Result};
use crate::services::key_cache::{CacheSlot, KeyCache};
use crate::services::secret_store::KeyStore;

/// Upper bound for one version lookup against the fallback store
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KeyProvider {
    primary: Arc<dyn KeyStore>,
    fallback: Option<Arc<dyn KeyStore>>,
    fallback_timeout: Duration,
    cache: KeyCache,
}

impl KeyProvider {
    pub fn new(primary: Arc<dyn KeyStore>) -> Self {
        Self {
            primary,
            fallback: None,
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            cache: KeyCache::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn KeyStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: KeyCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// The key new encryptions for `tenant` must use
    ///
    /// Fails with `KeyNotFound` for an unknown tenant and with
    /// `ProviderUnavailable` when the primary store cannot be reached.
    pub async fn get_active_key(&self, tenant: &TenantId) -> Result<TenantKey> {
        if let Some(key) = self.cache.get(tenant, CacheSlot::Active) {
            return Ok(key);
        }

        let generation = self.cache.generation();
        let key = self
            .primary
            .fetch_active(tenant)
            .await?
            .ok_or_else(|| EncryptionError::key_not_found(tenant, None))?;

        self.cache.insert_if_current(generation, CacheSlot::Active, &key);
        Ok(key)
    }

    /// A specific key version, for decrypting older envelopes
    ///
    /// Searches the active key first, then archived keys.
    pub async fn get_key_by_version(&self, tenant: &TenantId, version: KeyVersion) -> Result<TenantKey> {
        if let Some(key) = self.cache.get(tenant, CacheSlot::Version(version)) {
            return Ok(key);
        }

        let generation = self.cache.generation();
        match self.lookup_version(self.primary.as_ref(), tenant, version).await {
            Ok(Some(key)) => {
                self.cache.insert_if_current(generation, CacheSlot::Version(version), &key);
                Ok(key)
            }
            Ok(None) => Err(EncryptionError::key_not_found(tenant, Some(version))),
            Err(err) if err.is_retryable() => self.fallback_version(tenant, version, err).await,
            Err(err) => Err(err),
        }
    }

    async fn lookup_version(
        &self,
        store: &dyn KeyStore,
        tenant: &TenantId,
        version: KeyVersion,
    ) -> Result<Option<TenantKey>> {
        if let Some(active) = store.fetch_active(tenant).await? {
            if active.version == version {
                return Ok(Some(active));
            }
        }
        store.fetch_archived(tenant, version).await
    }

    async fn fallback_version(
        &self,
        tenant: &TenantId,
        version: KeyVersion,
        primary_err: EncryptionError,
    ) -> Result<TenantKey> {
        let Some(fallback) = &self.fallback else {
            return Err(primary_err);
        };

        tracing::warn!(
            tenant = %tenant,
            version = %version,
            backend = fallback.backend_name(),
            error = %primary_err,
            "Primary key store unavailable, trying fallback"
        );

        let lookup = self.lookup_version(fallback.as_ref(), tenant, version);
        match tokio::time::timeout(self.fallback_timeout, lookup).await {
            // Not cached: the mirror may lag, the primary stays authoritative
            Ok(Ok(Some(key))) => Ok(key),
            Ok(Ok(None)) => Err(primary_err),
            Ok(Err(fallback_err)) => {
                tracing::warn!(
                    tenant = %tenant,
                    error = %fallback_err,
                    "Fallback key store also failed"
                );
                Err(primary_err)
            }
            Err(_) => {
                tracing::warn!(
                    tenant = %tenant,
                    backend = fallback.backend_name(),
                    timeout_ms = self.fallback_timeout.as_millis() as u64,
                    "Fallback key store timed out"
                );
                Err(EncryptionError::ProviderUnavailable(format!(
                    "primary store unavailable and {} fallback timed out",
                    fallback.backend_name()
                )))
            }
        }
    }

    /// Idempotent upsert into the primary store
    ///
    /// Archived versions are immutable: re-storing identical material is a
    /// no-op, different material fails with `ArchiveConflict`. Only the
    /// rotation orchestrator calls this.
    pub async fn store_key(&self, key: &TenantKey) -> Result<()> {
        if key.status == KeyStatus::Archived {
            if let Some(existing) = self.primary.fetch_archived(&key.tenant_id, key.version).await? {
                if existing.material != key.material {
                    return Err(EncryptionError::ArchiveConflict {
                        tenant: key.tenant_id.to_string(),
                        version: key.version,
                    });
                }
                self.mirror(key).await;
                return Ok(());
            }
        }

        self.primary.put_key(key).await?;
        self.cache.invalidate_tenant(&key.tenant_id);

        tracing::info!(
            tenant = %key.tenant_id,
            version = %key.version,
            status = key.status.as_str(),
            fingerprint = %key.material.fingerprint(),
            "Tenant key stored"
        );

        self.mirror(key).await;
        Ok(())
    }

    async fn mirror(&self, key: &TenantKey) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        let write = match tokio::time::timeout(self.fallback_timeout, fallback.put_key(key)).await {
            Ok(result) => result,
            Err(_) => Err(EncryptionError::ProviderUnavailable(
                "fallback mirror write timed out".to_string(),
            )),
        };
        if let Err(e) = write {
            tracing::warn!(
                tenant = %key.tenant_id,
                version = %key.version,
                error = %e,
                "Fallback mirror write failed (primary store is authoritative)"
            );
        }
    }

    /// Every version known for the tenant, ascending
    pub async fn list_versions(&self, tenant: &TenantId) -> Result<Vec<KeyVersion>> {
        let mut versions = self.primary.list_archived_versions(tenant).await?;
        if let Some(active) = self.primary.fetch_active(tenant).await? {
            versions.push(active.version);
        }
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        self.primary.list_tenants().await
    }

    /// Drop every cached key; subsequent lookups hit the store
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    pub fn invalidate_tenant(&self, tenant: &TenantId) {
        self.cache.invalidate_tenant(tenant);
    }
}

//! In-memory key store for tests and local development
//!
//! Thread-safe (DashMap). `set_available(false)` simulates an outage of the
//! backing service so callers can exercise fallback and retry paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::tenant_key::{KeyStatus, KeyVersion, TenantId, TenantKey};
use crate::services::encryption_service::{EncryptionError, Result};
use crate::services::secret_store::KeyStore;

#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    active: Arc<DashMap<TenantId, TenantKey>>,
    archive: Arc<DashMap<(TenantId, KeyVersion), TenantKey>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key directly, bypassing availability checks
    pub fn seed(&self, key: TenantKey) {
        match key.status {
            KeyStatus::Active => {
                self.active.insert(key.tenant_id.clone(), key);
            }
            KeyStatus::Archived => {
                self.archive.insert((key.tenant_id.clone(), key.version), key);
            }
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn archived_count(&self, tenant: &TenantId) -> usize {
        self.archive.iter().filter(|e| &e.key().0 == tenant).count()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EncryptionError::ProviderUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_active(&self, tenant: &TenantId) -> Result<Option<TenantKey>> {
        self.check_available()?;
        Ok(self.active.get(tenant).map(|k| k.clone()))
    }

    async fn fetch_archived(&self, tenant: &TenantId, version: KeyVersion) -> Result<Option<TenantKey>> {
        self.check_available()?;
        Ok(self.archive.get(&(tenant.clone(), version)).map(|k| k.clone()))
    }

    async fn put_key(&self, key: &TenantKey) -> Result<()> {
        self.check_available()?;
        self.seed(key.clone());
        Ok(())
    }

    async fn list_archived_versions(&self, tenant: &TenantId) -> Result<Vec<KeyVersion>> {
        self.check_available()?;
        let mut versions: Vec<KeyVersion> = self
            .archive
            .iter()
            .filter(|e| &e.key().0 == tenant)
            .map(|e| e.key().1)
            .collect();
        versions.sort();
        Ok(versions)
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        self.check_available()?;
        let mut tenants: Vec<TenantId> = self.active.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        Ok(tenants)
    }
}

//! Backends that hold tenant key material.
//!
//! The `KeyProvider` talks to a primary store (the remote secret manager) and
//! optionally a read-mostly fallback (the local database table). Every backend
//! reports failures with the same typed errors: an unreachable backend is
//! `ProviderUnavailable`, an absent key is `Ok(None)`.

pub mod database;
pub mod memory;
pub mod vault;

pub use database::DatabaseKeyStore;
pub use memory::MemoryKeyStore;
pub use vault::{VaultConfig, VaultKeyStore};

use async_trait::async_trait;

use crate::models::tenant_key::{KeyVersion, TenantId, TenantKey};
use crate::services::encryption_service::Result;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// The tenant's current active key
    async fn fetch_active(&self, tenant: &TenantId) -> Result<Option<TenantKey>>;

    /// An archived key by version
    async fn fetch_archived(&self, tenant: &TenantId, version: KeyVersion) -> Result<Option<TenantKey>>;

    /// Upsert; an `Active` key replaces the tenant's active slot in one write
    async fn put_key(&self, key: &TenantKey) -> Result<()>;

    async fn list_archived_versions(&self, tenant: &TenantId) -> Result<Vec<KeyVersion>>;

    /// Tenants that currently have an active key
    async fn list_tenants(&self) -> Result<Vec<TenantId>>;
}

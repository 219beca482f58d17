// ============================================================================
// Encryption Key Rotation Service - Per-district key lifecycle
// ============================================================================
//
// 🔒 SECURITY: Replaces a district's active key while every envelope written
// under an older key stays decryptable.
//
// ## Rotation state machine (per tenant):
//
//   Started -> Archived -> Generated -> Activated -> Verifying -> Committed
//                                                        |
//                                                        +-> RolledBack
//
// 1. Start:    lock the tenant, read the current active key (v_old)
// 2. Archive:  store v_old under its archived version; must succeed first
// 3. Generate: fresh random key, version = highest known version + 1
// 4. Activate: single write of v_new into the tenant's active slot
// 5. Verify:   invalidate the cache, confirm the store serves v_new, then
//              round-trip a synthetic value through the engine
// 6. Commit:   v_old stays archived indefinitely
//
// Any failure in steps 1-4 aborts with the error; nothing a caller could
// observe has changed (an archived copy of the still-active key is harmless).
// A failure in step 5 rolls back: v_new is archived (a concurrent caller may
// already have sealed data with it), then v_old is reactivated. A failed
// reactivation is a fatal operational alert and is returned as RollbackFailed.
//
// Stored data is never rewritten here; see ReencryptionService.
//
// ============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::envelope::Envelope;
use crate::models::rotation::{RotationRecord, RotationState, RotationSummary, TenantSelector};
use crate::models::tenant_key::{KeyVersion, TenantId, TenantKey};
use crate::services::encryption_service::{EncryptionError, EncryptionService, Result};
use crate::services::key_provider::KeyProvider;
use crate::services::reencryption_service::ReencryptionService;
use crate::services::rotation_lock::{RotationLease, RotationLock};

/// 🔒 SECURITY: Recommended rotation schedule
pub const DEFAULT_ROTATION_INTERVAL_DAYS: i64 = 90;

/// Key age report for one tenant
#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub tenant_id: TenantId,
    pub active_version: KeyVersion,
    pub archived_versions: usize,
    pub key_created_at: DateTime<Utc>,
    pub key_age_days: i64,
    pub days_until_rotation: i64,
}

impl RotationStatus {
    pub fn is_overdue(&self) -> bool {
        self.days_until_rotation <= 0
    }
}

pub struct EncryptionKeyRotationService {
    provider: Arc<KeyProvider>,
    encryption: EncryptionService,
    lock: Arc<dyn RotationLock>,
    reencryption: Option<ReencryptionService>,
    rotation_interval_days: i64,
}

impl EncryptionKeyRotationService {
    pub fn new(encryption: EncryptionService, lock: Arc<dyn RotationLock>) -> Self {
        Self {
            provider: encryption.provider().clone(),
            encryption,
            lock,
            reencryption: None,
            rotation_interval_days: DEFAULT_ROTATION_INTERVAL_DAYS,
        }
    }

    pub fn with_reencryption(mut self, reencryption: ReencryptionService) -> Self {
        self.reencryption = Some(reencryption);
        self
    }

    pub fn with_rotation_interval(mut self, days: i64) -> Self {
        self.rotation_interval_days = days;
        self
    }

    /// Create the first key of a tenant; returns the existing key if present
    pub async fn provision_tenant(&self, tenant: &TenantId) -> Result<TenantKey> {
        let lease = self.lock.acquire(tenant).await?;
        let result = self.provision_locked(tenant).await;
        self.release(&lease).await;
        result
    }

    async fn provision_locked(&self, tenant: &TenantId) -> Result<TenantKey> {
        self.provider.invalidate_tenant(tenant);
        match self.provider.get_active_key(tenant).await {
            Ok(existing) => return Ok(existing),
            Err(EncryptionError::KeyNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let version = self.next_version(tenant).await?;
        let key = TenantKey::generate(tenant.clone(), version);
        self.provider.store_key(&key).await?;

        tracing::info!(
            tenant = %tenant,
            version = %key.version,
            "✅ Provisioned tenant encryption key"
        );
        Ok(key)
    }

    /// Rotate one tenant's key
    ///
    /// Returns the record for `Committed` and `RolledBack` outcomes; errors
    /// mean the rotation aborted before any caller-visible change, or that a
    /// rollback could not be completed (`RollbackFailed`).
    pub async fn rotate_tenant(&self, tenant: &TenantId, reencrypt: bool) -> Result<RotationRecord> {
        let lease = self.lock.acquire(tenant).await?;

        let mut record = RotationRecord::start(tenant.clone());
        let result = self.run_rotation(&mut record).await;
        self.release(&lease).await;
        result?;

        if reencrypt && record.is_committed() {
            self.reencrypt_after_commit(&mut record).await;
        }

        Ok(record)
    }

    /// Rotate every selected tenant, one at a time
    pub async fn rotate(&self, selector: &TenantSelector, reencrypt: bool) -> Result<RotationSummary> {
        let tenants = match selector {
            TenantSelector::All => self.provider.list_tenants().await?,
            TenantSelector::Only(tenants) => tenants.clone(),
        };

        tracing::info!("Starting key rotation for {} tenant(s)", tenants.len());

        let mut summary = RotationSummary::default();
        for tenant in &tenants {
            match self.rotate_tenant(tenant, reencrypt).await {
                Ok(record) => summary.push(record),
                Err(e) => {
                    let mut record = RotationRecord::start(tenant.clone());
                    let state = match &e {
                        // Not an abort: the tenant may be left on the new key
                        EncryptionError::RollbackFailed { .. } => RotationState::Verifying,
                        _ => RotationState::Aborted,
                    };
                    record.fail(state, e.to_string());
                    summary.push(record);
                }
            }
        }

        tracing::info!(
            committed = summary.committed,
            rolled_back = summary.rolled_back,
            failed = summary.failed,
            "Key rotation run finished"
        );

        Ok(summary)
    }

    async fn run_rotation(&self, record: &mut RotationRecord) -> Result<()> {
        let tenant = record.tenant_id.clone();

        // 1. Start: always read the store, never a cached value
        self.provider.invalidate_tenant(&tenant);
        let old_key = self.provider.get_active_key(&tenant).await?;
        record.old_version = Some(old_key.version);

        tracing::warn!(
            tenant = %tenant,
            version = %old_key.version,
            "🔑 Starting encryption key rotation"
        );

        // 2. Archive
        let archived = old_key.archived();
        self.provider.store_key(&archived).await?;
        record.advance(RotationState::Archived);
        tracing::info!(tenant = %tenant, archive = %archived.archive_label(), "Previous key archived");

        // 3. Generate
        let new_version = self.next_version(&tenant).await?;
        let new_key = TenantKey::generate(tenant.clone(), new_version);
        record.new_version = Some(new_version);
        record.advance(RotationState::Generated);

        // 4. Activate
        if let Err(e) = self.provider.store_key(&new_key).await {
            // The write may or may not have landed; forget whatever we cached
            self.provider.invalidate_tenant(&tenant);
            return Err(e);
        }
        record.advance(RotationState::Activated);

        // 5. Verify
        self.provider.invalidate_cache();
        record.advance(RotationState::Verifying);

        if let Err(e) = self.verify(&new_key).await {
            tracing::error!(
                tenant = %tenant,
                version = %new_key.version,
                error = %e,
                "❌ Rotation verification failed, rolling back"
            );
            self.rollback(&old_key, &new_key).await?;
            record.fail(RotationState::RolledBack, e.to_string());
            return Ok(());
        }

        // 6. Commit
        record.advance(RotationState::Committed);
        tracing::warn!(
            tenant = %tenant,
            old_version = %old_key.version,
            new_version = %new_key.version,
            fingerprint = %new_key.material.fingerprint(),
            "🔑 ENCRYPTION KEY ROTATED (old key archived, existing data still readable)"
        );
        Ok(())
    }

    /// Confirm the store serves `expected` and the engine round-trips with it
    async fn verify(&self, expected: &TenantKey) -> Result<()> {
        let tenant = &expected.tenant_id;
        let failed = || EncryptionError::RotationVerificationFailed {
            tenant: tenant.to_string(),
            version: expected.version,
        };

        let served = self.provider.get_active_key(tenant).await.map_err(|e| {
            tracing::warn!(tenant = %tenant, error = %e, "Active key lookup failed during verification");
            failed()
        })?;
        if served.version != expected.version || served.material != expected.material {
            return Err(failed());
        }

        let probe = format!("rotation-probe:{}:{}", tenant, Uuid::new_v4());
        let envelope = self.encryption.encrypt(&probe, tenant).await.map_err(|e| {
            tracing::warn!(tenant = %tenant, error = %e, "Probe encryption failed");
            failed()
        })?;

        if Envelope::peek_version(&envelope)? != expected.version {
            return Err(failed());
        }

        match self.encryption.decrypt(&envelope, tenant).await {
            Ok(roundtrip) if roundtrip == probe => Ok(()),
            Ok(_) => Err(failed()),
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "Probe decryption failed");
                Err(failed())
            }
        }
    }

    async fn rollback(&self, old_key: &TenantKey, new_key: &TenantKey) -> Result<()> {
        let tenant = &old_key.tenant_id;

        if let Err(e) = self.provider.store_key(&new_key.archived()).await {
            tracing::error!(
                tenant = %tenant,
                version = %new_key.version,
                error = %e,
                "🚨 Could not archive the rejected key during rollback"
            );
        }

        let restored = self.provider.store_key(&old_key.activated()).await;
        self.provider.invalidate_cache();

        match restored {
            Ok(()) => {
                tracing::warn!(
                    tenant = %tenant,
                    version = %old_key.version,
                    "↩️  Rotation rolled back, previous key reactivated"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    tenant = %tenant,
                    version = %old_key.version,
                    error = %e,
                    "🚨 ROLLBACK FAILED: manual key verification required"
                );
                Err(EncryptionError::RollbackFailed {
                    tenant: tenant.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn reencrypt_after_commit(&self, record: &mut RotationRecord) {
        let Some(reencryption) = self.reencryption.as_ref().filter(|r| r.has_sources()) else {
            tracing::warn!(
                tenant = %record.tenant_id,
                "Re-encryption requested but no encrypted columns are configured"
            );
            return;
        };

        match reencryption.reencrypt_tenant(&record.tenant_id).await {
            Ok(stats) => record.reencryption = Some(stats),
            // The rotation itself is committed; the pass is safe to re-run later
            Err(e) => tracing::warn!(
                tenant = %record.tenant_id,
                error = %e,
                "Re-encryption pass aborted"
            ),
        }
    }

    /// Never reuse a version, including ones archived by a rolled back run
    async fn next_version(&self, tenant: &TenantId) -> Result<KeyVersion> {
        match self.provider.list_versions(tenant).await?.into_iter().max() {
            Some(latest) => latest.next(),
            None => Ok(KeyVersion::INITIAL),
        }
    }

    /// Days until the tenant's key is due for rotation
    pub async fn rotation_status(&self, tenant: &TenantId) -> Result<RotationStatus> {
        let active = self.provider.get_active_key(tenant).await?;
        let versions = self.provider.list_versions(tenant).await?;
        let age_days = active.age_days();

        let status = RotationStatus {
            tenant_id: tenant.clone(),
            active_version: active.version,
            archived_versions: versions.iter().filter(|v| **v != active.version).count(),
            key_created_at: active.created_at,
            key_age_days: age_days,
            days_until_rotation: self.rotation_interval_days - age_days,
        };

        if status.is_overdue() {
            tracing::warn!(
                "⚠️  ENCRYPTION KEY ROTATION OVERDUE: tenant {} key {} is {} days old (recommend rotation every {} days)",
                tenant,
                active.version,
                age_days,
                self.rotation_interval_days
            );
        } else if status.days_until_rotation <= 7 {
            tracing::warn!(
                "⚠️  ENCRYPTION KEY ROTATION DUE SOON: tenant {}, {} days remaining",
                tenant,
                status.days_until_rotation
            );
        }

        Ok(status)
    }

    async fn release(&self, lease: &RotationLease) {
        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(
                tenant = %lease.tenant_id,
                error = %e,
                "Failed to release rotation lease (it will expire)"
            );
        }
    }
}

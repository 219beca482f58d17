// End-to-end key rotation scenarios against in-process stores
// Run with: cargo test --test rotation_flow

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use district_keyvault::models::{
    Envelope, KeyMaterial, KeyStatus, KeyVersion, RotationState, TenantId, TenantKey, TenantSelector,
};
use district_keyvault::services::encryption_service::Result;
use district_keyvault::services::{
    EncryptionError, EncryptionKeyRotationService, EncryptionService, InMemoryRotationLock,
    KeyProvider, KeyStore, MemoryFieldSource, MemoryKeyStore, ReencryptionService,
};

// ============================================================================
// Fault-injecting store
// ============================================================================

/// Wraps a MemoryKeyStore and misbehaves on demand
#[derive(Default)]
struct FaultyStore {
    inner: MemoryKeyStore,
    /// Serve random material for active keys at or above this version (0 = off)
    corrupt_from_version: AtomicU32,
    fail_archive_writes: AtomicBool,
    /// Refuse to (re)activate this version (0 = off)
    reject_activation_of: AtomicU32,
}

#[async_trait]
impl KeyStore for FaultyStore {
    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    async fn fetch_active(&self, tenant: &TenantId) -> Result<Option<TenantKey>> {
        let corrupt_from = self.corrupt_from_version.load(Ordering::SeqCst);
        Ok(self.inner.fetch_active(tenant).await?.map(|key| {
            if corrupt_from > 0 && key.version.get() >= corrupt_from {
                TenantKey {
                    material: KeyMaterial::generate(),
                    ..key
                }
            } else {
                key
            }
        }))
    }

    async fn fetch_archived(&self, tenant: &TenantId, version: KeyVersion) -> Result<Option<TenantKey>> {
        self.inner.fetch_archived(tenant, version).await
    }

    async fn put_key(&self, key: &TenantKey) -> Result<()> {
        let injected = match key.status {
            KeyStatus::Archived => self.fail_archive_writes.load(Ordering::SeqCst),
            KeyStatus::Active => self.reject_activation_of.load(Ordering::SeqCst) == key.version.get(),
        };
        if injected {
            return Err(EncryptionError::ProviderUnavailable("injected write failure".to_string()));
        }
        self.inner.put_key(key).await
    }

    async fn list_archived_versions(&self, tenant: &TenantId) -> Result<Vec<KeyVersion>> {
        self.inner.list_archived_versions(tenant).await
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        self.inner.list_tenants().await
    }
}

struct Harness {
    store: Arc<FaultyStore>,
    encryption: EncryptionService,
    rotation: EncryptionKeyRotationService,
}

fn harness() -> Harness {
    let store = Arc::new(FaultyStore::default());
    let encryption = EncryptionService::new(Arc::new(KeyProvider::new(store.clone())));
    let rotation = EncryptionKeyRotationService::new(
        encryption.clone(),
        Arc::new(InMemoryRotationLock::default()),
    );
    Harness {
        store,
        encryption,
        rotation,
    }
}

fn d001() -> TenantId {
    TenantId::new("D001").unwrap()
}

fn v(n: u32) -> KeyVersion {
    KeyVersion::new(n).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_backward_compatible_rotation() {
    let h = harness();
    h.rotation.provision_tenant(&d001()).await.unwrap();

    let e1 = h.encryption.encrypt("Juan Dela Cruz", &d001()).await.unwrap();
    let record = h.rotation.rotate_tenant(&d001(), false).await.unwrap();
    let e2 = h.encryption.encrypt("Maria Santos", &d001()).await.unwrap();

    assert_eq!(record.state, RotationState::Committed);
    let states: Vec<RotationState> = record.history.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            RotationState::Started,
            RotationState::Archived,
            RotationState::Generated,
            RotationState::Activated,
            RotationState::Verifying,
            RotationState::Committed,
        ]
    );

    assert_eq!(Envelope::peek_version(&e1).unwrap(), v(1));
    assert_eq!(Envelope::peek_version(&e2).unwrap(), v(2));
    assert_eq!(h.encryption.decrypt(&e1, &d001()).await.unwrap(), "Juan Dela Cruz");
    assert_eq!(h.encryption.decrypt(&e2, &d001()).await.unwrap(), "Maria Santos");
}

#[tokio::test]
async fn test_every_old_version_stays_readable() {
    let h = harness();
    h.rotation.provision_tenant(&d001()).await.unwrap();

    let mut written = Vec::new();
    for i in 0..4 {
        let plaintext = format!("record-{}", i);
        written.push((h.encryption.encrypt(&plaintext, &d001()).await.unwrap(), plaintext));
        h.rotation.rotate_tenant(&d001(), false).await.unwrap();
    }

    for (envelope, plaintext) in &written {
        assert_eq!(&h.encryption.decrypt(envelope, &d001()).await.unwrap(), plaintext);
    }
    assert_eq!(h.store.inner.archived_count(&d001()), 4);
}

#[tokio::test]
async fn test_bad_key_is_rolled_back() {
    let h = harness();
    let original = h.rotation.provision_tenant(&d001()).await.unwrap();
    let e1 = h.encryption.encrypt("Juan Dela Cruz", &d001()).await.unwrap();

    h.store.corrupt_from_version.store(2, Ordering::SeqCst);
    let record = h.rotation.rotate_tenant(&d001(), false).await.unwrap();

    assert_eq!(record.state, RotationState::RolledBack);
    assert!(record.error.is_some());
    assert_eq!(record.new_version, Some(v(2)));

    // Active key is the original one again
    let active = h.store.inner.fetch_active(&d001()).await.unwrap().unwrap();
    assert_eq!(active.version, v(1));
    assert_eq!(active.material, original.material);

    // The rejected key is archived, never silently dropped
    assert!(h.store.inner.fetch_archived(&d001(), v(2)).await.unwrap().is_some());

    assert_eq!(h.encryption.decrypt(&e1, &d001()).await.unwrap(), "Juan Dela Cruz");
    let after = h.encryption.encrypt("Maria Santos", &d001()).await.unwrap();
    assert_eq!(Envelope::peek_version(&after).unwrap(), v(1));

    // A later rotation never reuses the rejected version number
    h.store.corrupt_from_version.store(0, Ordering::SeqCst);
    let record = h.rotation.rotate_tenant(&d001(), false).await.unwrap();
    assert!(record.is_committed());
    assert_eq!(record.new_version, Some(v(3)));
}

#[tokio::test]
async fn test_rollback_keeps_earlier_archives() {
    let h = harness();
    let first = h.rotation.provision_tenant(&d001()).await.unwrap();
    let e1 = h.encryption.encrypt("Juan Dela Cruz", &d001()).await.unwrap();

    assert!(h.rotation.rotate_tenant(&d001(), false).await.unwrap().is_committed());
    let second = h.store.inner.fetch_active(&d001()).await.unwrap().unwrap();
    let e2 = h.encryption.encrypt("Maria Santos", &d001()).await.unwrap();

    h.store.corrupt_from_version.store(3, Ordering::SeqCst);
    let record = h.rotation.rotate_tenant(&d001(), false).await.unwrap();
    assert_eq!(record.state, RotationState::RolledBack);
    assert_eq!(record.old_version, Some(v(2)));
    assert_eq!(record.new_version, Some(v(3)));

    // v1 archive untouched by the rollback
    let archived = h.store.inner.fetch_archived(&d001(), v(1)).await.unwrap().unwrap();
    assert_eq!(archived.material, first.material);

    let active = h.store.inner.fetch_active(&d001()).await.unwrap().unwrap();
    assert_eq!(active.version, v(2));
    assert_eq!(active.material, second.material);
    assert_eq!(h.store.inner.list_archived_versions(&d001()).await.unwrap(), vec![v(1), v(2), v(3)]);

    h.encryption.provider().invalidate_cache();
    assert_eq!(h.encryption.decrypt(&e1, &d001()).await.unwrap(), "Juan Dela Cruz");
    assert_eq!(h.encryption.decrypt(&e2, &d001()).await.unwrap(), "Maria Santos");
}

#[tokio::test]
async fn test_archive_failure_aborts_without_change() {
    let h = harness();
    let original = h.rotation.provision_tenant(&d001()).await.unwrap();
    let e1 = h.encryption.encrypt("Juan Dela Cruz", &d001()).await.unwrap();

    h.store.fail_archive_writes.store(true, Ordering::SeqCst);
    let summary = h
        .rotation
        .rotate(&TenantSelector::Only(vec![d001()]), false)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(!summary.all_committed());
    assert_eq!(summary.records[0].state, RotationState::Aborted);

    let active = h.store.inner.fetch_active(&d001()).await.unwrap().unwrap();
    assert_eq!(active.material, original.material);
    assert_eq!(h.store.inner.archived_count(&d001()), 0);
    assert_eq!(h.encryption.decrypt(&e1, &d001()).await.unwrap(), "Juan Dela Cruz");
}

#[tokio::test]
async fn test_failed_rollback_is_reported() {
    let h = harness();
    h.rotation.provision_tenant(&d001()).await.unwrap();

    h.store.corrupt_from_version.store(2, Ordering::SeqCst);
    h.store.reject_activation_of.store(1, Ordering::SeqCst);

    let err = h.rotation.rotate_tenant(&d001(), false).await.unwrap_err();
    assert!(matches!(err, EncryptionError::RollbackFailed { .. }));

    let summary = h.rotation.rotate(&TenantSelector::All, false).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.committed, 0);
}

#[tokio::test]
async fn test_rotation_with_reencryption() {
    let h = harness();
    h.rotation.provision_tenant(&d001()).await.unwrap();
    let d002 = TenantId::new("D002").unwrap();
    h.rotation.provision_tenant(&d002).await.unwrap();

    let source = Arc::new(MemoryFieldSource::new());
    for (id, name) in [("r1", "Juan Dela Cruz"), ("r2", "Maria Santos"), ("r3", "Jose Rizal")] {
        let envelope = h.encryption.encrypt(name, &d001()).await.unwrap();
        source.insert(id, &d001(), "full_name", Some(envelope));
    }
    source.insert("r1", &d001(), "nickname", None);
    let other = h.encryption.encrypt("Andres Bonifacio", &d002).await.unwrap();
    source.insert("r4", &d002, "full_name", Some(other.clone()));

    let store = h.store.clone();
    let encryption = h.encryption.clone();
    let rotation = h
        .rotation
        .with_reencryption(ReencryptionService::new(encryption.clone(), 2).with_source(source.clone()));

    let record = rotation.rotate_tenant(&d001(), true).await.unwrap();
    assert!(record.is_committed());
    let stats = record.reencryption.unwrap();
    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.reencrypted, 3);
    assert_eq!(stats.failed, 0);

    for (id, name) in [("r1", "Juan Dela Cruz"), ("r2", "Maria Santos"), ("r3", "Jose Rizal")] {
        let envelope = source.get(id, "full_name").unwrap();
        assert_eq!(Envelope::peek_version(&envelope).unwrap(), v(2));
        assert_eq!(encryption.decrypt(&envelope, &d001()).await.unwrap(), name);
    }
    // Other tenants are untouched
    assert_eq!(source.get("r4", "full_name").unwrap(), other);
    assert_eq!(store.inner.archived_count(&d002), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_encryption_during_rotation() {
    let h = harness();
    h.rotation.provision_tenant(&d001()).await.unwrap();
    let rotation = Arc::new(h.rotation);

    let mut writers = Vec::new();
    for worker in 0..4 {
        let encryption = h.encryption.clone();
        writers.push(tokio::spawn(async move {
            let mut written = Vec::new();
            for i in 0..25 {
                let plaintext = format!("worker-{}-{}", worker, i);
                let envelope = encryption.encrypt(&plaintext, &d001()).await.unwrap();
                written.push((envelope, plaintext));
                tokio::task::yield_now().await;
            }
            written
        }));
    }

    let rotator = {
        let rotation = rotation.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                rotation.rotate_tenant(&d001(), false).await.unwrap();
            }
        })
    };

    rotator.await.unwrap();
    for writer in writers {
        for (envelope, plaintext) in writer.await.unwrap() {
            assert_eq!(h.encryption.decrypt(&envelope, &d001()).await.unwrap(), plaintext);
        }
    }

    let status = rotation.rotation_status(&d001()).await.unwrap();
    assert_eq!(status.active_version, v(4));
}

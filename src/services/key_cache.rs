//! In-process cache of resolved tenant keys
//!
//! Owned by a `KeyProvider` instance (no process-global state). Archived keys
//! are immutable and cached indefinitely; the active slot can optionally
//! expire so that a rotation performed by another process is picked up.
//!
//! Every invalidation bumps a generation counter. A lookup records the
//! generation before going to the store and only populates the cache if no
//! invalidation happened in between, so a slow read can never re-insert a key
//! that a concurrent rotation just replaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::models::tenant_key::{KeyVersion, TenantId, TenantKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSlot {
    Active,
    Version(KeyVersion),
}

#[derive(Clone)]
struct CachedKey {
    key: TenantKey,
    cached_at: Instant,
}

#[derive(Clone, Default)]
pub struct KeyCache {
    entries: Arc<DashMap<(TenantId, CacheSlot), CachedKey>>,
    generation: Arc<AtomicU64>,
    active_ttl: Option<Duration>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire cached active keys after `ttl`
    pub fn with_active_ttl(mut self, ttl: Duration) -> Self {
        self.active_ttl = Some(ttl);
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, tenant: &TenantId, slot: CacheSlot) -> Option<TenantKey> {
        let entry = self.entries.get(&(tenant.clone(), slot))?;
        if slot == CacheSlot::Active {
            if let Some(ttl) = self.active_ttl {
                if entry.cached_at.elapsed() >= ttl {
                    drop(entry);
                    self.entries.remove(&(tenant.clone(), slot));
                    return None;
                }
            }
        }
        Some(entry.key.clone())
    }

    /// Populate the slot unless the cache was invalidated since `generation`
    pub fn insert_if_current(&self, generation: u64, slot: CacheSlot, key: &TenantKey) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.entries.insert(
            (key.tenant_id.clone(), slot),
            CachedKey {
                key: key.clone(),
                cached_at: Instant::now(),
            },
        );
        // Re-check: an invalidation racing with the insert must win
        if self.generation() != generation {
            self.entries.remove(&(key.tenant_id.clone(), slot));
            return false;
        }
        true
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
        tracing::debug!("Key cache invalidated");
    }

    pub fn invalidate_tenant(&self, tenant: &TenantId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.retain(|(t, _), _| t != tenant);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tenant: &str, version: u32) -> TenantKey {
        TenantKey::generate(TenantId::new(tenant).unwrap(), KeyVersion::new(version).unwrap())
    }

    #[test]
    fn test_insert_and_get() {
        let cache = KeyCache::new();
        let k = key("D001", 1);
        assert!(cache.insert_if_current(cache.generation(), CacheSlot::Active, &k));
        assert_eq!(cache.get(&k.tenant_id, CacheSlot::Active), Some(k.clone()));
        assert!(cache.get(&k.tenant_id, CacheSlot::Version(k.version)).is_none());
    }

    #[test]
    fn test_stale_generation_is_not_cached() {
        let cache = KeyCache::new();
        let k = key("D001", 1);
        let observed = cache.generation();
        cache.invalidate();
        assert!(!cache.insert_if_current(observed, CacheSlot::Active, &k));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_tenant_keeps_others() {
        let cache = KeyCache::new();
        let a = key("D001", 1);
        let b = key("D002", 1);
        cache.insert_if_current(cache.generation(), CacheSlot::Active, &a);
        cache.insert_if_current(cache.generation(), CacheSlot::Active, &b);

        cache.invalidate_tenant(&a.tenant_id);
        assert!(cache.get(&a.tenant_id, CacheSlot::Active).is_none());
        assert!(cache.get(&b.tenant_id, CacheSlot::Active).is_some());
    }

    #[test]
    fn test_active_ttl_expires() {
        let cache = KeyCache::new().with_active_ttl(Duration::ZERO);
        let k = key("D001", 2);
        cache.insert_if_current(cache.generation(), CacheSlot::Active, &k);
        cache.insert_if_current(cache.generation(), CacheSlot::Version(k.version), &k);

        assert!(cache.get(&k.tenant_id, CacheSlot::Active).is_none());
        // Version slots never expire
        assert!(cache.get(&k.tenant_id, CacheSlot::Version(k.version)).is_some());
    }
}

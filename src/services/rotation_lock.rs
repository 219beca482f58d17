//! Per-tenant advisory lock taken before a rotation starts
//!
//! Prevents two rotation runs (possibly in different processes) from racing
//! on the same tenant. Leases expire so that a crashed run does not block the
//! tenant forever; the expiry must comfortably exceed one rotation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::tenant_key::TenantId;
use crate::services::encryption_service::{EncryptionError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationLease {
    pub tenant_id: TenantId,
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RotationLock: Send + Sync {
    /// Fails with `RotationInProgress` when another holder owns a live lease
    async fn acquire(&self, tenant: &TenantId) -> Result<RotationLease>;

    async fn release(&self, lease: &RotationLease) -> Result<()>;
}

fn lease_expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
    Utc::now() + ttl
}

/// Single-process lock
pub struct InMemoryRotationLock {
    leases: DashMap<TenantId, RotationLease>,
    ttl: Duration,
}

impl InMemoryRotationLock {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            ttl,
        }
    }
}

impl Default for InMemoryRotationLock {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl RotationLock for InMemoryRotationLock {
    async fn acquire(&self, tenant: &TenantId) -> Result<RotationLease> {
        let now = Utc::now();
        let mut entry = self.leases.entry(tenant.clone()).or_insert_with(|| RotationLease {
            tenant_id: tenant.clone(),
            holder: Uuid::nil(),
            expires_at: now,
        });

        if !entry.holder.is_nil() && entry.expires_at > now {
            return Err(EncryptionError::RotationInProgress(tenant.to_string()));
        }

        let lease = RotationLease {
            tenant_id: tenant.clone(),
            holder: Uuid::new_v4(),
            expires_at: lease_expiry(self.ttl),
        };
        *entry = lease.clone();
        Ok(lease)
    }

    async fn release(&self, lease: &RotationLease) -> Result<()> {
        self.leases
            .remove_if(&lease.tenant_id, |_, current| current.holder == lease.holder);
        Ok(())
    }
}

/// Lease table shared by every process pointed at the same database
pub struct DatabaseRotationLock {
    db_pool: PgPool,
    ttl: Duration,
}

impl DatabaseRotationLock {
    pub fn new(db_pool: PgPool, ttl: Duration) -> Self {
        Self { db_pool, ttl }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_rotation_leases (
                tenant_id TEXT PRIMARY KEY,
                holder UUID NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.db_pool)
        .await
        .map_err(lock_unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl RotationLock for DatabaseRotationLock {
    async fn acquire(&self, tenant: &TenantId) -> Result<RotationLease> {
        let holder = Uuid::new_v4();
        let expires_at = lease_expiry(self.ttl);

        // Insert, or take over only an expired lease
        let upsert = sqlx::query_scalar(
            r#"
            INSERT INTO key_rotation_leases (tenant_id, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (tenant_id) DO UPDATE
            SET holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE key_rotation_leases.expires_at < NOW()
            RETURNING holder
            "#,
        )
        .bind(tenant.as_str())
        .bind(holder)
        .bind(expires_at)
        .fetch_optional(&self.db_pool);
        let acquired: Option<Uuid> = bounded(upsert).await?;

        match acquired {
            Some(h) if h == holder => Ok(RotationLease {
                tenant_id: tenant.clone(),
                holder,
                expires_at,
            }),
            _ => Err(EncryptionError::RotationInProgress(tenant.to_string())),
        }
    }

    async fn release(&self, lease: &RotationLease) -> Result<()> {
        let delete = sqlx::query("DELETE FROM key_rotation_leases WHERE tenant_id = $1 AND holder = $2")
            .bind(lease.tenant_id.as_str())
            .bind(lease.holder)
            .execute(&self.db_pool);
        bounded(delete).await?;
        Ok(())
    }
}

/// Upper bound for one lease query, on top of the pool's statement timeout
const LEASE_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

async fn bounded<T>(query: impl Future<Output = std::result::Result<T, sqlx::Error>>) -> Result<T> {
    tokio::time::timeout(LEASE_QUERY_TIMEOUT, query)
        .await
        .map_err(|_| EncryptionError::ProviderUnavailable("rotation lease table: query timed out".to_string()))?
        .map_err(lock_unavailable)
}

fn lock_unavailable(err: sqlx::Error) -> EncryptionError {
    EncryptionError::ProviderUnavailable(format!("rotation lease table: {}", err))
}

//! Local relational copy of tenant keys
//!
//! Consulted by the KeyProvider only when the remote secret store is
//! unreachable, and then only to resolve versions for decryption. The table is
//! a best-effort mirror written after successful primary writes; it may lag
//! and never decides which key is active.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::models::tenant_key::{KeyMaterial, KeyStatus, KeyVersion, TenantId, TenantKey};
use crate::services::encryption_service::{EncryptionError, Result};
use crate::services::secret_store::KeyStore;

#[derive(Clone)]
pub struct DatabaseKeyStore {
    db_pool: PgPool,
}

impl DatabaseKeyStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Create the fallback table
    ///
    /// Run this once during setup
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS district_encryption_keys (
                tenant_id TEXT NOT NULL,
                version INTEGER NOT NULL CHECK (version > 0),
                key_material TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                archived_at TIMESTAMPTZ,
                PRIMARY KEY (tenant_id, version),
                CONSTRAINT check_key_status CHECK (status IN ('active', 'archived'))
            )
            "#,
        )
        .execute(&self.db_pool)
        .await
        .map_err(db_unavailable)?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_district_encryption_keys_active
               ON district_encryption_keys(tenant_id) WHERE status = 'active'"#,
        )
        .execute(&self.db_pool)
        .await
        .map_err(db_unavailable)?;

        tracing::info!("✅ Fallback key table initialized");
        Ok(())
    }

    fn row_to_key(row: &PgRow) -> Result<TenantKey> {
        let tenant: String = row.try_get("tenant_id").map_err(db_unavailable)?;
        let version: i32 = row.try_get("version").map_err(db_unavailable)?;
        let material: String = row.try_get("key_material").map_err(db_unavailable)?;
        let status: String = row.try_get("status").map_err(db_unavailable)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_unavailable)?;
        let archived_at: Option<DateTime<Utc>> = row.try_get("archived_at").map_err(db_unavailable)?;

        let version = u32::try_from(version)
            .ok()
            .and_then(KeyVersion::new)
            .ok_or_else(|| EncryptionError::InvalidKey(format!("fallback row has version {}", version)))?;

        Ok(TenantKey {
            tenant_id: TenantId::new(tenant)?,
            version,
            material: KeyMaterial::from_base64(&material)?,
            status: status.parse()?,
            created_at,
            archived_at,
        })
    }
}

#[async_trait]
impl KeyStore for DatabaseKeyStore {
    fn backend_name(&self) -> &'static str {
        "database"
    }

    async fn fetch_active(&self, tenant: &TenantId) -> Result<Option<TenantKey>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, version, key_material, status, created_at, archived_at
            FROM district_encryption_keys
            WHERE tenant_id = $1 AND status = 'active'
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(tenant.as_str())
        .fetch_optional(&self.db_pool)
        .await
        .map_err(db_unavailable)?;

        row.as_ref().map(Self::row_to_key).transpose()
    }

    async fn fetch_archived(&self, tenant: &TenantId, version: KeyVersion) -> Result<Option<TenantKey>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, version, key_material, status, created_at, archived_at
            FROM district_encryption_keys
            WHERE tenant_id = $1 AND version = $2 AND status = 'archived'
            "#,
        )
        .bind(tenant.as_str())
        .bind(version_param(version)?)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(db_unavailable)?;

        row.as_ref().map(Self::row_to_key).transpose()
    }

    async fn put_key(&self, key: &TenantKey) -> Result<()> {
        let mut tx = self.db_pool.begin().await.map_err(db_unavailable)?;

        if key.status == KeyStatus::Active {
            // Keep at most one active row per tenant
            sqlx::query(
                r#"
                UPDATE district_encryption_keys
                SET status = 'archived', archived_at = COALESCE(archived_at, NOW())
                WHERE tenant_id = $1 AND status = 'active' AND version <> $2
                "#,
            )
            .bind(key.tenant_id.as_str())
            .bind(version_param(key.version)?)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;
        }

        sqlx::query(
            r#"
            INSERT INTO district_encryption_keys
                (tenant_id, version, key_material, status, created_at, archived_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, version) DO UPDATE
            SET key_material = EXCLUDED.key_material,
                status = EXCLUDED.status,
                archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(key.tenant_id.as_str())
        .bind(version_param(key.version)?)
        .bind(key.material.to_base64())
        .bind(key.status.as_str())
        .bind(key.created_at)
        .bind(key.archived_at)
        .execute(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        tx.commit().await.map_err(db_unavailable)?;
        Ok(())
    }

    async fn list_archived_versions(&self, tenant: &TenantId) -> Result<Vec<KeyVersion>> {
        let versions: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT version FROM district_encryption_keys
            WHERE tenant_id = $1 AND status = 'archived'
            ORDER BY version
            "#,
        )
        .bind(tenant.as_str())
        .fetch_all(&self.db_pool)
        .await
        .map_err(db_unavailable)?;

        Ok(versions
            .into_iter()
            .filter_map(|v| u32::try_from(v).ok())
            .filter_map(KeyVersion::new)
            .collect())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        let tenants: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT tenant_id FROM district_encryption_keys
            WHERE status = 'active'
            ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.db_pool)
        .await
        .map_err(db_unavailable)?;

        tenants.into_iter().map(TenantId::new).collect()
    }
}

fn version_param(version: KeyVersion) -> Result<i32> {
    i32::try_from(version.get())
        .map_err(|_| EncryptionError::InvalidKey(format!("key {} exceeds the database range", version)))
}

fn db_unavailable(err: sqlx::Error) -> EncryptionError {
    // 🔒 SECURITY: sqlx errors never contain bound key material, only statement context
    EncryptionError::ProviderUnavailable(format!("fallback database: {}", err))
}

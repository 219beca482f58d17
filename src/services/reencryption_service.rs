// ============================================================================
// Re-encryption Service - Opportunistic migration to the active key
// ============================================================================
//
// Rotation never rewrites stored data. This service is the optional, separate
// pass that walks encrypted columns and moves every envelope sealed with an
// older key version onto the tenant's active key:
//
//   decrypt(old key) -> encrypt(active key) -> compare-and-swap write
//
// Properties:
// - One field at a time; a crash leaves a mix of old and new envelopes, both
//   decryptable
// - Idempotent: fields already on the active version are skipped, so a re-run
//   only finishes what is left
// - A concurrent writer wins: the write only lands if the column still holds
//   the envelope that was read
// - Per-field failures are counted and logged (without plaintext), not fatal
//
// ============================================================================

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::config::ReencryptTarget;
use crate::models::envelope::{is_envelope, Envelope};
use crate::models::rotation::ReencryptionStats;
use crate::models::tenant_key::{TenantId, TenantKey};
use crate::services::encryption_service::{EncryptionError, EncryptionService, Result};

/// One encrypted column value of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    pub column: String,
    pub envelope: Option<String>,
}

/// A record holding one or more encrypted columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRow {
    pub record_id: String,
    pub fields: Vec<FieldValue>,
}

#[async_trait]
pub trait EncryptedFieldSource: Send + Sync {
    fn name(&self) -> String;

    /// Up to `limit` records of `tenant` with id greater than `after`, ordered by id
    async fn fetch_batch(
        &self,
        tenant: &TenantId,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EncryptedRow>>;

    /// Replace `current` with `replacement`; false if the value changed meanwhile
    async fn replace(
        &self,
        record_id: &str,
        column: &str,
        current: &str,
        replacement: &str,
    ) -> Result<bool>;
}

#[derive(Clone)]
pub struct ReencryptionService {
    encryption: EncryptionService,
    sources: Vec<Arc<dyn EncryptedFieldSource>>,
    batch_size: usize,
}

impl ReencryptionService {
    pub fn new(encryption: EncryptionService, batch_size: usize) -> Self {
        Self {
            encryption,
            sources: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn EncryptedFieldSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Move every field of `tenant` onto the active key
    pub async fn reencrypt_tenant(&self, tenant: &TenantId) -> Result<ReencryptionStats> {
        let active = self.encryption.provider().get_active_key(tenant).await?;
        let mut stats = ReencryptionStats::default();

        for source in &self.sources {
            let source_stats = self.reencrypt_source(source.as_ref(), tenant, &active).await?;
            tracing::info!(
                tenant = %tenant,
                source = %source.name(),
                scanned = source_stats.scanned,
                reencrypted = source_stats.reencrypted,
                skipped = source_stats.skipped,
                failed = source_stats.failed,
                "Re-encryption pass finished"
            );
            stats.merge(&source_stats);
        }

        Ok(stats)
    }

    async fn reencrypt_source(
        &self,
        source: &dyn EncryptedFieldSource,
        tenant: &TenantId,
        active: &TenantKey,
    ) -> Result<ReencryptionStats> {
        let mut stats = ReencryptionStats::default();
        let mut cursor: Option<String> = None;

        loop {
            let batch = source
                .fetch_batch(tenant, cursor.as_deref(), self.batch_size)
                .await?;
            let batch_len = batch.len();

            for row in &batch {
                for field in &row.fields {
                    let Some(envelope) = field.envelope.as_deref() else {
                        continue;
                    };
                    stats.scanned += 1;
                    match self
                        .reencrypt_field(source, tenant, active, &row.record_id, &field.column, envelope)
                        .await
                    {
                        Ok(true) => stats.reencrypted += 1,
                        Ok(false) => stats.skipped += 1,
                        Err(e) => {
                            stats.failed += 1;
                            tracing::warn!(
                                tenant = %tenant,
                                source = %source.name(),
                                record = %row.record_id,
                                column = %field.column,
                                error = %e,
                                "Field re-encryption failed"
                            );
                        }
                    }
                }
            }

            match batch.last() {
                Some(last) if batch_len >= self.batch_size => cursor = Some(last.record_id.clone()),
                _ => break,
            }
        }

        Ok(stats)
    }

    /// Returns true when the field was rewritten
    async fn reencrypt_field(
        &self,
        source: &dyn EncryptedFieldSource,
        tenant: &TenantId,
        active: &TenantKey,
        record_id: &str,
        column: &str,
        envelope: &str,
    ) -> Result<bool> {
        if !is_envelope(envelope) {
            // Not written by this engine
            return Ok(false);
        }
        if Envelope::peek_version(envelope)? == active.version {
            return Ok(false);
        }

        let plaintext = self.encryption.decrypt(envelope, tenant).await?;
        let replacement = EncryptionService::seal_with(active, plaintext.as_bytes())?.encode();

        source.replace(record_id, column, envelope, &replacement).await
    }
}

/// Encrypted columns of one Postgres table
pub struct SqlFieldSource {
    db_pool: PgPool,
    target: ReencryptTarget,
}

impl SqlFieldSource {
    /// `target` identifiers are validated when the config is parsed
    pub fn new(db_pool: PgPool, target: ReencryptTarget) -> Self {
        Self { db_pool, target }
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT {id}::text AS record_id, {cols} FROM {table} \
             WHERE {tenant} = $1 AND ($2::text IS NULL OR {id}::text > $2) \
             ORDER BY {id}::text LIMIT $3",
            id = self.target.id_column,
            cols = self.target.columns.join(", "),
            table = self.target.table,
            tenant = self.target.tenant_column,
        )
    }

    fn update_sql(&self, column: &str) -> String {
        format!(
            "UPDATE {table} SET {col} = $1 WHERE {id}::text = $2 AND {col} = $3",
            table = self.target.table,
            col = column,
            id = self.target.id_column,
        )
    }
}

#[async_trait]
impl EncryptedFieldSource for SqlFieldSource {
    fn name(&self) -> String {
        self.target.table.clone()
    }

    async fn fetch_batch(
        &self,
        tenant: &TenantId,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EncryptedRow>> {
        let rows = sqlx::query(&self.select_sql())
            .bind(tenant.as_str())
            .bind(after)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.db_pool)
            .await
            .map_err(db_unavailable)?;

        rows.iter()
            .map(|row| -> Result<EncryptedRow> {
                let record_id: String = row.try_get("record_id").map_err(db_unavailable)?;
                let fields = self
                    .target
                    .columns
                    .iter()
                    .map(|column| -> Result<FieldValue> {
                        Ok(FieldValue {
                            column: column.clone(),
                            envelope: row.try_get(column.as_str()).map_err(db_unavailable)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(EncryptedRow { record_id, fields })
            })
            .collect()
    }

    async fn replace(
        &self,
        record_id: &str,
        column: &str,
        current: &str,
        replacement: &str,
    ) -> Result<bool> {
        if !self.target.columns.iter().any(|c| c == column) {
            return Err(EncryptionError::EncryptionFailed(format!(
                "column {} is not configured for {}",
                column, self.target.table
            )));
        }

        let result = sqlx::query(&self.update_sql(column))
            .bind(replacement)
            .bind(record_id)
            .bind(current)
            .execute(&self.db_pool)
            .await
            .map_err(db_unavailable)?;

        Ok(result.rows_affected() == 1)
    }
}

fn db_unavailable(err: sqlx::Error) -> EncryptionError {
    EncryptionError::ProviderUnavailable(format!("re-encryption source: {}", err))
}

/// In-memory field source for tests and dry runs
#[derive(Default)]
pub struct MemoryFieldSource {
    rows: Mutex<BTreeMap<String, (TenantId, BTreeMap<String, Option<String>>)>>,
}

impl MemoryFieldSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record_id: &str, tenant: &TenantId, column: &str, envelope: Option<String>) {
        let mut rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        rows.entry(record_id.to_string())
            .or_insert_with(|| (tenant.clone(), BTreeMap::new()))
            .1
            .insert(column.to_string(), envelope);
    }

    pub fn get(&self, record_id: &str, column: &str) -> Option<String> {
        let rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        rows.get(record_id)
            .and_then(|(_, cols)| cols.get(column).cloned())
            .flatten()
    }
}

#[async_trait]
impl EncryptedFieldSource for MemoryFieldSource {
    fn name(&self) -> String {
        "memory".to_string()
    }

    async fn fetch_batch(
        &self,
        tenant: &TenantId,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EncryptedRow>> {
        let rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        Ok(rows
            .iter()
            .filter(|(id, (t, _))| t == tenant && after.map_or(true, |a| id.as_str() > a))
            .take(limit)
            .map(|(id, (_, cols))| EncryptedRow {
                record_id: id.clone(),
                fields: cols
                    .iter()
                    .map(|(column, envelope)| FieldValue {
                        column: column.clone(),
                        envelope: envelope.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn replace(
        &self,
        record_id: &str,
        column: &str,
        current: &str,
        replacement: &str,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        let Some(slot) = rows.get_mut(record_id).and_then(|(_, cols)| cols.get_mut(column)) else {
            return Ok(false);
        };
        if slot.as_deref() != Some(current) {
            return Ok(false);
        }
        *slot = Some(replacement.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tenant_key::KeyVersion;
    use crate::services::key_provider::KeyProvider;
    use crate::services::secret_store::MemoryKeyStore;

    struct Fixture {
        store: Arc<MemoryKeyStore>,
        encryption: EncryptionService,
        tenant: TenantId,
        v1: TenantKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryKeyStore::new());
        let tenant = TenantId::new("D001").unwrap();
        let v1 = TenantKey::generate(tenant.clone(), KeyVersion::INITIAL);
        store.seed(v1.clone());
        let encryption = EncryptionService::new(Arc::new(KeyProvider::new(store.clone())));
        Fixture { store, encryption, tenant, v1 }
    }

    async fn switch_to_v2(f: &Fixture) -> TenantKey {
        let v2 = TenantKey::generate(f.tenant.clone(), KeyVersion::new(2).unwrap());
        f.store.seed(f.v1.archived());
        f.store.seed(v2.clone());
        f.encryption.provider().invalidate_cache();
        v2
    }

    #[tokio::test]
    async fn test_reencrypts_old_versions_only() {
        let f = fixture();
        let source = Arc::new(MemoryFieldSource::new());

        for i in 0..5 {
            let env = f.encryption.encrypt(&format!("Officer {}", i), &f.tenant).await.unwrap();
            source.insert(&format!("r{}", i), &f.tenant, "full_name", Some(env));
        }
        source.insert("r5", &f.tenant, "full_name", None);

        let v2 = switch_to_v2(&f).await;
        let fresh = f.encryption.encrypt("Officer 6", &f.tenant).await.unwrap();
        source.insert("r6", &f.tenant, "full_name", Some(fresh));

        let service = ReencryptionService::new(f.encryption.clone(), 2).with_source(source.clone());
        let stats = service.reencrypt_tenant(&f.tenant).await.unwrap();

        assert_eq!(stats.scanned, 6);
        assert_eq!(stats.reencrypted, 5);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);

        for i in 0..5 {
            let env = source.get(&format!("r{}", i), "full_name").unwrap();
            assert_eq!(Envelope::peek_version(&env).unwrap(), v2.version);
            assert_eq!(f.encryption.decrypt(&env, &f.tenant).await.unwrap(), format!("Officer {}", i));
        }

        // Idempotent re-run
        let again = service.reencrypt_tenant(&f.tenant).await.unwrap();
        assert_eq!(again.reencrypted, 0);
        assert_eq!(again.skipped, 6);
    }

    #[tokio::test]
    async fn test_other_tenants_untouched() {
        let f = fixture();
        let other = TenantId::new("D002").unwrap();
        let source = Arc::new(MemoryFieldSource::new());

        let env = f.encryption.encrypt("Juan Dela Cruz", &f.tenant).await.unwrap();
        source.insert("a", &f.tenant, "full_name", Some(env));
        source.insert("b", &other, "full_name", Some("ENC1:1:foreign".to_string()));

        switch_to_v2(&f).await;
        let service = ReencryptionService::new(f.encryption.clone(), 10).with_source(source.clone());
        let stats = service.reencrypt_tenant(&f.tenant).await.unwrap();

        assert_eq!(stats.scanned, 1);
        assert_eq!(source.get("b", "full_name").as_deref(), Some("ENC1:1:foreign"));
    }

    #[tokio::test]
    async fn test_corrupt_field_is_counted_not_fatal() {
        let f = fixture();
        let source = Arc::new(MemoryFieldSource::new());
        source.insert("a", &f.tenant, "registry_number", Some("ENC1:1:AAAA".to_string()));
        let good = f.encryption.encrypt("REG-1", &f.tenant).await.unwrap();
        source.insert("b", &f.tenant, "registry_number", Some(good));

        switch_to_v2(&f).await;
        let service = ReencryptionService::new(f.encryption.clone(), 10).with_source(source);
        let stats = service.reencrypt_tenant(&f.tenant).await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.reencrypted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writer_wins() {
        let source = MemoryFieldSource::new();
        let tenant = TenantId::new("D001").unwrap();
        source.insert("a", &tenant, "birthday", Some("ENC1:1:old".to_string()));
        source.insert("a", &tenant, "birthday", Some("ENC1:2:newer".to_string()));

        assert!(!source.replace("a", "birthday", "ENC1:1:old", "ENC1:2:ours").await.unwrap());
        assert_eq!(source.get("a", "birthday").as_deref(), Some("ENC1:2:newer"));
    }

    #[tokio::test]
    async fn test_sql_statements_use_configured_identifiers() {
        let target = ReencryptTarget {
            table: "officers".to_string(),
            id_column: "id".to_string(),
            tenant_column: "district_id".to_string(),
            columns: vec!["full_name".to_string(), "birthday".to_string()],
        };
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/registry").unwrap();
        let source = SqlFieldSource::new(pool, target);

        let select = source.select_sql();
        assert!(select.contains("SELECT id::text AS record_id, full_name, birthday FROM officers"));
        assert!(select.contains("WHERE district_id = $1"));
        assert_eq!(
            source.update_sql("birthday"),
            "UPDATE officers SET birthday = $1 WHERE id::text = $2 AND birthday = $3"
        );
    }
}

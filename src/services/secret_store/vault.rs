// ============================================================================
// Secret Store Client - Remote key storage over an authenticated HTTP API
// ============================================================================
//
// Keys are organized by hierarchical path under a configurable root:
//
//   {root}/{tenant}                   -> active key of the tenant
//   {root}/archive/{tenant}_v{n}      -> archived key version n
//
// API contract:
//   GET  {base}/v1/secrets{path}            -> 200 {"value": "..."} | 404
//   PUT  {base}/v1/secrets{path}            <- {"value": "..."}
//   GET  {base}/v1/secrets{path}?list=true  -> 200 {"keys": ["..."]} | 404
//
// Every request carries a bearer token and is bounded by the client timeout;
// timeouts, connection failures, auth rejections and 5xx responses all
// surface as ProviderUnavailable so callers can retry instead of hanging.
//
// ============================================================================

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::tenant_key::{KeyStatus, KeyVersion, StoredKeyRecord, TenantId, TenantKey};
use crate::services::encryption_service::{EncryptionError, Result};
use crate::services::secret_store::KeyStore;
use crate::utils::log_sanitizer::{redact_sensitive, sanitize_for_log};

#[derive(Clone)]
pub struct VaultConfig {
    pub base_url: String,
    pub token: String,
    pub root_path: String,
    pub timeout: Duration,
}

impl VaultConfig {
    pub fn validate(&self) -> Result<Url> {
        if self.token.is_empty() {
            return Err(EncryptionError::ProviderUnavailable(
                "secret store token is not configured".to_string(),
            ));
        }
        if !self.root_path.starts_with('/') {
            return Err(EncryptionError::ProviderUnavailable(
                "secret store root path must start with '/'".to_string(),
            ));
        }
        Url::parse(&self.base_url).map_err(|e| {
            EncryptionError::ProviderUnavailable(format!("invalid secret store URL: {}", e))
        })
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("base_url", &self.base_url)
            .field("token", &redact_sensitive(&self.token))
            .field("root_path", &self.root_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct SecretValue {
    value: String,
}

#[derive(Deserialize)]
struct SecretList {
    #[serde(default)]
    keys: Vec<String>,
}

pub struct VaultKeyStore {
    http_client: Client,
    base_url: Url,
    token: String,
    root_path: String,
}

impl VaultKeyStore {
    pub fn new(config: VaultConfig) -> Result<Self> {
        let base_url = config.validate()?;

        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| EncryptionError::ProviderUnavailable(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            token: config.token,
            root_path: config.root_path.trim_end_matches('/').to_string(),
        })
    }

    fn active_path(&self, tenant: &TenantId) -> String {
        format!("{}/{}", self.root_path, tenant)
    }

    fn archive_dir(&self) -> String {
        format!("{}/archive", self.root_path)
    }

    fn archive_path(&self, tenant: &TenantId, version: KeyVersion) -> String {
        format!("{}/{}_{}", self.archive_dir(), tenant, version)
    }

    fn secret_url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/v1/secrets{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|e| EncryptionError::ProviderUnavailable(format!("invalid secret URL: {}", e)))
    }

    async fn get_secret(&self, path: &str) -> Result<Option<String>> {
        let response = self
            .http_client
            .get(self.secret_url(path)?)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let secret: SecretValue = response.json().await.map_err(unavailable)?;
                Ok(Some(secret.value))
            }
            status => Err(status_error(status)),
        }
    }

    async fn put_secret(&self, path: &str, value: String) -> Result<()> {
        let response = self
            .http_client
            .put(self.secret_url(path)?)
            .bearer_auth(&self.token)
            .json(&SecretValue { value })
            .send()
            .await
            .map_err(unavailable)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status()))
        }
    }

    async fn list_secrets(&self, path: &str) -> Result<Vec<String>> {
        let mut url = self.secret_url(path)?;
        url.query_pairs_mut().append_pair("list", "true");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let list: SecretList = response.json().await.map_err(unavailable)?;
                Ok(list.keys)
            }
            status => Err(status_error(status)),
        }
    }

    fn decode_key(tenant: &TenantId, raw: &str, slot: KeyStatus) -> Result<TenantKey> {
        let record: StoredKeyRecord = serde_json::from_str(raw).map_err(|_| {
            EncryptionError::InvalidKey(format!("secret for tenant {} is not a key record", tenant))
        })?;
        let mut key = record.into_tenant_key()?;
        if &key.tenant_id != tenant {
            return Err(EncryptionError::InvalidKey(format!(
                "secret stored under tenant {} belongs to another tenant",
                tenant
            )));
        }
        // The path decides the status, not the payload
        key.status = slot;
        Ok(key)
    }
}

#[async_trait]
impl KeyStore for VaultKeyStore {
    fn backend_name(&self) -> &'static str {
        "secret-store"
    }

    async fn fetch_active(&self, tenant: &TenantId) -> Result<Option<TenantKey>> {
        match self.get_secret(&self.active_path(tenant)).await? {
            Some(raw) => Ok(Some(Self::decode_key(tenant, &raw, KeyStatus::Active)?)),
            None => Ok(None),
        }
    }

    async fn fetch_archived(&self, tenant: &TenantId, version: KeyVersion) -> Result<Option<TenantKey>> {
        match self.get_secret(&self.archive_path(tenant, version)).await? {
            Some(raw) => {
                let key = Self::decode_key(tenant, &raw, KeyStatus::Archived)?;
                if key.version != version {
                    return Err(EncryptionError::InvalidKey(format!(
                        "archived secret {} of tenant {} carries {}",
                        version, tenant, key.version
                    )));
                }
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    async fn put_key(&self, key: &TenantKey) -> Result<()> {
        let path = match key.status {
            KeyStatus::Active => self.active_path(&key.tenant_id),
            KeyStatus::Archived => self.archive_path(&key.tenant_id, key.version),
        };
        let value = serde_json::to_string(&key.to_record())
            .map_err(|e| EncryptionError::EncryptionFailed(format!("key record serialization: {}", e)))?;

        self.put_secret(&path, value).await?;

        tracing::debug!(
            tenant = %key.tenant_id,
            version = %key.version,
            status = key.status.as_str(),
            "Key written to secret store"
        );
        Ok(())
    }

    async fn list_archived_versions(&self, tenant: &TenantId) -> Result<Vec<KeyVersion>> {
        let prefix = format!("{}_v", tenant);
        let mut versions: Vec<KeyVersion> = self
            .list_secrets(&self.archive_dir())
            .await?
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(|rest| rest.parse::<u32>().ok())
            .filter_map(KeyVersion::new)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        let mut tenants = Vec::new();
        for name in self.list_secrets(&self.root_path).await? {
            // Sub-folders (e.g. "archive/") are listed with a trailing slash
            if name.ends_with('/') {
                continue;
            }
            match TenantId::new(name.clone()) {
                Ok(id) => tenants.push(id),
                Err(_) => tracing::warn!(
                    "Skipping secret with invalid tenant name: {}",
                    sanitize_for_log(&name)
                ),
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

fn unavailable(err: reqwest::Error) -> EncryptionError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else if err.is_decode() {
        "invalid response body"
    } else {
        "request failed"
    };
    EncryptionError::ProviderUnavailable(format!("secret store {}: {}", kind, err.without_url()))
}

fn status_error(status: StatusCode) -> EncryptionError {
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "rejected credentials",
        StatusCode::TOO_MANY_REQUESTS => "rate limited the request",
        s if s.is_server_error() => "returned a server error",
        _ => "returned an unexpected status",
    };
    EncryptionError::ProviderUnavailable(format!("secret store {} ({})", reason, status.as_u16()))
}

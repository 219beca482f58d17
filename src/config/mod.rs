pub mod database;

use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::services::secret_store::VaultConfig;

/// SQL identifiers are interpolated into statements, so only plain names pass
static SQL_IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid")
});

/// One table whose columns hold envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReencryptTarget {
    pub table: String,
    pub id_column: String,
    pub tenant_column: String,
    pub columns: Vec<String>,
}

impl ReencryptTarget {
    /// Parse `table:id_col:tenant_col:col1,col2`
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        let [table, id_column, tenant_column, columns] = parts.as_slice() else {
            bail!("re-encryption target must look like table:id_col:tenant_col:col1,col2");
        };

        let columns: Vec<String> = columns
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            bail!("re-encryption target {} lists no columns", table);
        }

        for ident in [*table, *id_column, *tenant_column]
            .into_iter()
            .chain(columns.iter().map(String::as_str))
        {
            if !SQL_IDENTIFIER_REGEX.is_match(ident) {
                bail!("invalid SQL identifier in re-encryption target: {:?}", ident);
            }
        }

        Ok(Self {
            table: table.to_string(),
            id_column: id_column.to_string(),
            tenant_column: tenant_column.to_string(),
            columns,
        })
    }
}

/// Parse `;`-separated targets; empty input means none
pub fn parse_targets(raw: &str) -> Result<Vec<ReencryptTarget>> {
    raw.split(';')
        .filter(|t| !t.trim().is_empty())
        .map(ReencryptTarget::parse)
        .collect()
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub secret_store: VaultConfig,
    pub database_url: Option<String>,
    pub rotation_interval_days: i64,
    pub rotation_lease: Duration,
    pub key_cache_ttl: Option<Duration>,
    pub reencrypt_targets: Vec<ReencryptTarget>,
    pub reencrypt_batch_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let secret_store = VaultConfig {
            base_url: env::var("SECRET_STORE_URL").context("SECRET_STORE_URL must be set")?,
            token: env::var("SECRET_STORE_TOKEN").context("SECRET_STORE_TOKEN must be set")?,
            root_path: env::var("SECRET_STORE_ROOT").unwrap_or_else(|_| "/encryption-keys".to_string()),
            timeout: Duration::from_secs(parse_var("SECRET_STORE_TIMEOUT_SECS", 10)?),
        };

        let key_cache_ttl = match env::var("KEY_CACHE_TTL_SECS") {
            Ok(raw) => Some(Duration::from_secs(
                raw.parse().map_err(|_| anyhow!("KEY_CACHE_TTL_SECS must be a number"))?,
            )),
            Err(_) => None,
        };

        Ok(Self {
            secret_store,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            rotation_interval_days: parse_var("KEY_ROTATION_INTERVAL_DAYS", 90)?,
            rotation_lease: Duration::from_secs(parse_var("ROTATION_LEASE_SECS", 300)?),
            key_cache_ttl,
            reencrypt_targets: parse_targets(&env::var("REENCRYPT_TARGETS").unwrap_or_default())?,
            reencrypt_batch_size: parse_var("REENCRYPT_BATCH_SIZE", 200)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} has an invalid value", name)),
        Err(_) => Ok(default),
    }
}

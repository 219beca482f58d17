//! `district-keys`: operational CLI for per-district encryption keys
//!
//! Configuration comes from the environment (see `AppConfig::from_env`).
//! Results are printed to stdout as JSON; logs go to stderr.
//!
//! Usage:
//!   district-keys rotate --tenant D001 [--reencrypt]
//!   district-keys rotate --all
//!   district-keys provision --tenant D001
//!   district-keys status [--tenant D001]
//!   district-keys reencrypt [--tenant D001]
//!   district-keys generate-key

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use district_keyvault::config::{database::create_pool, AppConfig};
use district_keyvault::models::{TenantId, TenantSelector};
use district_keyvault::services::{
    DatabaseKeyStore, DatabaseRotationLock, EncryptionKeyRotationService, EncryptionService,
    InMemoryRotationLock, KeyCache, KeyProvider, ReencryptionService, RotationLock,
    SqlFieldSource, VaultKeyStore,
};

/// Exit status when any selected tenant rolled back or failed
const EXIT_ROTATION_INCOMPLETE: u8 = 2;

#[derive(Parser)]
#[command(name = "district-keys", version, about = "Per-district encryption key management")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rotate the active key of the selected tenants
    Rotate {
        #[arg(long = "tenant", value_name = "TENANT")]
        tenants: Vec<String>,
        /// Rotate every tenant known to the secret store
        #[arg(long, conflicts_with = "tenants")]
        all: bool,
        /// Re-encrypt configured columns after a committed rotation
        #[arg(long)]
        reencrypt: bool,
    },
    /// Create the first key of a tenant
    Provision {
        #[arg(long)]
        tenant: String,
    },
    /// Report key version, age and rotation due date
    Status {
        #[arg(long = "tenant", value_name = "TENANT")]
        tenants: Vec<String>,
    },
    /// Move stored envelopes onto the active key without rotating
    Reencrypt {
        #[arg(long = "tenant", value_name = "TENANT")]
        tenants: Vec<String>,
    },
    /// Print a fresh random base64 key
    GenerateKey,
}

struct Services {
    encryption: EncryptionService,
    rotation: EncryptionKeyRotationService,
    reencryption: Option<ReencryptionService>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();

    if let Command::GenerateKey = cli.command {
        println!("{}", EncryptionService::generate_key());
        return Ok(ExitCode::SUCCESS);
    }

    let config = AppConfig::from_env()?;
    let services = build_services(&config).await?;

    match cli.command {
        Command::Rotate { tenants, all, reencrypt } => {
            let selector = if all {
                TenantSelector::All
            } else if tenants.is_empty() {
                bail!("pass --tenant at least once, or --all");
            } else {
                TenantSelector::Only(parse_tenants(&tenants)?)
            };

            let summary = services.rotation.rotate(&selector, reencrypt).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if summary.all_committed() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_ROTATION_INCOMPLETE))
            }
        }
        Command::Provision { tenant } => {
            let tenant = TenantId::new(tenant)?;
            let key = services.rotation.provision_tenant(&tenant).await?;
            println!(
                "{}",
                serde_json::json!({
                    "tenant_id": key.tenant_id,
                    "version": key.version,
                    "fingerprint": key.material.fingerprint(),
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { tenants } => {
            let mut report = Vec::new();
            for tenant in resolve_tenants(&services, &tenants).await? {
                report.push(services.rotation.rotation_status(&tenant).await?);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Reencrypt { tenants } => {
            let Some(reencryption) = &services.reencryption else {
                bail!("no re-encryption targets configured (DATABASE_URL and REENCRYPT_TARGETS)");
            };

            let mut report = serde_json::Map::new();
            for tenant in resolve_tenants(&services, &tenants).await? {
                let stats = reencryption.reencrypt_tenant(&tenant).await?;
                report.insert(tenant.to_string(), serde_json::to_value(stats)?);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::GenerateKey => Ok(ExitCode::SUCCESS),
    }
}

fn init_logging() {
    // 🔒 Default to INFO; override with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "district_keyvault=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn build_services(config: &AppConfig) -> Result<Services> {
    let primary = Arc::new(
        VaultKeyStore::new(config.secret_store.clone()).context("secret store configuration")?,
    );

    let mut cache = KeyCache::new();
    if let Some(ttl) = config.key_cache_ttl {
        cache = cache.with_active_ttl(ttl);
    }
    let mut provider = KeyProvider::new(primary).with_cache(cache);

    let db_pool = match &config.database_url {
        Some(url) => Some(create_pool(url).await.context("connecting to DATABASE_URL")?),
        None => {
            tracing::info!("DATABASE_URL not set: no fallback key table, in-process rotation lock");
            None
        }
    };

    let lock: Arc<dyn RotationLock> = match &db_pool {
        Some(pool) => {
            let fallback = DatabaseKeyStore::new(pool.clone());
            fallback.initialize().await?;
            provider = provider.with_fallback(Arc::new(fallback));

            let lock = DatabaseRotationLock::new(pool.clone(), config.rotation_lease);
            lock.initialize().await?;
            Arc::new(lock)
        }
        None => Arc::new(InMemoryRotationLock::new(config.rotation_lease)),
    };

    let encryption = EncryptionService::new(Arc::new(provider));

    let reencryption = match &db_pool {
        Some(pool) if !config.reencrypt_targets.is_empty() => {
            let mut service = ReencryptionService::new(encryption.clone(), config.reencrypt_batch_size);
            for target in &config.reencrypt_targets {
                service = service.with_source(Arc::new(SqlFieldSource::new(pool.clone(), target.clone())));
            }
            Some(service)
        }
        _ => None,
    };

    let mut rotation = EncryptionKeyRotationService::new(encryption.clone(), lock)
        .with_rotation_interval(config.rotation_interval_days);
    if let Some(service) = &reencryption {
        rotation = rotation.with_reencryption(service.clone());
    }

    Ok(Services {
        encryption,
        rotation,
        reencryption,
    })
}

fn parse_tenants(raw: &[String]) -> Result<Vec<TenantId>> {
    raw.iter()
        .map(|t| TenantId::new(t.as_str()).map_err(Into::into))
        .collect()
}

async fn resolve_tenants(services: &Services, raw: &[String]) -> Result<Vec<TenantId>> {
    if !raw.is_empty() {
        return parse_tenants(raw);
    }
    Ok(services.encryption.provider().list_tenants().await?)
}

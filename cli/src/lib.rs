//! Configuration and wiring for the `keyshift` binary.

use anyhow::{bail, Context, Result};
use keyshift_crypto::{Keyring, KeyringConfig};
use keyshift_db::Database;
use keyshift_migrate::{EncryptionMigrator, MigratorConfig};
use keyshift_store::external_services::external_services_table;
use keyshift_store::webhooks::webhooks_table;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const WEBHOOKS_MIGRATION: &str = "webhooks.encryption";
pub const EXTERNAL_SERVICES_MIGRATION: &str = "external_services.encryption";

/// Contents of `keyshift.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,
    #[serde(default)]
    pub migrator: MigratorConfig,
    #[serde(default)]
    pub keyring: KeyringConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.migrator.validate()?;
        Ok(config)
    }
}

/// Builds every registered migration, each with the key set for its purpose.
pub fn build_migrations(
    db: &Database,
    keyring: &Keyring,
    config: &MigratorConfig,
) -> Result<Vec<EncryptionMigrator>> {
    Ok(vec![
        EncryptionMigrator::new(
            WEBHOOKS_MIGRATION,
            db.clone(),
            webhooks_table()?,
            keyring.webhook.clone(),
            config.clone(),
        )?,
        EncryptionMigrator::new(
            EXTERNAL_SERVICES_MIGRATION,
            db.clone(),
            external_services_table()?,
            keyring.external_service.clone(),
            config.clone(),
        )?,
    ])
}

/// Narrows `migrations` to the one named `id`, or keeps all of them.
pub fn select<'a>(
    migrations: &'a [EncryptionMigrator],
    id: Option<&str>,
) -> Result<Vec<&'a EncryptionMigrator>> {
    let Some(id) = id else {
        return Ok(migrations.iter().collect());
    };
    let selected: Vec<_> = migrations
        .iter()
        .filter(|migration| migration.id() == id)
        .collect();
    if selected.is_empty() {
        let known: Vec<&str> = migrations.iter().map(EncryptionMigrator::id).collect();
        bail!("unknown migration {id:?}; known migrations: {}", known.join(", "));
    }
    Ok(selected)
}

/// One line of `keyshift status` output.
pub fn format_status(id: &str, migrated: u64, total: u64, progress: f64) -> String {
    format!("{id:<32} {:>6.1}%  ({migrated}/{total} rows)", progress * 100.0)
}

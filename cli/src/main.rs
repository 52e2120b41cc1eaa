//! keyshift: encrypts sensitive columns at rest, a batch at a time.
//!
//! Usage:
//!   keyshift --config keyshift.toml status
//!   keyshift up --migration webhooks.encryption
//!   keyshift down --allow-decrypt
//!
//! `up` and `down` keep running batches until the migration is complete,
//! stalls, or fails. `--once` runs a single batch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyshift_cli::{build_migrations, format_status, select, Config};
use keyshift_crypto::Keyring;
use keyshift_db::Database;
use keyshift_migrate::{Direction, EncryptionMigrator, RunStatus, Runner};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "keyshift")]
#[command(about = "Batched, reversible encryption of sensitive columns")]
struct Args {
    /// Path to the config file
    #[arg(short, long, default_value = "keyshift.toml", global = true)]
    config: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the progress of every migration
    Status,
    /// Encrypt plaintext rows
    Up {
        /// Only run this migration
        #[arg(short, long)]
        migration: Option<String>,
        /// Run a single batch
        #[arg(long)]
        once: bool,
    },
    /// Decrypt encrypted rows back to plaintext
    Down {
        /// Only run this migration
        #[arg(short, long)]
        migration: Option<String>,
        /// Run a single batch
        #[arg(long)]
        once: bool,
        /// Permit writing plaintext back (also settable in the config file)
        #[arg(long)]
        allow_decrypt: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut config = Config::load(&args.config)?;
    if matches!(args.command, Command::Down { allow_decrypt: true, .. }) {
        config.migrator.allow_decrypt = true;
    }

    let db = Database::open(&config.database_path).with_context(|| {
        format!(
            "failed to open database {}",
            config.database_path.display()
        )
    })?;
    info!(schema_version = db.schema_version().await?, "database ready");

    let keyring = Keyring::from_config(&config.keyring).context("failed to build keyring")?;
    let migrations = build_migrations(&db, &keyring, &config.migrator)?;

    match args.command {
        Command::Status => {
            for migration in &migrations {
                let counts = migration.counts().await?;
                println!(
                    "{}",
                    format_status(
                        migration.id(),
                        counts.migrated,
                        counts.total,
                        counts.fraction()
                    )
                );
            }
        }
        Command::Up { migration, once } => {
            run(&migrations, migration.as_deref(), once, Direction::Up).await?;
        }
        Command::Down {
            migration, once, ..
        } => {
            run(&migrations, migration.as_deref(), once, Direction::Down).await?;
        }
    }

    Ok(())
}

async fn run(
    migrations: &[EncryptionMigrator],
    id: Option<&str>,
    once: bool,
    direction: Direction,
) -> Result<()> {
    let runner = if once {
        Runner::new().with_max_batches(1)
    } else {
        Runner::new()
    };

    for migration in select(migrations, id)? {
        let report = runner
            .run(migration, direction)
            .await
            .with_context(|| format!("migration {} {direction} failed", migration.id()))?;
        if let RunStatus::Stalled { reason } = report.status {
            match reason {
                Some(reason) => warn!(migration = migration.id(), %reason, "stopped early"),
                None => warn!(
                    migration = migration.id(),
                    "stopped early; rows are being changed concurrently"
                ),
            }
        }
        let counts = migration.counts().await?;
        println!(
            "{}",
            format_status(migration.id(), counts.migrated, counts.total, counts.fraction())
        );
    }
    Ok(())
}

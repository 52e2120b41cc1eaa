//! Out-of-band encryption migrations.
//!
//! An [`EncryptionMigrator`] moves the value columns of one table between
//! plaintext and ciphertext a batch at a time. Migration state is nothing but
//! the key-id column: NULL means plaintext, anything else names the key.
//! [`Runner`] drives any [`OutOfBandMigration`] to completion.

mod config;
mod error;
mod migration;
mod migrator;
pub mod progress;
mod runner;

pub use config::MigratorConfig;
pub use error::{MigrationError, MigrationResult};
pub use migration::{BatchOutcome, Direction, OutOfBandMigration, SkipReason};
pub use migrator::EncryptionMigrator;
pub use progress::ProgressCounts;
pub use runner::{RunReport, RunStatus, Runner};

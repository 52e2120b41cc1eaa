use crate::error::{MigrationError, MigrationResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for an [`EncryptionMigrator`](crate::EncryptionMigrator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Maximum rows touched by one `up` or `down` call.
    pub batch_size: usize,
    /// Must be set for `down` to write plaintext back.
    pub allow_decrypt: bool,
    /// Pause between batches when driven by a [`Runner`](crate::Runner).
    pub interval_secs: u64,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            allow_decrypt: false,
            interval_secs: 10,
        }
    }
}

impl MigratorConfig {
    pub fn validate(&self) -> MigrationResult<()> {
        if self.batch_size == 0 {
            return Err(MigrationError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

use crate::error::MigrationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which way a batch moves rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Plaintext to ciphertext.
    Up,
    /// Ciphertext back to plaintext.
    Down,
}

impl Direction {
    /// Progress value at which this direction is finished.
    pub fn target(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Why a batch deliberately did nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// `up` without a current key; rows stay plaintext until one is configured.
    NoKey,
    /// `down` without `allow_decrypt`.
    DecryptDisabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoKey => f.write_str("no encryption key configured"),
            SkipReason::DecryptDisabled => f.write_str("decryption is disabled"),
        }
    }
}

/// Result of one `up` or `down` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchOutcome {
    pub direction: Direction,
    /// Rows that matched the direction's predicate when the batch was read.
    pub selected: usize,
    /// Rows actually rewritten. Lower than `selected` only when another
    /// writer changed a row in between.
    pub rows_affected: usize,
    pub skipped: Option<SkipReason>,
}

impl BatchOutcome {
    pub(crate) fn skipped(direction: Direction, reason: SkipReason) -> Self {
        Self {
            direction,
            selected: 0,
            rows_affected: 0,
            skipped: Some(reason),
        }
    }

    /// Nothing matched the predicate: the direction is complete.
    pub fn is_exhausted(&self) -> bool {
        self.skipped.is_none() && self.selected == 0
    }
}

/// A migration that runs in the background, one batch per call, and can be
/// reversed.
#[async_trait]
pub trait OutOfBandMigration: Send + Sync {
    /// Stable identifier, e.g. `"webhooks.encryption"`.
    fn id(&self) -> &str;

    /// Pause between batches when polled.
    fn interval(&self) -> Duration;

    /// Fraction of the data already migrated, in `[0, 1]`.
    async fn progress(&self) -> MigrationResult<f64>;

    /// Migrates one batch forward.
    async fn up(&self) -> MigrationResult<BatchOutcome>;

    /// Reverts one batch.
    async fn down(&self) -> MigrationResult<BatchOutcome>;
}

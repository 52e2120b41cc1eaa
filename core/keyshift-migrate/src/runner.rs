//! Polling driver for out-of-band migrations.

use crate::error::MigrationResult;
use crate::migration::{Direction, OutOfBandMigration, SkipReason};
use tracing::{error, info, warn};

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunStatus {
    /// No rows are left to move in this direction.
    Completed,
    /// A batch made no progress. `reason` is set when the migration refused
    /// to run; otherwise every selected row was changed by another writer.
    Stalled { reason: Option<SkipReason> },
    /// Stopped after the configured number of batches.
    BatchLimit,
}

/// Summary of a [`Runner::run`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    pub batches: usize,
    pub rows_affected: usize,
    pub progress: f64,
}

/// Calls `up` or `down` repeatedly until a direction is exhausted, pausing
/// for the migration's interval between batches.
///
/// The first error ends the run and is returned as is; nothing is retried.
#[derive(Clone, Debug, Default)]
pub struct Runner {
    max_batches: Option<usize>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after at most `max_batches` batches.
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    pub async fn run(
        &self,
        migration: &dyn OutOfBandMigration,
        direction: Direction,
    ) -> MigrationResult<RunReport> {
        let mut batches = 0;
        let mut rows_affected = 0;

        let status = loop {
            let outcome = match direction {
                Direction::Up => migration.up().await,
                Direction::Down => migration.down().await,
            };
            let outcome = outcome.inspect_err(|err| {
                error!(migration = migration.id(), %direction, error = %err, "batch failed");
            })?;
            batches += 1;
            rows_affected += outcome.rows_affected;

            if let Some(reason) = outcome.skipped {
                warn!(migration = migration.id(), %direction, %reason, "migration stalled");
                break RunStatus::Stalled {
                    reason: Some(reason),
                };
            }
            if outcome.is_exhausted() {
                break RunStatus::Completed;
            }
            if outcome.rows_affected == 0 {
                warn!(
                    migration = migration.id(),
                    %direction,
                    selected = outcome.selected,
                    "no rows written; all selected rows changed concurrently"
                );
                break RunStatus::Stalled { reason: None };
            }
            if self.max_batches.is_some_and(|max| batches >= max) {
                break RunStatus::BatchLimit;
            }

            let progress = migration.progress().await?;
            info!(
                migration = migration.id(),
                %direction,
                batches,
                progress,
                "batch done"
            );
            tokio::time::sleep(migration.interval()).await;
        };

        let progress = migration.progress().await?;
        info!(
            migration = migration.id(),
            %direction,
            batches,
            rows_affected,
            ?status,
            "run finished"
        );
        Ok(RunReport {
            status,
            batches,
            rows_affected,
            progress,
        })
    }
}

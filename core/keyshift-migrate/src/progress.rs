//! Migration progress, computed from the table on every call.

use keyshift_db::DbResult;
use keyshift_store::EncryptedTable;
use rusqlite::Connection;

/// Fraction of migrated rows. An empty table counts as fully migrated.
pub fn fraction(migrated: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (migrated as f64 / total as f64).clamp(0.0, 1.0)
}

/// Row counts behind a progress value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub migrated: u64,
    pub total: u64,
}

impl ProgressCounts {
    pub fn fraction(&self) -> f64 {
        fraction(self.migrated, self.total)
    }

    /// Counts rows with a non-empty key id, in one read.
    pub fn query(conn: &Connection, table: &EncryptedTable) -> DbResult<Self> {
        let sql = format!(
            "SELECT COUNT(NULLIF({key_id}, '')), COUNT(*) FROM {table}",
            key_id = table.key_id_column(),
            table = table.table(),
        );
        let (migrated, total): (i64, i64) =
            conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(Self {
            migrated: migrated.max(0) as u64,
            total: total.max(0) as u64,
        })
    }
}

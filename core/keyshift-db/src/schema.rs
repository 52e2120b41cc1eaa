//! Forward-only schema migrations tracked in `PRAGMA user_version`.

use crate::error::{DbError, DbResult};
use rusqlite::Connection;
use tracing::info;

/// Ordered schema steps; step `i` moves the schema to version `i + 1`.
///
/// Value columns are declared `BLOB` so they hold plaintext text or opaque
/// ciphertext without affinity conversion. `encryption_key_id` is NULL for
/// plaintext rows.
const MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE webhooks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        url BLOB NOT NULL,
        secret BLOB,
        encryption_key_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE external_services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        display_name TEXT NOT NULL,
        config BLOB NOT NULL,
        encryption_key_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    ",
    "
    CREATE INDEX webhooks_encryption_key_id ON webhooks (encryption_key_id);
    CREATE INDEX external_services_encryption_key_id ON external_services (encryption_key_id);
    ",
];

/// Latest schema version this build knows about.
pub const LATEST_VERSION: u32 = MIGRATIONS.len() as u32;

/// Reads the schema version of `conn`.
pub fn version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Applies every pending step, each in its own transaction. Returns the
/// resulting version.
pub fn migrate(conn: &mut Connection) -> DbResult<u32> {
    let current = version(conn)?;
    if current > LATEST_VERSION {
        return Err(DbError::InvalidData(format!(
            "database schema version {current} is newer than supported version {LATEST_VERSION}"
        )));
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let target = index as u32 + 1;
        let apply = |conn: &mut Connection| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", target)?;
            tx.commit()
        };
        apply(conn).map_err(|source| DbError::Migration {
            version: target,
            source,
        })?;
        info!(version = target, "applied schema migration");
    }

    Ok(LATEST_VERSION)
}

//! Error types for migrations.
//!
//! Variants carry table, row and column names so failures can be diagnosed
//! from logs; none of them ever include plaintext or ciphertext.

use crate::migration::Direction;
use keyshift_crypto::CryptoError;
use keyshift_db::DbError;
use thiserror::Error;

pub type MigrationResult<T> = Result<T, MigrationError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// A freshly encrypted value did not decrypt back to the original. The
    /// batch was not written.
    #[error("invalid encryption round-trip: {table} row {row} column {column}")]
    InvalidRoundTrip {
        table: String,
        row: i64,
        column: String,
    },

    /// A row names a key id that no configured key can decrypt.
    #[error("{table} row {row} is encrypted with unknown key {key_id}")]
    UnknownKey {
        table: String,
        row: i64,
        key_id: String,
    },

    /// A key operation on one value failed.
    #[error("{direction} {table} row {row} column {column}: {source}")]
    Key {
        table: String,
        direction: Direction,
        row: i64,
        column: String,
        #[source]
        source: CryptoError,
    },

    /// Resolving or versioning a key failed before any value was touched.
    #[error("{direction} {table}: key lookup failed: {source}")]
    KeyLookup {
        table: String,
        direction: Direction,
        #[source]
        source: CryptoError,
    },

    /// A stored value could not be read as bytes.
    #[error("{table} row {row} column {column}: {source}")]
    InvalidValue {
        table: String,
        row: i64,
        column: String,
        #[source]
        source: DbError,
    },

    /// Selecting or writing a batch failed.
    #[error("{direction} {table}: {source}")]
    Batch {
        table: String,
        direction: Direction,
        #[source]
        source: DbError,
    },

    /// Counting migrated rows failed.
    #[error("reading progress of {table}: {source}")]
    Progress {
        table: String,
        #[source]
        source: DbError,
    },

    #[error("invalid migrator configuration: {0}")]
    Config(String),
}

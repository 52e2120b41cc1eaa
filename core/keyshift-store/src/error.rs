//! Error types for the store layer.

use keyshift_crypto::CryptoError;
use keyshift_db::DbError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Table or column name that is not a plain SQL identifier.
    #[error("invalid table descriptor: {0}")]
    InvalidTable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

//! Error types for the encryption layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in cryptographic operations.
///
/// Messages never include plaintext or ciphertext bytes.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (wrong key or tampered data).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid nonce length.
    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// A value carries a key id but no key was supplied to decrypt it.
    #[error("value is encrypted with key {key_id} but no key is configured")]
    MissingKey { key_id: String },

    /// Sibling fields came back tagged with different key versions.
    #[error("key mismatch: fields were encrypted with {first} and {second}")]
    KeyMismatch { first: String, second: String },

    /// External key service failure (network, HTTP status, bad response).
    #[error("key service error: {0}")]
    Remote(String),

    /// Invalid key configuration.
    #[error("invalid key configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CryptoError {
    fn from(err: reqwest::Error) -> Self {
        // The URL can carry credentials.
        CryptoError::Remote(err.without_url().to_string())
    }
}

//! Encryption-at-rest primitives for keyshift.
//!
//! - [`Key`]: the pluggable capability every store and migrator receives
//! - [`keys`]: no-op, local ChaCha20-Poly1305, and transit (KMS-backed) keys
//! - [`Encryptable`]: a secret that is read the same way whether or not it
//!   has been encrypted yet
//! - [`KeySet`] / [`Keyring`]: current plus historical keys, built from
//!   configuration and injected explicitly

mod cipher;
mod encryptable;
mod error;
mod kdf;
mod key;
mod keyring;
pub mod keys;
mod secret;

pub use cipher::{decrypt, encrypt, EncryptedData, NONCE_SIZE, TAG_SIZE};
pub use encryptable::{encrypt_siblings, Encryptable, JsonEncryptable};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_key, generate_random_key, DerivedKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
pub use key::{Key, KeyVersion};
pub use keyring::{KeyConfig, KeySet, KeySetConfig, Keyring, KeyringConfig};
pub use keys::{NoopKey, SymmetricKey, TransitConfig, TransitKey};
pub use secret::Secret;

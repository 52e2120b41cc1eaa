//! The pluggable key capability.
//!
//! Stores and the migrator depend on `Arc<dyn Key>` and never see raw key
//! material. Every method is async because a key may live behind an external
//! key service; dropping the returned future abandons the call.

use crate::error::{CryptoError, CryptoResult};
use crate::secret::Secret;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Encrypts and decrypts opaque payloads and reports which key version it is.
#[async_trait]
pub trait Key: Send + Sync {
    /// Encrypt `plaintext`, returning an opaque ciphertext.
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Decrypt a payload produced by [`Key::encrypt`]. Must return an error,
    /// never garbage, for ciphertext produced by an incompatible key.
    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret>;

    /// The version tag stored alongside values this key encrypts.
    async fn version(&self) -> CryptoResult<KeyVersion>;
}

/// Identifies the key that produced a ciphertext.
///
/// Serialized with [`KeyVersion::to_json`] into the `encryption_key_id`
/// column. Stable for a key configuration; changes when key material rotates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyVersion {
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl KeyVersion {
    pub fn new(
        key_type: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            key_type: key_type.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Canonical key id string. Never empty, since an empty key id marks
    /// plaintext.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("KeyVersion has only string fields")
    }

    /// Parses a key id read from storage.
    pub fn from_json(key_id: &str) -> CryptoResult<Self> {
        serde_json::from_str(key_id).map_err(CryptoError::from)
    }

    /// True when both versions belong to the same logical key, regardless of
    /// which rotation of it they name.
    pub fn same_key(&self, other: &KeyVersion) -> bool {
        self.key_type == other.key_type && self.name == other.name
    }
}

impl std::fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key_type)?;
        if !self.name.is_empty() {
            write!(f, "/{}", self.name)?;
        }
        if !self.version.is_empty() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}

use crate::cipher::{self, EncryptedData};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{derive_key, DerivedKey, KdfParams, Salt};
use crate::key::{Key, KeyVersion};
use crate::secret::Secret;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

const SYMMETRIC_KEY_TYPE: &str = "chacha20poly1305";

/// Hex chars of the key fingerprint kept in the version tag.
const FINGERPRINT_LEN: usize = 16;

/// Local ChaCha20-Poly1305 key.
///
/// Ciphertext is `base64(nonce || ciphertext+tag)`, so it is safe to store in
/// a TEXT column. The version carries a fingerprint of the key material; a
/// new key under the same name gets a new version.
#[derive(Clone)]
pub struct SymmetricKey {
    name: String,
    key: DerivedKey,
    fingerprint: String,
}

impl SymmetricKey {
    pub fn new(name: impl Into<String>, key: DerivedKey) -> Self {
        let fingerprint = fingerprint(&key);
        Self {
            name: name.into(),
            key,
            fingerprint,
        }
    }

    /// Loads a base64-encoded 32-byte key.
    pub fn from_base64(name: impl Into<String>, encoded: &str) -> CryptoResult<Self> {
        Ok(Self::new(name, DerivedKey::from_base64(encoded)?))
    }

    /// Derives the key from a passphrase with Argon2id.
    pub fn from_passphrase(
        name: impl Into<String>,
        passphrase: &str,
        salt: &Salt,
        params: &KdfParams,
    ) -> CryptoResult<Self> {
        if passphrase.is_empty() {
            return Err(CryptoError::Config("passphrase must not be empty".to_string()));
        }
        Ok(Self::new(name, derive_key(passphrase, salt, params)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn fingerprint(key: &DerivedKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"keyshift/fingerprint/v1");
    hasher.update(key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

#[async_trait]
impl Key for SymmetricKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let sealed = cipher::encrypt(&self.key, plaintext)?;
        Ok(sealed.to_base64().into_bytes())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        let sealed = EncryptedData::from_base64(ciphertext)?;
        let plaintext = cipher::decrypt(&self.key, &sealed)?;
        Secret::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Ok(KeyVersion::new(
            SYMMETRIC_KEY_TYPE,
            self.name.clone(),
            self.fingerprint.clone(),
        ))
    }
}

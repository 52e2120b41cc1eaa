//! Keys for test suites. Neither provides any confidentiality.

use crate::error::{CryptoError, CryptoResult};
use crate::key::{Key, KeyVersion};
use crate::secret::Secret;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};

/// Transparent key: "ciphertext" is the base64 of the plaintext, so tests can
/// assert on stored values.
#[derive(Clone, Debug, Default)]
pub struct Base64Key;

#[async_trait]
impl Key for Base64Key {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(STANDARD.encode(plaintext).into_bytes())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        let decoded = STANDARD
            .decode(ciphertext)
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;
        Secret::from_utf8(decoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Ok(KeyVersion::new("testkey", "", ""))
    }
}

/// Misconfigured key: encrypts without complaint, and decrypt returns
/// plausible-looking garbage instead of an error.
#[derive(Clone, Debug, Default)]
pub struct BadKey;

#[async_trait]
impl Key for BadKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(plaintext.iter().rev().copied().collect())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        Ok(Secret::new(format!("garbage-{}", ciphertext.len())))
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Ok(KeyVersion::new("badkey", "", ""))
    }
}

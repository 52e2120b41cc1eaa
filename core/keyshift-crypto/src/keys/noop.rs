use crate::error::{CryptoError, CryptoResult};
use crate::key::{Key, KeyVersion};
use crate::secret::Secret;
use async_trait::async_trait;

/// Passes data through unchanged.
///
/// With `fail_decrypt` set, every decrypt errors instead; operators use this
/// to make sure nothing reads values that were tagged by the no-op key.
#[derive(Clone, Debug, Default)]
pub struct NoopKey {
    pub fail_decrypt: bool,
}

impl NoopKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_decrypt() -> Self {
        Self { fail_decrypt: true }
    }
}

#[async_trait]
impl Key for NoopKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        if self.fail_decrypt {
            return Err(CryptoError::Decryption(
                "no-op key is configured to refuse decryption".to_string(),
            ));
        }
        Secret::from_utf8(ciphertext.to_vec())
            .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Ok(KeyVersion::new("noop", "", ""))
    }
}

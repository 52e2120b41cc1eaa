//! A secret value that may or may not be encrypted yet.
//!
//! Rows are read back as whatever they are on disk: plaintext written before
//! a key existed, or ciphertext tagged with the key id that produced it.
//! Callers interact with both in the same way and supply the key lazily.

use crate::error::{CryptoError, CryptoResult};
use crate::key::Key;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Clone)]
enum State {
    Plaintext(String),
    Ciphertext {
        payload: Vec<u8>,
        key_id: String,
        key: Option<Arc<dyn Key>>,
    },
}

/// Holds one logical secret, either as plaintext or as ciphertext plus the
/// key id and key needed to read it.
///
/// Built fresh for every row read; never cached across requests.
#[derive(Clone)]
pub struct Encryptable {
    state: State,
}

impl Encryptable {
    /// A value that has not been encrypted.
    pub fn unencrypted(plaintext: impl Into<String>) -> Self {
        Self {
            state: State::Plaintext(plaintext.into()),
        }
    }

    /// A value read from storage. An empty `key_id` means the payload was
    /// stored in plaintext and `key` is never consulted.
    pub fn encrypted(
        payload: impl Into<Vec<u8>>,
        key_id: impl Into<String>,
        key: Option<Arc<dyn Key>>,
    ) -> Self {
        Self {
            state: State::Ciphertext {
                payload: payload.into(),
                key_id: key_id.into(),
                key,
            },
        }
    }

    /// Whether the value is held as ciphertext produced by a key.
    pub fn is_encrypted(&self) -> bool {
        matches!(&self.state, State::Ciphertext { key_id, .. } if !key_id.is_empty())
    }

    /// Key id of the held ciphertext; empty when the value is plaintext.
    pub fn key_id(&self) -> &str {
        match &self.state {
            State::Plaintext(_) => "",
            State::Ciphertext { key_id, .. } => key_id,
        }
    }

    /// Returns the plaintext, decrypting with the attached key if needed.
    ///
    /// A successful decryption replaces the ciphertext with the plaintext, so
    /// repeated calls cost one key round trip at most.
    pub async fn decrypt(&mut self) -> CryptoResult<String> {
        let plaintext = match &self.state {
            State::Plaintext(value) => return Ok(value.clone()),
            State::Ciphertext { payload, key_id, .. } if key_id.is_empty() => {
                String::from_utf8(payload.clone())
                    .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))?
            }
            State::Ciphertext {
                key_id, key: None, ..
            } => {
                return Err(CryptoError::MissingKey {
                    key_id: key_id.clone(),
                });
            }
            State::Ciphertext {
                payload,
                key: Some(key),
                ..
            } => key.decrypt(payload).await?.into_string(),
        };
        self.state = State::Plaintext(plaintext.clone());
        Ok(plaintext)
    }

    /// Encrypts the current value with `key`, returning the payload to store
    /// and the key id to store next to it.
    ///
    /// With no key the plaintext is returned untouched with an empty key id.
    pub async fn encrypt(&mut self, key: Option<&dyn Key>) -> CryptoResult<(Vec<u8>, String)> {
        let plaintext = self.decrypt().await?;
        let Some(key) = key else {
            return Ok((plaintext.into_bytes(), String::new()));
        };
        let payload = key.encrypt(plaintext.as_bytes()).await?;
        let key_id = key.version().await?.to_json();
        Ok((payload, key_id))
    }

    /// Replaces the value. Any previously held ciphertext is discarded and
    /// must be re-encrypted before the value is persisted.
    pub fn set(&mut self, plaintext: impl Into<String>) {
        self.state = State::Plaintext(plaintext.into());
    }
}

impl std::fmt::Debug for Encryptable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            State::Plaintext(_) => f
                .debug_struct("Encryptable")
                .field("state", &"plaintext")
                .finish_non_exhaustive(),
            State::Ciphertext { key_id, key, .. } => f
                .debug_struct("Encryptable")
                .field("state", &"ciphertext")
                .field("key_id", key_id)
                .field("has_key", &key.is_some())
                .finish_non_exhaustive(),
        }
    }
}

/// Encrypts related fields that share one key-id column.
///
/// Every field must come back tagged with the same key id; a difference means
/// the key rotated between calls and the write has to be rejected.
pub async fn encrypt_siblings(
    fields: &mut [&mut Encryptable],
    key: Option<&dyn Key>,
) -> CryptoResult<(Vec<Vec<u8>>, String)> {
    let mut payloads = Vec::with_capacity(fields.len());
    let mut shared_key_id: Option<String> = None;

    for field in fields.iter_mut() {
        let (payload, key_id) = field.encrypt(key).await?;
        match &shared_key_id {
            Some(first) if *first != key_id => {
                return Err(CryptoError::KeyMismatch {
                    first: first.clone(),
                    second: key_id,
                });
            }
            Some(_) => {}
            None => shared_key_id = Some(key_id),
        }
        payloads.push(payload);
    }

    Ok((payloads, shared_key_id.unwrap_or_default()))
}

/// An [`Encryptable`] whose plaintext is the JSON encoding of a `T`.
pub struct JsonEncryptable<T> {
    inner: Encryptable,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonEncryptable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for JsonEncryptable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("JsonEncryptable").field(&self.inner).finish()
    }
}

impl<T: Serialize + DeserializeOwned> JsonEncryptable<T> {
    /// Serializes `value` into an unencrypted holder.
    pub fn unencrypted(value: &T) -> CryptoResult<Self> {
        Ok(Self::from_encryptable(Encryptable::unencrypted(
            serde_json::to_string(value)?,
        )))
    }

    pub fn from_encryptable(inner: Encryptable) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Decrypts and deserializes the value.
    pub async fn decrypted(&mut self) -> CryptoResult<T> {
        let raw = self.inner.decrypt().await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Replaces the value.
    pub fn set_value(&mut self, value: &T) -> CryptoResult<()> {
        self.inner.set(serde_json::to_string(value)?);
        Ok(())
    }

    pub fn encryptable(&self) -> &Encryptable {
        &self.inner
    }

    pub fn encryptable_mut(&mut self) -> &mut Encryptable {
        &mut self.inner
    }

    pub fn into_inner(self) -> Encryptable {
        self.inner
    }
}

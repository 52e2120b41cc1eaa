//! Key sets and their configuration.
//!
//! A [`KeySet`] is what stores and migrators receive: the key used for new
//! writes plus older keys kept around so values tagged with them stay
//! readable. The [`Keyring`] groups one key set per purpose and is built
//! once from configuration, then passed down explicitly.

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{KdfParams, Salt};
use crate::key::{Key, KeyVersion};
use crate::keys::{NoopKey, SymmetricKey, TransitConfig, TransitKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

type VersionedKeys = Vec<(KeyVersion, Arc<dyn Key>)>;

/// The current key plus historical keys for decryption.
#[derive(Clone, Default)]
pub struct KeySet {
    current: Option<Arc<dyn Key>>,
    previous: Vec<Arc<dyn Key>>,
    versions: Arc<OnceCell<VersionedKeys>>,
}

impl KeySet {
    pub fn new(current: Option<Arc<dyn Key>>, previous: Vec<Arc<dyn Key>>) -> Self {
        Self {
            current,
            previous,
            versions: Arc::new(OnceCell::new()),
        }
    }

    /// A set with only a current key.
    pub fn single(key: Arc<dyn Key>) -> Self {
        Self::new(Some(key), Vec::new())
    }

    /// A set with no keys at all: values are written in plaintext.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Key used for new encryptions, if one is configured.
    pub fn current(&self) -> Option<&Arc<dyn Key>> {
        self.current.as_ref()
    }

    pub fn current_key(&self) -> Option<&dyn Key> {
        self.current.as_deref()
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Finds the key able to decrypt a value tagged with `key_id`.
    ///
    /// An exact version match wins; otherwise any key with the same type and
    /// name is returned, since a rotated key still decrypts its own older
    /// versions. Returns `None` for an empty key id or an unknown key.
    pub async fn resolve(&self, key_id: &str) -> CryptoResult<Option<Arc<dyn Key>>> {
        if key_id.is_empty() {
            return Ok(None);
        }
        let versions = self
            .versions
            .get_or_try_init(|| async {
                let mut versions = Vec::with_capacity(1 + self.previous.len());
                for key in self.current.iter().chain(self.previous.iter()) {
                    versions.push((key.version().await?, Arc::clone(key)));
                }
                Ok::<_, CryptoError>(versions)
            })
            .await?;

        if let Some((_, key)) = versions.iter().find(|(v, _)| v.to_json() == key_id) {
            return Ok(Some(Arc::clone(key)));
        }
        let Ok(wanted) = KeyVersion::from_json(key_id) else {
            return Ok(None);
        };
        Ok(versions
            .iter()
            .find(|(v, _)| v.same_key(&wanted))
            .map(|(_, key)| Arc::clone(key)))
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("has_current", &self.current.is_some())
            .field("previous", &self.previous.len())
            .finish()
    }
}

/// Configuration for a single key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyConfig {
    Noop {
        #[serde(default)]
        fail_decrypt: bool,
    },
    #[serde(rename = "chacha20poly1305")]
    Symmetric {
        name: String,
        /// Base64 of 32 random bytes.
        #[serde(default)]
        key_base64: Option<String>,
        /// Alternative to `key_base64`; requires `salt_base64`.
        #[serde(default)]
        passphrase: Option<String>,
        #[serde(default)]
        salt_base64: Option<String>,
    },
    Transit(TransitConfig),
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyConfig::Noop { fail_decrypt } => f
                .debug_struct("Noop")
                .field("fail_decrypt", fail_decrypt)
                .finish(),
            KeyConfig::Symmetric { name, .. } => f
                .debug_struct("Symmetric")
                .field("name", name)
                .finish_non_exhaustive(),
            KeyConfig::Transit(config) => f.debug_tuple("Transit").field(config).finish(),
        }
    }
}

impl KeyConfig {
    pub fn build(&self) -> CryptoResult<Arc<dyn Key>> {
        match self {
            KeyConfig::Noop { fail_decrypt } => Ok(Arc::new(NoopKey {
                fail_decrypt: *fail_decrypt,
            })),
            KeyConfig::Symmetric {
                name,
                key_base64,
                passphrase,
                salt_base64,
            } => {
                let key = match (key_base64, passphrase) {
                    (Some(encoded), None) => SymmetricKey::from_base64(name.clone(), encoded)?,
                    (None, Some(passphrase)) => {
                        let salt = salt_base64.as_deref().ok_or_else(|| {
                            CryptoError::Config(format!(
                                "key {name}: passphrase requires salt_base64"
                            ))
                        })?;
                        SymmetricKey::from_passphrase(
                            name.clone(),
                            passphrase,
                            &Salt::from_base64(salt)?,
                            &KdfParams::default(),
                        )?
                    }
                    _ => {
                        return Err(CryptoError::Config(format!(
                            "key {name}: set exactly one of key_base64 or passphrase"
                        )));
                    }
                };
                Ok(Arc::new(key))
            }
            KeyConfig::Transit(config) => Ok(Arc::new(TransitKey::new(config.clone())?)),
        }
    }
}

/// Configuration for a [`KeySet`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeySetConfig {
    #[serde(default)]
    pub current: Option<KeyConfig>,
    #[serde(default)]
    pub previous: Vec<KeyConfig>,
}

impl KeySetConfig {
    pub fn build(&self) -> CryptoResult<KeySet> {
        let current = self.current.as_ref().map(KeyConfig::build).transpose()?;
        let previous = self
            .previous
            .iter()
            .map(KeyConfig::build)
            .collect::<CryptoResult<Vec<_>>>()?;
        Ok(KeySet::new(current, previous))
    }
}

/// Per-purpose key configuration. A missing section means "no key": values
/// for that purpose stay in plaintext.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyringConfig {
    #[serde(default)]
    pub webhook: Option<KeySetConfig>,
    #[serde(default)]
    pub external_service: Option<KeySetConfig>,
}

/// One key set per purpose.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    pub webhook: KeySet,
    pub external_service: KeySet,
}

impl Keyring {
    pub fn from_config(config: &KeyringConfig) -> CryptoResult<Self> {
        let build = |section: &Option<KeySetConfig>| {
            section
                .as_ref()
                .map(KeySetConfig::build)
                .transpose()
                .map(Option::unwrap_or_default)
        };
        Ok(Self {
            webhook: build(&config.webhook)?,
            external_service: build(&config.external_service)?,
        })
    }
}

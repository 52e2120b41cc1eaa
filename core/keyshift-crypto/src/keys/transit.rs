//! Key held by an external key service speaking the Vault transit API.
//!
//! The key material never leaves the service; encrypt and decrypt are HTTP
//! round trips and every failure surfaces as [`CryptoError::Remote`].

use crate::error::{CryptoError, CryptoResult};
use crate::key::{Key, KeyVersion};
use crate::secret::Secret;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const TRANSIT_KEY_TYPE: &str = "transit";
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Connection settings for a transit key.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransitConfig {
    /// Base URL of the key service (e.g. `https://vault.internal:8200`).
    pub address: String,
    /// Access token sent with every request.
    pub token: String,
    /// Name of the key inside the transit mount.
    pub key_name: String,
    /// Mount path of the transit engine.
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mount() -> String {
    "transit".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl std::fmt::Debug for TransitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitConfig")
            .field("address", &self.address)
            .field("token", &"[REDACTED]")
            .field("key_name", &self.key_name)
            .field("mount", &self.mount)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Serialize)]
struct EncryptRequest {
    plaintext: String,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct KeyInfoResponse {
    latest_version: u64,
}

/// KMS-backed key.
#[derive(Debug, Clone)]
pub struct TransitKey {
    config: TransitConfig,
    client: Client,
}

impl TransitKey {
    pub fn new(config: TransitConfig) -> CryptoResult<Self> {
        if config.address.is_empty() || config.key_name.is_empty() {
            return Err(CryptoError::Config(
                "transit key requires an address and a key name".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CryptoError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, operation: &str) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.config.address.trim_end_matches('/'),
            self.config.mount.trim_matches('/'),
            operation,
            self.config.key_name
        )
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> CryptoResult<T> {
        let response = request
            .header(TOKEN_HEADER, &self.config.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CryptoError::Remote(format!(
                "{operation} on key {} returned {status}",
                self.config.key_name
            )));
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl Key for TransitKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let body = EncryptRequest {
            plaintext: STANDARD.encode(plaintext),
        };
        let request = self.client.post(self.url("encrypt")).json(&body);
        let data: EncryptResponse = self.send(request, "encrypt").await?;
        Ok(data.ciphertext.into_bytes())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|_| CryptoError::Decryption("transit ciphertext is not UTF-8".to_string()))?;
        let request = self
            .client
            .post(self.url("decrypt"))
            .json(&DecryptRequest { ciphertext });
        let data: DecryptResponse = self.send(request, "decrypt").await?;
        let plaintext = STANDARD
            .decode(data.plaintext)
            .map_err(|e| CryptoError::Remote(format!("invalid base64 plaintext: {e}")))?;
        Secret::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        let request = self.client.get(self.url("keys"));
        let info: KeyInfoResponse = self.send(request, "read key").await?;
        debug!(
            key = %self.config.key_name,
            version = info.latest_version,
            "resolved transit key version"
        );
        Ok(KeyVersion::new(
            TRANSIT_KEY_TYPE,
            self.config.key_name.clone(),
            info.latest_version.to_string(),
        ))
    }
}

//! Reading and writing encrypted columns.
//!
//! [`codec`] is the only place that knows how an [`Encryptable`] maps onto a
//! value column plus a nullable key-id column. The stores built on it write
//! new rows encrypted whenever their key set has a current key.
//!
//! [`Encryptable`]: keyshift_crypto::Encryptable

pub mod codec;
mod error;
pub mod external_services;
pub mod webhooks;

pub use codec::EncryptedTable;
pub use error::{StoreError, StoreResult};
pub use external_services::{ExternalService, ExternalServiceStore};
pub use webhooks::{NewWebhook, Webhook, WebhookStore};

//! Outgoing webhooks. The URL and the optional signing secret are both
//! sensitive and share the `encryption_key_id` column.

use crate::codec::{self, EncryptedTable};
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use keyshift_crypto::{Encryptable, KeySet};
use keyshift_db::{Database, DbError, DbResult};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "id, uuid, name, url, secret, encryption_key_id, created_at, updated_at";

/// Descriptor of the encrypted columns of `webhooks`.
pub fn webhooks_table() -> StoreResult<EncryptedTable> {
    EncryptedTable::new("webhooks", "id", ["url", "secret"], "encryption_key_id")
}

#[derive(Clone, Debug)]
pub struct Webhook {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub url: Encryptable,
    pub secret: Option<Encryptable>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`WebhookStore::create`].
#[derive(Clone, Debug)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    pub secret: Option<String>,
}

/// Row as read, before keys are attached.
struct RawWebhook {
    id: i64,
    uuid: String,
    name: String,
    url: Option<Vec<u8>>,
    secret: Option<Vec<u8>>,
    key_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawWebhook {
    fn from_row(row: &Row<'_>) -> DbResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            name: row.get(2)?,
            url: codec::value_from_sql(row.get::<_, Value>(3)?)?,
            secret: codec::value_from_sql(row.get::<_, Value>(4)?)?,
            key_id: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

pub struct WebhookStore {
    db: Database,
    keys: KeySet,
}

impl WebhookStore {
    /// A store that writes plaintext.
    pub fn new(db: Database) -> Self {
        Self::with_keys(db, KeySet::empty())
    }

    pub fn with_keys(db: Database, keys: KeySet) -> Self {
        Self { db, keys }
    }

    pub async fn create(&self, webhook: NewWebhook) -> StoreResult<Webhook> {
        let mut url = Encryptable::unencrypted(webhook.url);
        let mut secret = webhook.secret.map(Encryptable::unencrypted);
        let (url_payload, secret_payload, key_id) = self.encode(&mut url, secret.as_mut()).await?;

        let uuid = Uuid::new_v4().to_string();
        let now = codec::now_rfc3339();
        let name = webhook.name;
        let id = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO webhooks (uuid, name, url, secret, encryption_key_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![uuid, name, url_payload, secret_payload, key_id, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(id, "created webhook");

        self.get_by_id(id).await
    }

    pub async fn get_by_id(&self, id: i64) -> StoreResult<Webhook> {
        let raw = self
            .db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM webhooks WHERE id = ?1"),
                    [id],
                    |row| Ok(RawWebhook::from_row(row)),
                )
                .optional()?
                .transpose()
            })
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "webhook",
                id: id.to_string(),
            })?;
        self.hydrate(raw).await
    }

    pub async fn get_by_uuid(&self, uuid: Uuid) -> StoreResult<Webhook> {
        let raw = self
            .db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM webhooks WHERE uuid = ?1"),
                    [uuid.to_string()],
                    |row| Ok(RawWebhook::from_row(row)),
                )
                .optional()?
                .transpose()
            })
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "webhook",
                id: uuid.to_string(),
            })?;
        self.hydrate(raw).await
    }

    /// All webhooks ordered by id.
    pub async fn list(&self) -> StoreResult<Vec<Webhook>> {
        let raws = self
            .db
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM webhooks ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                let mut raws = Vec::new();
                while let Some(row) = rows.next()? {
                    raws.push(RawWebhook::from_row(row)?);
                }
                Ok(raws)
            })
            .await?;

        let mut webhooks = Vec::with_capacity(raws.len());
        for raw in raws {
            webhooks.push(self.hydrate(raw).await?);
        }
        Ok(webhooks)
    }

    pub async fn count(&self) -> StoreResult<i64> {
        Ok(self
            .db
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM webhooks", [], |row| row.get(0))?))
            .await?)
    }

    /// Persists `webhook.name`, `url` and `secret`, re-encrypting both values
    /// with the current key.
    pub async fn update(&self, webhook: &mut Webhook) -> StoreResult<()> {
        let (url_payload, secret_payload, key_id) = self
            .encode(&mut webhook.url, webhook.secret.as_mut())
            .await?;

        let id = webhook.id;
        let name = webhook.name.clone();
        let now = codec::now_rfc3339();
        let updated = self
            .db
            .call({
                let now = now.clone();
                move |conn| {
                    Ok(conn.execute(
                        "UPDATE webhooks
                         SET name = ?1, url = ?2, secret = ?3, encryption_key_id = ?4, updated_at = ?5
                         WHERE id = ?6",
                        params![name, url_payload, secret_payload, key_id, now, id],
                    )?)
                }
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook",
                id: id.to_string(),
            });
        }
        webhook.updated_at = codec::parse_timestamp(&now)?;
        debug!(id, "updated webhook");
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> StoreResult<()> {
        let deleted = self
            .db
            .call(move |conn| Ok(conn.execute("DELETE FROM webhooks WHERE id = ?1", [id])?))
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Encrypts url and secret together so they carry one key id.
    async fn encode(
        &self,
        url: &mut Encryptable,
        secret: Option<&mut Encryptable>,
    ) -> StoreResult<(Value, Value, Option<String>)> {
        let key = self.keys.current_key();
        let mut fields: Vec<&mut Encryptable> = vec![url];
        let has_secret = secret.is_some();
        fields.extend(secret);

        let (payloads, key_id) = codec::encode_siblings(&mut fields, key).await?;
        let mut payloads = payloads.into_iter().map(codec::value_to_sql);
        let url = payloads.next().unwrap_or(Value::Null);
        let secret = if has_secret {
            payloads.next().unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        Ok((url, secret, key_id))
    }

    async fn hydrate(&self, raw: RawWebhook) -> StoreResult<Webhook> {
        let key_id = raw.key_id.as_deref();
        let url = codec::decode_with_keys(raw.url, key_id, &self.keys)
            .await?
            .ok_or_else(|| DbError::InvalidData(format!("webhook {} has no url", raw.id)))?;
        let secret = codec::decode_with_keys(raw.secret, key_id, &self.keys).await?;
        let uuid = Uuid::parse_str(&raw.uuid)
            .map_err(|e| DbError::InvalidData(format!("invalid webhook uuid: {e}")))?;

        Ok(Webhook {
            id: raw.id,
            uuid,
            name: raw.name,
            url,
            secret,
            created_at: codec::parse_timestamp(&raw.created_at)?,
            updated_at: codec::parse_timestamp(&raw.updated_at)?,
        })
    }
}

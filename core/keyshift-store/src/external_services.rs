//! Code host connections whose JSON config carries access tokens.

use crate::codec::{self, EncryptedTable};
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use keyshift_crypto::{JsonEncryptable, KeySet};
use keyshift_db::{Database, DbError, DbResult};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

const SELECT_COLUMNS: &str =
    "id, kind, display_name, config, encryption_key_id, created_at, updated_at";

/// Descriptor of the encrypted columns of `external_services`.
pub fn external_services_table() -> StoreResult<EncryptedTable> {
    EncryptedTable::new(
        "external_services",
        "id",
        ["config"],
        "encryption_key_id",
    )
}

#[derive(Clone, Debug)]
pub struct ExternalService {
    pub id: i64,
    pub kind: String,
    pub display_name: String,
    pub config: JsonEncryptable<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct RawExternalService {
    id: i64,
    kind: String,
    display_name: String,
    config: Option<Vec<u8>>,
    key_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawExternalService {
    fn from_row(row: &Row<'_>) -> DbResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            display_name: row.get(2)?,
            config: codec::value_from_sql(row.get::<_, Value>(3)?)?,
            key_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

pub struct ExternalServiceStore {
    db: Database,
    keys: KeySet,
}

impl ExternalServiceStore {
    pub fn new(db: Database) -> Self {
        Self::with_keys(db, KeySet::empty())
    }

    pub fn with_keys(db: Database, keys: KeySet) -> Self {
        Self { db, keys }
    }

    pub async fn create(
        &self,
        kind: impl Into<String>,
        display_name: impl Into<String>,
        config: &serde_json::Value,
    ) -> StoreResult<ExternalService> {
        let (payload, key_id) = self.encode(config).await?;
        let kind = kind.into();
        let display_name = display_name.into();
        let now = codec::now_rfc3339();

        let id = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO external_services (kind, display_name, config, encryption_key_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![kind, display_name, payload, key_id, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(id, "created external service");

        self.get_by_id(id).await
    }

    pub async fn get_by_id(&self, id: i64) -> StoreResult<ExternalService> {
        let raw = self
            .db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM external_services WHERE id = ?1"),
                    [id],
                    |row| Ok(RawExternalService::from_row(row)),
                )
                .optional()?
                .transpose()
            })
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "external service",
                id: id.to_string(),
            })?;
        self.hydrate(raw).await
    }

    pub async fn list(&self) -> StoreResult<Vec<ExternalService>> {
        let raws = self
            .db
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM external_services ORDER BY id"
                ))?;
                let mut rows = stmt.query([])?;
                let mut raws = Vec::new();
                while let Some(row) = rows.next()? {
                    raws.push(RawExternalService::from_row(row)?);
                }
                Ok(raws)
            })
            .await?;

        let mut services = Vec::with_capacity(raws.len());
        for raw in raws {
            services.push(self.hydrate(raw).await?);
        }
        Ok(services)
    }

    /// Replaces the config, encrypting it with the current key.
    pub async fn update_config(&self, id: i64, config: &serde_json::Value) -> StoreResult<()> {
        let (payload, key_id) = self.encode(config).await?;
        let now = codec::now_rfc3339();
        let updated = self
            .db
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE external_services SET config = ?1, encryption_key_id = ?2, updated_at = ?3 WHERE id = ?4",
                    params![payload, key_id, now, id],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "external service",
                id: id.to_string(),
            });
        }
        debug!(id, "updated external service config");
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> StoreResult<()> {
        let deleted = self
            .db
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM external_services WHERE id = ?1", [id])?)
            })
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                kind: "external service",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn encode(&self, config: &serde_json::Value) -> StoreResult<(Value, Option<String>)> {
        let mut value = JsonEncryptable::unencrypted(config)?;
        let (payload, key_id) =
            codec::encode_column(value.encryptable_mut(), self.keys.current_key()).await?;
        Ok((codec::value_to_sql(payload), key_id))
    }

    async fn hydrate(&self, raw: RawExternalService) -> StoreResult<ExternalService> {
        let config = codec::decode_with_keys(raw.config, raw.key_id.as_deref(), &self.keys)
            .await?
            .ok_or_else(|| {
                DbError::InvalidData(format!("external service {} has no config", raw.id))
            })?;

        Ok(ExternalService {
            id: raw.id,
            kind: raw.kind,
            display_name: raw.display_name,
            config: JsonEncryptable::from_encryptable(config),
            created_at: codec::parse_timestamp(&raw.created_at)?,
            updated_at: codec::parse_timestamp(&raw.updated_at)?,
        })
    }
}

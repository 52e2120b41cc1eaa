//! Mapping between [`Encryptable`] values and table columns.
//!
//! A row stores each protected value in its own column and the id of the key
//! that encrypted it in a key-id column. A NULL key id means the value is
//! plaintext; that convention lives only in this module.

use crate::error::{StoreError, StoreResult};
use keyshift_crypto::{encrypt_siblings, CryptoResult, Encryptable, Key, KeySet};
use keyshift_db::{DbError, DbResult};
use rusqlite::types::Value;
use std::sync::Arc;

/// Describes which columns of a table hold encrypted values.
///
/// Value columns sharing one key-id column must always be encrypted together
/// with the same key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedTable {
    table: String,
    id_column: String,
    value_columns: Vec<String>,
    key_id_column: String,
}

impl EncryptedTable {
    /// Builds a descriptor, rejecting anything that is not a plain identifier
    /// since these names are interpolated into SQL.
    pub fn new<I, S>(
        table: impl Into<String>,
        id_column: impl Into<String>,
        value_columns: I,
        key_id_column: impl Into<String>,
    ) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let descriptor = Self {
            table: table.into(),
            id_column: id_column.into(),
            value_columns: value_columns.into_iter().map(Into::into).collect(),
            key_id_column: key_id_column.into(),
        };

        if descriptor.value_columns.is_empty() {
            return Err(StoreError::InvalidTable(format!(
                "table {} has no value columns",
                descriptor.table
            )));
        }
        let names = [
            &descriptor.table,
            &descriptor.id_column,
            &descriptor.key_id_column,
        ]
        .into_iter()
        .chain(descriptor.value_columns.iter());
        for name in names {
            if !is_identifier(name) {
                return Err(StoreError::InvalidTable(format!(
                    "{name:?} is not a valid identifier"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for column in descriptor.columns() {
            if !seen.insert(column) {
                return Err(StoreError::InvalidTable(format!(
                    "column {column} appears more than once in {}",
                    descriptor.table
                )));
            }
        }

        Ok(descriptor)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn value_columns(&self) -> &[String] {
        &self.value_columns
    }

    pub fn key_id_column(&self) -> &str {
        &self.key_id_column
    }

    /// Id column, value columns, then key-id column.
    fn columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id_column.as_str())
            .chain(self.value_columns.iter().map(String::as_str))
            .chain(std::iter::once(self.key_id_column.as_str()))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builds an [`Encryptable`] from a stored value and its key id.
///
/// A NULL value stays `None`. A NULL (or empty) key id marks plaintext; the
/// key is only attached when the value is actually encrypted.
pub fn decode_column(
    value: Option<Vec<u8>>,
    key_id: Option<&str>,
    key: Option<Arc<dyn Key>>,
) -> Option<Encryptable> {
    let value = value?;
    Some(match key_id.filter(|id| !id.is_empty()) {
        None => Encryptable::encrypted(value, "", None),
        Some(key_id) => Encryptable::encrypted(value, key_id, key),
    })
}

/// Like [`decode_column`], resolving the key from `keys` by key id.
pub async fn decode_with_keys(
    value: Option<Vec<u8>>,
    key_id: Option<&str>,
    keys: &KeySet,
) -> CryptoResult<Option<Encryptable>> {
    let key = match key_id {
        Some(key_id) => keys.resolve(key_id).await?,
        None => None,
    };
    Ok(decode_column(value, key_id, key))
}

/// Encrypts `value` for storage. The key id is `None` when no key was used.
pub async fn encode_column(
    value: &mut Encryptable,
    key: Option<&dyn Key>,
) -> CryptoResult<(Vec<u8>, Option<String>)> {
    let (payload, key_id) = value.encrypt(key).await?;
    Ok((payload, non_empty(key_id)))
}

/// Encrypts sibling values that share one key-id column.
pub async fn encode_siblings(
    values: &mut [&mut Encryptable],
    key: Option<&dyn Key>,
) -> CryptoResult<(Vec<Vec<u8>>, Option<String>)> {
    let (payloads, key_id) = encrypt_siblings(values, key).await?;
    Ok((payloads, non_empty(key_id)))
}

fn non_empty(key_id: String) -> Option<String> {
    (!key_id.is_empty()).then_some(key_id)
}

/// Converts a payload to its SQL value: TEXT when it is valid UTF-8, BLOB
/// otherwise.
pub fn value_to_sql(payload: Vec<u8>) -> Value {
    match String::from_utf8(payload) {
        Ok(text) => Value::Text(text),
        Err(err) => Value::Blob(err.into_bytes()),
    }
}

/// Reads a value column back as bytes, whether it was stored as TEXT or BLOB.
pub fn value_from_sql(value: Value) -> DbResult<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text.into_bytes())),
        Value::Blob(bytes) => Ok(Some(bytes)),
        Value::Integer(_) | Value::Real(_) => Err(DbError::InvalidData(
            "encrypted column holds a numeric value".to_string(),
        )),
    }
}

/// Current time as stored in timestamp columns.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DbResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&chrono::Utc))
        .map_err(|e| DbError::InvalidData(format!("invalid timestamp {raw:?}: {e}")))
}

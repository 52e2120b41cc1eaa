//! Batched encryption and decryption of the value columns of one table.
//!
//! Each call works in three phases:
//!
//! 1. read up to `batch_size` rows matching the direction's predicate, ordered
//!    by id;
//! 2. transform every value with the key, off the database connection;
//! 3. write the whole batch in one transaction.
//!
//! Every UPDATE repeats the predicate and the values read in phase 1, so a row
//! changed by another writer or another migrator in between is left alone.
//! Dropping the future before phase 3 writes nothing; phase 3 commits or rolls
//! back as a unit.

use crate::config::MigratorConfig;
use crate::error::{MigrationError, MigrationResult};
use crate::migration::{BatchOutcome, Direction, OutOfBandMigration, SkipReason};
use crate::progress::ProgressCounts;
use async_trait::async_trait;
use keyshift_crypto::{CryptoError, Encryptable, Key, KeySet};
use keyshift_db::{Database, DbError, DbResult};
use keyshift_store::codec;
use keyshift_store::EncryptedTable;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A row as read in phase 1.
struct SelectedRow {
    id: i64,
    values: Vec<Value>,
    key_id: Option<String>,
}

/// A guarded rewrite of one row.
struct RowUpdate {
    id: i64,
    old_values: Vec<Value>,
    old_key_id: Option<String>,
    new_values: Vec<Value>,
    new_key_id: Option<String>,
}

pub struct EncryptionMigrator {
    id: String,
    db: Database,
    table: EncryptedTable,
    keys: KeySet,
    config: MigratorConfig,
}

impl EncryptionMigrator {
    pub fn new(
        id: impl Into<String>,
        db: Database,
        table: EncryptedTable,
        keys: KeySet,
        config: MigratorConfig,
    ) -> MigrationResult<Self> {
        config.validate()?;
        Ok(Self {
            id: id.into(),
            db,
            table,
            keys,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table(&self) -> &EncryptedTable {
        &self.table
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Migrated and total row counts.
    pub async fn counts(&self) -> MigrationResult<ProgressCounts> {
        let table = self.table.clone();
        self.db
            .call(move |conn| ProgressCounts::query(conn, &table))
            .await
            .map_err(|source| MigrationError::Progress {
                table: self.table.table().to_string(),
                source,
            })
    }

    /// Fraction of rows with a key id; 1.0 for an empty table.
    pub async fn progress(&self) -> MigrationResult<f64> {
        Ok(self.counts().await?.fraction())
    }

    /// Encrypts the next batch of plaintext rows with the current key.
    ///
    /// Every value is decrypted again right after encryption and compared with
    /// the original; a mismatch or a failed key call fails the batch before
    /// anything is written.
    pub async fn up(&self) -> MigrationResult<BatchOutcome> {
        let Some(key) = self.keys.current() else {
            warn!(table = self.table.table(), "no encryption key configured; skipping batch");
            return Ok(BatchOutcome::skipped(Direction::Up, SkipReason::NoKey));
        };
        let key_id = key
            .version()
            .await
            .map_err(self.key_lookup_error(Direction::Up))?
            .to_json();

        let rows = self.select(Direction::Up).await?;
        debug!(
            table = self.table.table(),
            rows = rows.len(),
            key_id = %key_id,
            "selected plaintext rows"
        );

        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let mut new_values = Vec::with_capacity(row.values.len());
            for (column, value) in self.table.value_columns().iter().zip(&row.values) {
                new_values.push(self.encrypt_value(key, &key_id, row.id, column, value).await?);
            }
            updates.push(RowUpdate {
                id: row.id,
                old_values: row.values,
                old_key_id: row.key_id,
                new_values,
                new_key_id: Some(key_id.clone()),
            });
        }

        self.write(Direction::Up, updates).await
    }

    /// Decrypts the next batch of encrypted rows, each with the key named by
    /// its own key id. Does nothing unless `allow_decrypt` is set.
    pub async fn down(&self) -> MigrationResult<BatchOutcome> {
        if !self.config.allow_decrypt {
            warn!(
                table = self.table.table(),
                "decryption is disabled; refusing to write plaintext"
            );
            return Ok(BatchOutcome::skipped(
                Direction::Down,
                SkipReason::DecryptDisabled,
            ));
        }

        let rows = self.select(Direction::Down).await?;
        debug!(
            table = self.table.table(),
            rows = rows.len(),
            "selected encrypted rows"
        );

        let mut resolved: HashMap<String, Arc<dyn Key>> = HashMap::new();
        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let key_id = row.key_id.clone().unwrap_or_default();
            let key = match resolved.get(&key_id) {
                Some(key) => Arc::clone(key),
                None => {
                    let key = self
                        .keys
                        .resolve(&key_id)
                        .await
                        .map_err(self.key_lookup_error(Direction::Down))?
                        .ok_or_else(|| MigrationError::UnknownKey {
                            table: self.table.table().to_string(),
                            row: row.id,
                            key_id: key_id.clone(),
                        })?;
                    resolved.insert(key_id.clone(), Arc::clone(&key));
                    key
                }
            };

            let mut new_values = Vec::with_capacity(row.values.len());
            for (column, value) in self.table.value_columns().iter().zip(&row.values) {
                new_values.push(
                    self.decrypt_value(&key, &key_id, row.id, column, value)
                        .await?,
                );
            }
            updates.push(RowUpdate {
                id: row.id,
                old_values: row.values,
                old_key_id: row.key_id,
                new_values,
                new_key_id: None,
            });
        }

        self.write(Direction::Down, updates).await
    }

    async fn encrypt_value(
        &self,
        key: &Arc<dyn Key>,
        key_id: &str,
        row: i64,
        column: &str,
        value: &Value,
    ) -> MigrationResult<Value> {
        let key_error = |source| MigrationError::Key {
            table: self.table.table().to_string(),
            direction: Direction::Up,
            row,
            column: column.to_string(),
            source,
        };
        let stored = codec::value_from_sql(value.clone())
            .map_err(|source| self.invalid_value(row, column, source))?;
        let Some(mut plain) = codec::decode_column(stored, None, None) else {
            return Ok(Value::Null);
        };

        let plaintext = plain.decrypt().await.map_err(key_error)?;
        let ciphertext = key.encrypt(plaintext.as_bytes()).await.map_err(key_error)?;

        // Read the ciphertext back exactly the way stores will.
        let mut check = Encryptable::encrypted(ciphertext.clone(), key_id, Some(Arc::clone(key)));
        let roundtrip = check.decrypt().await.map_err(key_error)?;
        if roundtrip != plaintext {
            return Err(MigrationError::InvalidRoundTrip {
                table: self.table.table().to_string(),
                row,
                column: column.to_string(),
            });
        }
        Ok(codec::value_to_sql(ciphertext))
    }

    async fn decrypt_value(
        &self,
        key: &Arc<dyn Key>,
        key_id: &str,
        row: i64,
        column: &str,
        value: &Value,
    ) -> MigrationResult<Value> {
        let stored = codec::value_from_sql(value.clone())
            .map_err(|source| self.invalid_value(row, column, source))?;
        let Some(mut encrypted) = codec::decode_column(
            stored,
            Some(key_id),
            Some(Arc::clone(key)),
        ) else {
            return Ok(Value::Null);
        };
        let plaintext = encrypted
            .decrypt()
            .await
            .map_err(|source| MigrationError::Key {
                table: self.table.table().to_string(),
                direction: Direction::Down,
                row,
                column: column.to_string(),
                source,
            })?;
        Ok(Value::Text(plaintext))
    }

    async fn select(&self, direction: Direction) -> MigrationResult<Vec<SelectedRow>> {
        let sql = self.select_sql(direction);
        let limit = i64::try_from(self.config.batch_size).unwrap_or(i64::MAX);
        let width = self.table.value_columns().len();
        self.db
            .call(move |conn| select_rows(conn, &sql, limit, width))
            .await
            .map_err(self.batch_error(direction))
    }

    fn key_lookup_error(&self, direction: Direction) -> impl Fn(CryptoError) -> MigrationError + '_ {
        move |source| MigrationError::KeyLookup {
            table: self.table.table().to_string(),
            direction,
            source,
        }
    }

    fn batch_error(&self, direction: Direction) -> impl Fn(DbError) -> MigrationError + '_ {
        move |source| MigrationError::Batch {
            table: self.table.table().to_string(),
            direction,
            source,
        }
    }

    fn invalid_value(&self, row: i64, column: &str, source: DbError) -> MigrationError {
        MigrationError::InvalidValue {
            table: self.table.table().to_string(),
            row,
            column: column.to_string(),
            source,
        }
    }

    fn select_sql(&self, direction: Direction) -> String {
        let key_id = self.table.key_id_column();
        let predicate = match direction {
            Direction::Up => format!("({key_id} IS NULL OR {key_id} = '')"),
            Direction::Down => format!("({key_id} IS NOT NULL AND {key_id} != '')"),
        };
        format!(
            "SELECT {id}, {values}, {key_id} FROM {table} WHERE {predicate} ORDER BY {id} ASC LIMIT ?1",
            id = self.table.id_column(),
            values = self.table.value_columns().join(", "),
            table = self.table.table(),
        )
    }

    /// `UPDATE` guarded by the row's previous key id and values.
    fn update_sql(&self) -> String {
        let columns = self.table.value_columns();
        let assignments = columns
            .iter()
            .map(|column| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let guards = columns
            .iter()
            .map(|column| format!(" AND {column} IS ?"))
            .collect::<String>();
        format!(
            "UPDATE {table} SET {assignments}, {key_id} = ? WHERE {id} = ? AND {key_id} IS ?{guards}",
            table = self.table.table(),
            key_id = self.table.key_id_column(),
            id = self.table.id_column(),
        )
    }

    async fn write(
        &self,
        direction: Direction,
        updates: Vec<RowUpdate>,
    ) -> MigrationResult<BatchOutcome> {
        let selected = updates.len();
        if updates.is_empty() {
            return Ok(BatchOutcome {
                direction,
                selected,
                rows_affected: 0,
                skipped: None,
            });
        }

        let sql = self.update_sql();
        let rows_affected = self
            .db
            .call(move |conn| write_rows(conn, &sql, updates))
            .await
            .map_err(self.batch_error(direction))?;

        if rows_affected < selected {
            warn!(
                table = self.table.table(),
                %direction,
                selected,
                rows_affected,
                "rows changed concurrently were left for a later batch"
            );
        }
        info!(
            migration = %self.id,
            table = self.table.table(),
            %direction,
            rows_affected,
            "committed batch"
        );
        Ok(BatchOutcome {
            direction,
            selected,
            rows_affected,
            skipped: None,
        })
    }
}

fn select_rows(
    conn: &mut Connection,
    sql: &str,
    limit: i64,
    width: usize,
) -> DbResult<Vec<SelectedRow>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([limit])?;
    let mut selected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            values.push(row.get::<_, Value>(1 + index)?);
        }
        selected.push(SelectedRow {
            id: row.get(0)?,
            values,
            key_id: row.get(1 + width)?,
        });
    }
    Ok(selected)
}

fn write_rows(conn: &mut Connection, sql: &str, updates: Vec<RowUpdate>) -> DbResult<usize> {
    let tx = conn.transaction()?;
    let mut rows_affected = 0;
    {
        let mut stmt = tx.prepare(sql)?;
        for update in updates {
            let new_key_id = update.new_key_id.map_or(Value::Null, Value::Text);
            let old_key_id = update.old_key_id.map_or(Value::Null, Value::Text);
            let params = update
                .new_values
                .into_iter()
                .chain([new_key_id, Value::Integer(update.id), old_key_id])
                .chain(update.old_values);
            rows_affected += stmt.execute(params_from_iter(params))?;
        }
    }
    tx.commit()?;
    Ok(rows_affected)
}

#[async_trait]
impl OutOfBandMigration for EncryptionMigrator {
    fn id(&self) -> &str {
        &self.id
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn progress(&self) -> MigrationResult<f64> {
        EncryptionMigrator::progress(self).await
    }

    async fn up(&self) -> MigrationResult<BatchOutcome> {
        EncryptionMigrator::up(self).await
    }

    async fn down(&self) -> MigrationResult<BatchOutcome> {
        EncryptionMigrator::down(self).await
    }
}

impl std::fmt::Debug for EncryptionMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMigrator")
            .field("id", &self.id)
            .field("table", &self.table.table())
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish()
    }
}

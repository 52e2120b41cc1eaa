use async_trait::async_trait;
use keyshift_crypto::keys::testing::{BadKey, Base64Key};
use keyshift_crypto::{
    CryptoError, CryptoResult, DerivedKey, Key, KeySet, KeyVersion, Secret, SymmetricKey,
    KEY_SIZE,
};
use keyshift_db::Database;
use keyshift_migrate::{
    Direction, EncryptionMigrator, MigrationError, MigratorConfig, OutOfBandMigration,
    SkipReason,
};
use keyshift_store::webhooks::webhooks_table;
use keyshift_store::{EncryptedTable, NewWebhook, WebhookStore};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type RawRow = (i64, Vec<u8>, Option<Vec<u8>>, Option<String>);

fn config(batch_size: usize, allow_decrypt: bool) -> MigratorConfig {
    MigratorConfig {
        batch_size,
        allow_decrypt,
        interval_secs: 0,
    }
}

fn migrator(db: &Database, keys: KeySet, batch_size: usize, allow_decrypt: bool) -> EncryptionMigrator {
    EncryptionMigrator::new(
        "webhooks.encryption",
        db.clone(),
        webhooks_table().unwrap(),
        keys,
        config(batch_size, allow_decrypt),
    )
    .unwrap()
}

fn symmetric(name: &str, seed: u8) -> Arc<dyn Key> {
    Arc::new(SymmetricKey::new(name, DerivedKey::from_bytes([seed; KEY_SIZE])))
}

/// Seeds `n` plaintext webhooks; every third one has no secret.
async fn seed(db: &Database, n: usize) {
    let store = WebhookStore::new(db.clone());
    for i in 1..=n {
        store
            .create(NewWebhook {
                name: format!("hook-{i}"),
                url: format!("https://hooks.example.com/{i}"),
                secret: (i % 3 != 0).then(|| format!("secret-{i}")),
            })
            .await
            .unwrap();
    }
}

async fn raw_rows(db: &Database) -> Vec<RawRow> {
    db.call(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, CAST(url AS BLOB), CAST(secret AS BLOB), encryption_key_id FROM webhooks ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<RawRow>, _>>()?;
        Ok(rows)
    })
    .await
    .unwrap()
}

/// Reads every webhook through the store and returns decrypted url/secret.
async fn decrypted(db: &Database, keys: KeySet) -> Vec<(String, Option<String>)> {
    let store = WebhookStore::with_keys(db.clone(), keys);
    let mut out = Vec::new();
    for mut hook in store.list().await.unwrap() {
        let url = hook.url.decrypt().await.unwrap();
        let secret = match hook.secret.as_mut() {
            Some(secret) => Some(secret.decrypt().await.unwrap()),
            None => None,
        };
        out.push((url, secret));
    }
    out
}

fn expected_plaintext(n: usize) -> Vec<(String, Option<String>)> {
    (1..=n)
        .map(|i| {
            (
                format!("https://hooks.example.com/{i}"),
                (i % 3 != 0).then(|| format!("secret-{i}")),
            )
        })
        .collect()
}

/// Sleeps before encrypting, long enough for callers to give up.
struct SlowKey;

#[async_trait]
impl Key for SlowKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Base64Key.encrypt(plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        Base64Key.decrypt(ciphertext).await
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Ok(KeyVersion::new("slow", "", ""))
    }
}

/// Rewrites webhook 1 the first time it is asked to encrypt, standing in for
/// an application write that lands between a batch's read and its write.
struct InterferingKey {
    db: Database,
    fired: AtomicBool,
}

#[async_trait]
impl Key for InterferingKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.db
                .call(|conn| {
                    conn.execute(
                        "UPDATE webhooks SET url = 'https://changed.example.com' WHERE id = 1",
                        [],
                    )?;
                    Ok(())
                })
                .await
                .unwrap();
        }
        Base64Key.encrypt(plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        Base64Key.decrypt(ciphertext).await
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Base64Key.version().await
    }
}

/// Encrypts fine; the key service is down for every decrypt.
struct DecryptUnavailableKey;

#[async_trait]
impl Key for DecryptUnavailableKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Base64Key.encrypt(plaintext).await
    }

    async fn decrypt(&self, _ciphertext: &[u8]) -> CryptoResult<Secret> {
        Err(CryptoError::Remote("decrypt returned 503 Service Unavailable".to_string()))
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Base64Key.version().await
    }
}

/// The key service cannot even report the key version.
struct VersionUnavailableKey;

#[async_trait]
impl Key for VersionUnavailableKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Base64Key.encrypt(plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        Base64Key.decrypt(ciphertext).await
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Err(CryptoError::Remote("read key returned 503 Service Unavailable".to_string()))
    }
}

/// Behaves like `Base64Key` except that decrypt call number `garble_at`
/// (1-based) returns the wrong plaintext.
struct GarbleNthDecryptKey {
    garble_at: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Key for GarbleNthDecryptKey {
    async fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Base64Key.encrypt(plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Secret> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.garble_at {
            return Ok(Secret::new("garbage"));
        }
        Base64Key.decrypt(ciphertext).await
    }

    async fn version(&self) -> CryptoResult<KeyVersion> {
        Base64Key.version().await
    }
}

// ── Example scenario ────────────────────────────────────────────

#[tokio::test]
async fn ten_rows_batch_of_two_up_then_down() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 10).await;
    let keys = KeySet::single(Arc::new(Base64Key));

    let up = migrator(&db, keys.clone(), 2, false);
    assert_eq!(up.progress().await.unwrap(), 0.0);

    let outcome = up.up().await.unwrap();
    assert_eq!(outcome.direction, Direction::Up);
    assert_eq!(outcome.rows_affected, 2);
    assert_eq!(up.progress().await.unwrap(), 0.2);

    for _ in 0..4 {
        assert_eq!(up.up().await.unwrap().rows_affected, 2);
    }
    assert_eq!(up.progress().await.unwrap(), 1.0);

    let sixth = up.up().await.unwrap();
    assert_eq!(sixth.rows_affected, 0);
    assert!(sixth.is_exhausted());
    assert_eq!(up.progress().await.unwrap(), 1.0);

    let down = migrator(&db, keys.clone(), 2, true);
    assert_eq!(down.down().await.unwrap().rows_affected, 2);
    assert_eq!(down.progress().await.unwrap(), 0.8);
    for _ in 0..4 {
        down.down().await.unwrap();
    }
    assert_eq!(down.progress().await.unwrap(), 0.0);
    assert!(down.down().await.unwrap().is_exhausted());

    assert_eq!(decrypted(&db, KeySet::empty()).await, expected_plaintext(10));
}

#[tokio::test]
async fn up_selects_rows_in_id_order() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 5).await;
    let up = migrator(&db, KeySet::single(Arc::new(Base64Key)), 2, false);
    up.up().await.unwrap();

    let migrated: Vec<i64> = raw_rows(&db)
        .await
        .into_iter()
        .filter(|(_, _, _, key_id)| key_id.is_some())
        .map(|(id, ..)| id)
        .collect();
    assert_eq!(migrated, vec![1, 2]);
}

#[tokio::test]
async fn migrated_rows_hold_ciphertext_and_key_id() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 3).await;
    let key = symmetric("hooks", 1);
    let key_id = key.version().await.unwrap().to_json();
    let keys = KeySet::single(key);
    let up = migrator(&db, keys.clone(), 10, false);
    assert_eq!(up.up().await.unwrap().rows_affected, 3);

    for (_, url, secret, stored_key_id) in raw_rows(&db).await {
        assert!(!String::from_utf8_lossy(&url).contains("hooks.example.com"));
        if let Some(secret) = secret {
            assert!(!String::from_utf8_lossy(&secret).contains("secret-"));
        }
        assert_eq!(stored_key_id.as_deref(), Some(key_id.as_str()));
    }
    assert_eq!(decrypted(&db, keys).await, expected_plaintext(3));
}

// ── Progress ────────────────────────────────────────────────────

#[tokio::test]
async fn empty_table_is_fully_migrated() {
    let db = Database::open_in_memory().unwrap();
    let m = migrator(&db, KeySet::single(Arc::new(Base64Key)), 2, true);
    assert_eq!(m.progress().await.unwrap(), 1.0);
    assert!(m.up().await.unwrap().is_exhausted());
    assert!(m.down().await.unwrap().is_exhausted());
    assert_eq!(m.progress().await.unwrap(), 1.0);
}

#[tokio::test]
async fn plaintext_inserts_lower_progress_until_migrated() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 2).await;
    let keys = KeySet::single(Arc::new(Base64Key));
    let m = migrator(&db, keys.clone(), 10, false);
    m.up().await.unwrap();
    assert_eq!(m.progress().await.unwrap(), 1.0);

    seed(&db, 2).await;
    assert_eq!(m.progress().await.unwrap(), 0.5);

    // Writers holding the key insert rows that are already migrated.
    WebhookStore::with_keys(db.clone(), keys)
        .create(NewWebhook {
            name: "keyed".into(),
            url: "https://hooks.example.com/keyed".into(),
            secret: None,
        })
        .await
        .unwrap();
    assert_eq!(m.progress().await.unwrap(), 0.6);

    m.up().await.unwrap();
    assert_eq!(m.progress().await.unwrap(), 1.0);
}

// ── Safety ──────────────────────────────────────────────────────

#[tokio::test]
async fn down_without_allow_decrypt_changes_nothing() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 4).await;
    let keys = KeySet::single(Arc::new(Base64Key));
    migrator(&db, keys.clone(), 10, false).up().await.unwrap();
    let before = raw_rows(&db).await;

    let down = migrator(&db, keys, 2, false);
    for _ in 0..3 {
        let outcome = down.down().await.unwrap();
        assert_eq!(outcome.rows_affected, 0);
        assert_eq!(outcome.skipped, Some(SkipReason::DecryptDisabled));
    }
    assert_eq!(down.progress().await.unwrap(), 1.0);
    assert_eq!(raw_rows(&db).await, before);
}

#[tokio::test]
async fn up_without_key_is_noop() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 4).await;
    let before = raw_rows(&db).await;

    let m = migrator(&db, KeySet::empty(), 2, false);
    let outcome = m.up().await.unwrap();
    assert_eq!(outcome.rows_affected, 0);
    assert_eq!(outcome.skipped, Some(SkipReason::NoKey));
    assert!(!outcome.is_exhausted());
    assert_eq!(m.progress().await.unwrap(), 0.0);
    assert_eq!(raw_rows(&db).await, before);
}

#[tokio::test]
async fn broken_key_aborts_whole_batch() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 4).await;
    let before = raw_rows(&db).await;

    let m = migrator(&db, KeySet::single(Arc::new(BadKey)), 4, false);
    let err = m.up().await.unwrap_err();
    match &err {
        MigrationError::InvalidRoundTrip { table, row, column } => {
            assert_eq!(table, "webhooks");
            assert_eq!(*row, 1);
            assert_eq!(column, "url");
        }
        other => panic!("expected round-trip error, got {other:?}"),
    }
    assert!(err.to_string().contains("invalid encryption round-trip"));
    assert_eq!(raw_rows(&db).await, before);
    assert_eq!(m.progress().await.unwrap(), 0.0);
}

#[tokio::test]
async fn round_trip_failure_midway_writes_nothing() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 4).await;
    let before = raw_rows(&db).await;

    // Row 1 verifies url and secret (decrypts 1 and 2); row 2's url is the third.
    let key = GarbleNthDecryptKey {
        garble_at: 3,
        calls: AtomicU32::new(0),
    };
    let m = migrator(&db, KeySet::single(Arc::new(key)), 4, false);
    let err = m.up().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::InvalidRoundTrip { row: 2, ref column, .. } if column == "url"
    ));

    let after = raw_rows(&db).await;
    assert!(after.iter().all(|row| row.3.is_none()));
    assert_eq!(after, before);
}

#[tokio::test]
async fn unavailable_key_service_during_check_is_not_a_round_trip_error() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 2).await;
    let before = raw_rows(&db).await;

    let m = migrator(&db, KeySet::single(Arc::new(DecryptUnavailableKey)), 2, false);
    let err = m.up().await.unwrap_err();
    match &err {
        MigrationError::Key {
            table,
            direction,
            row,
            column,
            source,
        } => {
            assert_eq!(table, "webhooks");
            assert_eq!(*direction, Direction::Up);
            assert_eq!(*row, 1);
            assert_eq!(column, "url");
            assert!(matches!(source, CryptoError::Remote(_)));
        }
        other => panic!("expected key error, got {other:?}"),
    }
    assert!(err.to_string().contains("503"));
    assert_eq!(raw_rows(&db).await, before);
}

#[tokio::test]
async fn key_version_failure_names_table_and_direction() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 1).await;

    let m = migrator(&db, KeySet::single(Arc::new(VersionUnavailableKey)), 2, false);
    let err = m.up().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::KeyLookup {
            direction: Direction::Up,
            source: CryptoError::Remote(_),
            ..
        }
    ));
    let message = err.to_string();
    assert!(message.starts_with("up webhooks"), "{message}");
    assert!(message.contains("503"), "{message}");
}

#[tokio::test]
async fn database_failure_names_table_and_direction() {
    let db = Database::open_in_memory().unwrap();
    let table = EncryptedTable::new("missing", "id", ["value"], "key_id").unwrap();
    let m = EncryptionMigrator::new(
        "missing.encryption",
        db,
        table,
        KeySet::single(Arc::new(Base64Key)),
        config(2, true),
    )
    .unwrap();

    let err = m.up().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Batch {
            direction: Direction::Up,
            ..
        }
    ));
    assert!(err.to_string().starts_with("up missing"));

    let err = m.down().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Batch {
            direction: Direction::Down,
            ..
        }
    ));

    let err = m.progress().await.unwrap_err();
    assert!(matches!(err, MigrationError::Progress { ref table, .. } if table == "missing"));
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let db = Database::open_in_memory().unwrap();
    let result = EncryptionMigrator::new(
        "webhooks.encryption",
        db,
        webhooks_table().unwrap(),
        KeySet::empty(),
        config(0, false),
    );
    assert!(matches!(result, Err(MigrationError::Config(_))));
}

// ── Key history ─────────────────────────────────────────────────

#[tokio::test]
async fn down_after_rotation_uses_previous_key() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 6).await;
    let old = symmetric("hooks-2025", 1);
    migrator(&db, KeySet::single(Arc::clone(&old)), 10, false)
        .up()
        .await
        .unwrap();

    let rotated = KeySet::new(Some(symmetric("hooks-2026", 2)), vec![old]);
    let down = migrator(&db, rotated, 4, true);
    assert_eq!(down.down().await.unwrap().rows_affected, 4);
    assert_eq!(down.down().await.unwrap().rows_affected, 2);
    assert_eq!(down.progress().await.unwrap(), 0.0);
    assert_eq!(decrypted(&db, KeySet::empty()).await, expected_plaintext(6));
}

#[tokio::test]
async fn down_with_unknown_key_fails_without_writing() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 3).await;
    migrator(&db, KeySet::single(symmetric("hooks", 1)), 10, false)
        .up()
        .await
        .unwrap();
    let before = raw_rows(&db).await;

    let down = migrator(&db, KeySet::single(symmetric("other", 1)), 10, true);
    let err = down.down().await.unwrap_err();
    assert!(matches!(err, MigrationError::UnknownKey { row: 1, .. }));
    assert_eq!(raw_rows(&db).await, before);
}

#[tokio::test]
async fn down_with_wrong_material_fails_loudly() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 2).await;
    migrator(&db, KeySet::single(symmetric("hooks", 1)), 10, false)
        .up()
        .await
        .unwrap();
    let before = raw_rows(&db).await;

    // Same name, different material: resolves by name, then fails to decrypt.
    let down = migrator(&db, KeySet::single(symmetric("hooks", 9)), 10, true);
    let err = down.down().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Key {
            direction: Direction::Down,
            ..
        }
    ));
    assert_eq!(raw_rows(&db).await, before);
}

// ── NULL values ─────────────────────────────────────────────────

#[tokio::test]
async fn null_values_stay_null() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 3).await;
    let keys = KeySet::single(Arc::new(Base64Key));

    migrator(&db, keys.clone(), 10, false).up().await.unwrap();
    let rows = raw_rows(&db).await;
    assert_eq!(rows[2].2, None);
    assert!(rows[2].3.is_some());

    migrator(&db, keys, 10, true).down().await.unwrap();
    let rows = raw_rows(&db).await;
    assert_eq!(rows[2].2, None);
    assert_eq!(rows[2].3, None);
}

#[tokio::test]
async fn single_column_table() {
    let db = Database::open_in_memory().unwrap();
    db.call(|conn| {
        conn.execute_batch(
            "CREATE TABLE tokens (token_id INTEGER PRIMARY KEY, token BLOB, key_version TEXT);
             INSERT INTO tokens (token) VALUES ('a'), ('b'), (NULL);",
        )?;
        Ok(())
    })
    .await
    .unwrap();
    let table = EncryptedTable::new("tokens", "token_id", ["token"], "key_version").unwrap();
    let keys = KeySet::single(Arc::new(Base64Key));
    let m = EncryptionMigrator::new("tokens.encryption", db.clone(), table, keys, config(2, true))
        .unwrap();

    m.up().await.unwrap();
    m.up().await.unwrap();
    assert_eq!(m.progress().await.unwrap(), 1.0);
    let stored: Vec<Option<String>> = db
        .call(|conn| {
            let mut stmt = conn.prepare("SELECT token FROM tokens ORDER BY token_id")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .unwrap();
    assert_eq!(stored, vec![Some("YQ==".to_string()), Some("Yg==".to_string()), None]);
}

// ── Concurrency ─────────────────────────────────────────────────

async fn drive_up(m: &EncryptionMigrator) -> usize {
    let mut total = 0;
    loop {
        let outcome = m.up().await.unwrap();
        total += outcome.rows_affected;
        if outcome.is_exhausted() {
            return total;
        }
    }
}

#[tokio::test]
async fn concurrent_migrators_converge() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 10).await;
    let keys = KeySet::single(Arc::new(Base64Key));
    let a = migrator(&db, keys.clone(), 3, false);
    let b = migrator(&db, keys.clone(), 3, false);

    let (wrote_a, wrote_b) = tokio::join!(drive_up(&a), drive_up(&b));
    assert_eq!(wrote_a + wrote_b, 10);
    assert_eq!(a.progress().await.unwrap(), 1.0);
    assert_eq!(decrypted(&db, keys).await, expected_plaintext(10));
}

#[tokio::test]
async fn concurrent_write_is_not_overwritten() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 3).await;
    let key = InterferingKey {
        db: db.clone(),
        fired: AtomicBool::new(false),
    };
    let keys = KeySet::single(Arc::new(key));
    let m = migrator(&db, keys.clone(), 2, false);

    let first = m.up().await.unwrap();
    assert_eq!(first.selected, 2);
    assert_eq!(first.rows_affected, 1);
    let rows = raw_rows(&db).await;
    assert_eq!(rows[0].1, b"https://changed.example.com");
    assert_eq!(rows[0].3, None);

    while !m.up().await.unwrap().is_exhausted() {}
    assert_eq!(m.progress().await.unwrap(), 1.0);
    let values = decrypted(&db, keys).await;
    assert_eq!(values[0].0, "https://changed.example.com");
}

#[tokio::test]
async fn cancelled_batch_writes_nothing() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 4).await;
    let before = raw_rows(&db).await;
    let m = migrator(&db, KeySet::single(Arc::new(SlowKey)), 4, false);

    let result = tokio::time::timeout(Duration::from_millis(50), m.up()).await;
    assert!(result.is_err());
    assert_eq!(raw_rows(&db).await, before);
    assert_eq!(m.progress().await.unwrap(), 0.0);
}

// ── Trait ───────────────────────────────────────────────────────

#[tokio::test]
async fn usable_as_out_of_band_migration() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, 2).await;
    let m: Box<dyn OutOfBandMigration> =
        Box::new(migrator(&db, KeySet::single(Arc::new(Base64Key)), 1, true));
    assert_eq!(m.id(), "webhooks.encryption");
    assert_eq!(m.interval(), Duration::ZERO);
    m.up().await.unwrap();
    assert_eq!(m.progress().await.unwrap(), 0.5);
    m.down().await.unwrap();
    assert_eq!(m.progress().await.unwrap(), 0.0);
}

//! SQLite-backed secret store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};

use super::encryption;

/// Durable key/value persistence of credential material, scoped per source.
///
/// # Schema
/// ```sql
/// CREATE TABLE secrets (
///     source_id  TEXT NOT NULL,
///     key        TEXT NOT NULL,
///     value      TEXT NOT NULL,  -- sealed: base64(nonce):base64(ciphertext)
///     updated_at TEXT NOT NULL,
///     PRIMARY KEY (source_id, key)
/// );
/// ```
///
/// # Thread safety
/// The connection is wrapped in a `Mutex`, which also serializes writes per
/// `source_id` as the concurrency model requires.
pub struct SecretsStore {
    conn: Mutex<Connection>,
    master_key: Vec<u8>,
}

impl SecretsStore {
    /// Opens or creates the store. `master_key_base64` must decode to 32
    /// bytes; typically it comes straight from an environment variable.
    pub fn open<P: AsRef<Path>>(db_path: P, master_key_base64: &str) -> Result<Self> {
        let master_key =
            encryption::validate_key(master_key_base64).context("invalid master key")?;
        let conn = Connection::open(db_path).context("failed to open secrets database")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                source_id  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source_id, key)
            )
            "#,
            [],
        )
        .context("failed to create secrets table")?;
        Ok(Self {
            conn: Mutex::new(conn),
            master_key,
        })
    }

    /// Returns the decrypted value for `(source_id, key)`, if present.
    pub fn get(&self, source_id: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT value FROM secrets WHERE source_id = ?1 AND key = ?2")
            .context("failed to prepare secret lookup")?;
        let sealed: Option<String> = stmt
            .query_row(params![source_id, key], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to query secret")?;
        sealed
            .map(|s| encryption::unseal(&s, &self.master_key))
            .transpose()
    }

    /// Stores or replaces a value (upsert).
    pub fn put(&self, source_id: &str, key: &str, value: &str) -> Result<()> {
        let sealed = encryption::seal(value, &self.master_key)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO secrets (source_id, key, value, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(source_id, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![source_id, key, sealed, now],
            )
            .context("failed to store secret")?;
        Ok(())
    }

    /// Removes a single entry. Returns whether anything was deleted.
    pub fn delete(&self, source_id: &str, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM secrets WHERE source_id = ?1 AND key = ?2",
                params![source_id, key],
            )
            .context("failed to delete secret")?;
        Ok(affected > 0)
    }

    /// All decrypted entries for a source. Used by the executor's secrets
    /// scope and by OAuth handlers looking up client credentials.
    pub fn get_all(&self, source_id: &str) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, value FROM secrets WHERE source_id = ?1")
            .context("failed to prepare secret scan")?;
        let rows = stmt
            .query_map(params![source_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to scan secrets")?;

        let mut entries = HashMap::new();
        for row in rows {
            let (key, sealed) = row.context("failed to read secret row")?;
            entries.insert(key, encryption::unseal(&sealed, &self.master_key)?);
        }
        Ok(entries)
    }

    /// The keys stored for a source, without decrypting anything.
    pub fn keys(&self, source_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key FROM secrets WHERE source_id = ?1 ORDER BY key")
            .context("failed to prepare key listing")?;
        let keys = stmt
            .query_map(params![source_id], |row| row.get(0))
            .context("failed to list keys")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("failed to read key rows")?;
        Ok(keys)
    }

    /// Cascade deletion of everything a source ever stored. Returns the
    /// number of removed entries.
    pub fn delete_source(&self, source_id: &str) -> Result<usize> {
        let affected = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM secrets WHERE source_id = ?1", params![source_id])
            .context("failed to delete source secrets")?;
        Ok(affected)
    }
}

//! Encrypted credential storage backed by SQLite.
//!
//! One row per (user, source) pair. The credential payload is stored as a
//! sealed JSON blob; everything else (timestamps, the ingestion watermark) is
//! plaintext metadata.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{encryption, DataSourceCredentials, DataSourceType};
use crate::error::{Error, Result};

/// Metadata for a stored credential record (the payload itself stays sealed).
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialRecord {
    pub user_id: String,
    pub source: DataSourceType,
    /// When this source was last successfully ingested for this user.
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted credential storage.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     source TEXT NOT NULL,
///     payload TEXT NOT NULL,           -- Sealed JSON blob
///     payload_iv TEXT NOT NULL,        -- IV for payload
///     last_ingested_at TEXT,           -- ISO 8601 timestamp (optional)
///     created_at TEXT NOT NULL,        -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL,        -- ISO 8601 timestamp
///     UNIQUE(user_id, source)
/// );
/// ```
///
/// # Thread Safety
/// The connection is wrapped in a Mutex; SQLite itself runs in serialized
/// mode, and every mutation is a single-statement upsert.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    encryption_key: Vec<u8>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key_bytes = encryption::validate_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open credentials database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_iv TEXT NOT NULL,
                last_ingested_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, source)
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_source ON credentials(source)",
            [],
        )
        .context("Failed to create source index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    /// Stores credentials for a user and data source (upsert).
    ///
    /// A second store for the same (user, source) pair replaces the payload
    /// in place; `created_at` and `last_ingested_at` are preserved.
    ///
    /// # Errors
    /// * `Error::Validation` - `source` is not a recognized data source tag,
    ///   or the payload shape does not match it
    pub fn store(
        &self,
        user_id: &str,
        source: &str,
        credentials: &DataSourceCredentials,
    ) -> Result<CredentialRecord> {
        let source: DataSourceType = source.parse()?;
        if credentials.source_type() != source {
            return Err(Error::Validation(format!(
                "credential payload is shaped for '{}', not '{}'",
                credentials.source_type(),
                source
            )));
        }

        let plaintext =
            serde_json::to_string(credentials).context("Failed to serialize credentials")?;
        let sealed = encryption::seal(&plaintext, &self.encryption_key)
            .context("Failed to encrypt credentials")?;

        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id, source, payload, payload_iv,
                    last_ingested_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)
                ON CONFLICT(user_id, source) DO UPDATE SET
                    payload = excluded.payload,
                    payload_iv = excluded.payload_iv,
                    updated_at = excluded.updated_at
                "#,
                params![user_id, source.as_str(), sealed.ciphertext, sealed.iv, now],
            )
            .context("Failed to store credentials")?;

        debug!(user_id = %user_id, source = %source, "Stored credentials");

        self.record(user_id, source)?
            .ok_or_else(|| anyhow!("credential record missing after upsert").into())
    }

    /// Retrieves and decrypts credentials for a user and data source.
    ///
    /// Returns `Ok(None)` if no record exists.
    pub fn get(
        &self,
        user_id: &str,
        source: DataSourceType,
    ) -> Result<Option<DataSourceCredentials>> {
        let sealed = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT payload, payload_iv FROM credentials WHERE user_id = ?1 AND source = ?2",
                params![user_id, source.as_str()],
                |row| {
                    Ok(encryption::Sealed {
                        ciphertext: row.get(0)?,
                        iv: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query credentials")?
        };

        let Some(sealed) = sealed else {
            return Ok(None);
        };

        let plaintext = encryption::open(&sealed, &self.encryption_key)
            .context("Failed to decrypt credentials")?;
        let credentials: DataSourceCredentials =
            serde_json::from_str(&plaintext).context("Failed to deserialize credentials")?;

        if credentials.source_type() != source {
            return Err(anyhow!(
                "credential payload for ({}, {}) has mismatched shape",
                user_id,
                source
            )
            .into());
        }

        Ok(Some(credentials))
    }

    /// Returns the record metadata for a (user, source) pair, if any.
    pub fn record(&self, user_id: &str, source: DataSourceType) -> Result<Option<CredentialRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT last_ingested_at, created_at, updated_at
                FROM credentials
                WHERE user_id = ?1 AND source = ?2
                "#,
                params![user_id, source.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query credential record")?;

        let Some((last_ingested_at, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(CredentialRecord {
            user_id: user_id.to_string(),
            source,
            last_ingested_at: last_ingested_at
                .map(|s| parse_timestamp(&s))
                .transpose()?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    /// Enumerates all users with stored credentials for a data source.
    ///
    /// Drives the ingestion scheduler's fan-out; ordered by user id so passes
    /// are deterministic.
    pub fn users_with_source(&self, source: DataSourceType) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT user_id FROM credentials WHERE source = ?1 ORDER BY user_id")
            .context("Failed to prepare user enumeration query")?;

        let users = stmt
            .query_map(params![source.as_str()], |row| row.get(0))
            .context("Failed to enumerate users")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("Failed to read user rows")?;

        Ok(users)
    }

    /// Bumps `last_ingested_at` to now for a (user, source) pair.
    ///
    /// Idempotent; a no-op when no record exists.
    pub fn mark_ingested(&self, user_id: &str, source: DataSourceType) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET last_ingested_at = ?1 WHERE user_id = ?2 AND source = ?3",
                params![now, user_id, source.as_str()],
            )
            .context("Failed to update ingestion watermark")?;
        Ok(())
    }

    /// Lists the data sources a user has connected.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<DataSourceType>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT source FROM credentials WHERE user_id = ?1 ORDER BY source")
            .context("Failed to prepare source listing query")?;

        let tags = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))
            .context("Failed to list sources")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("Failed to read source rows")?;

        tags.iter().map(|t| t.parse()).collect()
    }

    /// Deletes credentials for a user and data source (administrative action;
    /// nothing in the ingestion path calls this).
    ///
    /// Returns true if a record was removed.
    pub fn delete(&self, user_id: &str, source: DataSourceType) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE user_id = ?1 AND source = ?2",
                params![user_id, source.as_str()],
            )
            .context("Failed to delete credentials")?;

        Ok(rows > 0)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse stored timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

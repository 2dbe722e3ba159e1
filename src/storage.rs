//! `SQLite` storage for harvested records.
//!
//! One `messages` table keyed by `(channel_id, message_id)`, written with
//! `INSERT OR IGNORE`, plus a `meta` table carrying the schema version.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{HarvestError, Result};
use crate::model::{ChannelId, MessageRecord};
use crate::sink::{AppendOutcome, RecordSink};

const SCHEMA_VERSION: i32 = 1;

fn parse_rfc3339_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// `SQLite` storage manager
pub struct Storage {
    conn: Connection,
    location: Option<PathBuf>,
}

impl Storage {
    /// Open or create the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarvestError::path_error("create directory", parent, e))?;
        }
        let conn = Connection::open(db_path)?;

        // Each commit must reach disk before the ledger marks the message
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let storage = Self {
            conn,
            location: Some(db_path.to_path_buf()),
        };
        storage.migrate()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
        let storage = Self {
            conn,
            location: None,
        };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<()> {
        let current_version = self.get_schema_version();

        if current_version < SCHEMA_VERSION {
            info!(
                "Migrating database from version {} to {}",
                current_version, SCHEMA_VERSION
            );
            self.create_schema()?;
            self.set_schema_version(SCHEMA_VERSION)?;
        }

        Ok(())
    }

    #[must_use]
    pub fn get_schema_version(&self) -> i32 {
        let result: rusqlite::Result<i32> = self.conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| {
                let value: String = row.get(0)?;
                Ok(value.parse().unwrap_or(0))
            },
        );

        // Treat missing schema table as version 0.
        result.unwrap_or_default()
    }

    fn set_schema_version(&self, version: i32) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)",
            params![version.to_string()],
        )?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                channel_id TEXT NOT NULL,
                channel_name TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                sender_id INTEGER,
                sender_name TEXT,
                timestamp TEXT,
                text TEXT,
                raw_text TEXT,
                attachment_name TEXT,
                attachment_size INTEGER,
                extracted_secret TEXT,
                PRIMARY KEY (channel_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_secret
                ON messages(extracted_secret) WHERE extracted_secret IS NOT NULL;
            ",
        )?;
        Ok(())
    }

    /// Fetch a single record by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_record(&self, channel: &ChannelId, message_id: i64) -> Result<Option<MessageRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE channel_id = ?1 AND message_id = ?2"),
                params![channel.as_str(), message_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

const SELECT_RECORD: &str = r"
    SELECT channel_id, channel_name, message_id, sender_id, sender_name, timestamp,
           text, raw_text, attachment_name, attachment_size, extracted_secret
    FROM messages";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        channel_id: ChannelId::new(row.get::<_, String>(0)?),
        channel_name: row.get(1)?,
        message_id: row.get(2)?,
        sender_id: row.get(3)?,
        sender_name: row.get(4)?,
        timestamp: parse_rfc3339_opt(row.get(5)?),
        text: row.get(6)?,
        raw_text: row.get(7)?,
        attachment_name: row.get(8)?,
        attachment_size: row
            .get::<_, Option<i64>>(9)?
            .and_then(|v| u64::try_from(v).ok()),
        extracted_secret: row.get(10)?,
    })
}

impl RecordSink for Storage {
    fn append(&mut self, record: &MessageRecord) -> Result<AppendOutcome> {
        let mut stmt = self.conn.prepare_cached(
            r"
            INSERT OR IGNORE INTO messages
            (channel_id, channel_name, message_id, sender_id, sender_name, timestamp,
             text, raw_text, attachment_name, attachment_size, extracted_secret)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )?;
        let changed = stmt
            .execute(params![
                record.channel_id.as_str(),
                record.channel_name,
                record.message_id,
                record.sender_id,
                record.sender_name,
                record
                    .timestamp
                    .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
                record.text,
                record.raw_text,
                record.attachment_name,
                record
                    .attachment_size
                    .map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
                record.extracted_secret,
            ])
            .map_err(|e| HarvestError::Persistence {
                channel_id: record.channel_id.to_string(),
                message_id: record.message_id,
                reason: e.to_string(),
            })?;

        Ok(if changed == 0 {
            AppendOutcome::AlreadyPresent
        } else {
            AppendOutcome::Inserted
        })
    }

    fn message_ids(&self, channel: &ChannelId) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT message_id FROM messages WHERE channel_id = ? ORDER BY message_id",
        )?;
        let ids = stmt
            .query_map(params![channel.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn records(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RECORD} WHERE channel_id = ? ORDER BY message_id"))?;
        let records = stmt
            .query_map(params![channel.as_str()], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn describe(&self) -> String {
        self.location.as_ref().map_or_else(
            || "sqlite::memory:".to_string(),
            |p| format!("sqlite:{}", p.display()),
        )
    }
}

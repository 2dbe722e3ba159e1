//! Append-only record sinks.
//!
//! Both backends treat `(channel_id, message_id)` as a unique key and
//! silently ignore a second append for the same key, so re-processing a
//! message after a crash never duplicates its record.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::flatfile::CsvSink;
use crate::model::{ChannelId, MessageRecord};
use crate::storage::Storage;

/// Result of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A record with the same key was already stored; nothing was written.
    AlreadyPresent,
}

/// A durable, append-only store of message records.
pub trait RecordSink: Send {
    /// Store `record` unless its key is already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, record: &MessageRecord) -> Result<AppendOutcome>;

    /// Ids of all stored messages of `channel`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn message_ids(&self, channel: &ChannelId) -> Result<Vec<i64>>;

    /// Stored records of `channel`, by ascending message id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn records(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>>;

    /// Total number of stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn count(&self) -> Result<u64>;

    /// Human readable location, for logs.
    fn describe(&self) -> String;
}

/// Sink shared between the harvester and its callers.
pub type SharedSink = Arc<Mutex<dyn RecordSink>>;

/// Wrap a concrete sink for sharing.
pub fn shared<S: RecordSink + 'static>(sink: S) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

/// Which backend to persist records to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackend {
    /// Embedded `SQLite` database.
    #[default]
    Sqlite,
    /// Flat CSV file.
    Csv,
}

impl fmt::Display for SinkBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

impl std::str::FromStr for SinkBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" => Ok(Self::Sqlite),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown sink '{other}' (expected sqlite or csv)")),
        }
    }
}

/// Open the configured backend at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or has an unexpected layout.
pub fn open_sink(backend: SinkBackend, path: &Path) -> Result<SharedSink> {
    Ok(match backend {
        SinkBackend::Sqlite => shared(Storage::open(path)?),
        SinkBackend::Csv => shared(CsvSink::open(path)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(channel: &str, id: i64) -> MessageRecord {
        MessageRecord {
            channel_id: ChannelId::new(channel),
            channel_name: "Test".into(),
            message_id: id,
            sender_id: None,
            sender_name: None,
            timestamp: None,
            text: Some(format!("message {id}")),
            raw_text: None,
            attachment_name: None,
            attachment_size: None,
            extracted_secret: None,
        }
    }

    #[test]
    fn backends_share_insert_or_ignore_semantics() {
        let dir = TempDir::new().unwrap();
        for (backend, file) in [
            (SinkBackend::Sqlite, "out.db"),
            (SinkBackend::Csv, "out.csv"),
        ] {
            let sink = open_sink(backend, &dir.path().join(file)).unwrap();
            let mut guard = sink.lock();
            assert_eq!(guard.append(&record("1", 5)).unwrap(), AppendOutcome::Inserted);
            assert_eq!(
                guard.append(&record("1", 5)).unwrap(),
                AppendOutcome::AlreadyPresent
            );
            assert_eq!(guard.append(&record("2", 5)).unwrap(), AppendOutcome::Inserted);
            assert_eq!(guard.count().unwrap(), 2, "{backend}");
            assert_eq!(guard.message_ids(&ChannelId::new("1")).unwrap(), vec![5]);
        }
    }

    #[test]
    fn backend_parses_from_str() {
        assert_eq!("CSV".parse::<SinkBackend>().unwrap(), SinkBackend::Csv);
        assert_eq!("sqlite".parse::<SinkBackend>().unwrap(), SinkBackend::Sqlite);
        assert!("parquet".parse::<SinkBackend>().is_err());
    }
}

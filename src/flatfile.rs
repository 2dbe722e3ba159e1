//! Flat CSV record sink.
//!
//! RFC 4180 layout: header row once, CRLF line endings, fields quoted when
//! they contain a comma, quote or line break. Keys already in the file are
//! read on open so appends keep insert-or-ignore semantics across runs.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};
use crate::model::{ChannelId, MessageRecord};
use crate::sink::{AppendOutcome, RecordSink};

const LINE_END: &str = "\r\n";

/// Append-only CSV file of message records.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    file: File,
    keys: HashSet<(ChannelId, i64)>,
    /// Length of the file up to the last complete row.
    committed_len: u64,
}

impl CsvSink {
    /// Open or create the CSV file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CsvHeaderMismatch` if an existing file has a different
    /// header, or an IO error if it cannot be read or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| HarvestError::path_error("create directory", parent, e))?;
        }

        let existing = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(HarvestError::path_error("read", &path, e)),
        };

        let mut keys = HashSet::new();
        let needs_header = existing.is_empty();
        if !needs_header {
            let (rows, complete_len) = parse_csv(&existing);
            check_header(&path, rows.first())?;

            if complete_len < existing.len() {
                warn!(
                    path = %path.display(),
                    dropped_bytes = existing.len() - complete_len,
                    "CSV ends with a partial row; truncating it"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| HarvestError::path_error("open", &path, e))?;
                file.set_len(complete_len as u64)
                    .map_err(|e| HarvestError::path_error("truncate", &path, e))?;
            }

            for row in rows.iter().skip(1) {
                match (row.first(), row.get(2).and_then(|id| id.parse::<i64>().ok())) {
                    (Some(channel), Some(id)) => {
                        keys.insert((ChannelId::new(channel.clone()), id));
                    }
                    _ => debug!(path = %path.display(), "Skipping unreadable CSV row"),
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HarvestError::path_error("open", &path, e))?;

        if needs_header {
            let header = MessageRecord::COLUMNS.join(",");
            file.write_all(format!("{header}{LINE_END}").as_bytes())
                .and_then(|()| file.sync_data())
                .map_err(|e| HarvestError::path_error("write header to", &path, e))?;
        }

        let committed_len = file
            .metadata()
            .map_err(|e| HarvestError::path_error("stat", &path, e))?
            .len();

        debug!(path = %path.display(), records = keys.len(), "Opened CSV sink");
        Ok(Self {
            path,
            file,
            keys,
            committed_len,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and sync it, dropping any torn bytes past the last
    /// committed row first.
    fn write_row(&mut self, line: &[u8]) -> std::io::Result<()> {
        let len = self.file.metadata()?.len();
        if len > self.committed_len {
            warn!(
                path = %self.path.display(),
                dropped_bytes = len - self.committed_len,
                "Discarding torn CSV row"
            );
            self.file.set_len(self.committed_len)?;
        } else {
            self.committed_len = len;
        }
        self.file.write_all(line)?;
        self.file.sync_data()
    }

    fn read_rows(&self) -> Result<Vec<Vec<String>>> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| HarvestError::path_error("read", &self.path, e))?;
        let (mut rows, _) = parse_csv(&content);
        if !rows.is_empty() {
            rows.remove(0);
        }
        Ok(rows)
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, record: &MessageRecord) -> Result<AppendOutcome> {
        let key = (record.channel_id.clone(), record.message_id);
        if self.keys.contains(&key) {
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let line = encode_record(record);
        if let Err(e) = self.write_row(line.as_bytes()) {
            // A row is either fully present or absent
            if let Err(undo) = self.file.set_len(self.committed_len) {
                warn!(
                    path = %self.path.display(),
                    error = %undo,
                    "Failed to roll back CSV row"
                );
            }
            return Err(HarvestError::Persistence {
                channel_id: record.channel_id.to_string(),
                message_id: record.message_id,
                reason: e.to_string(),
            });
        }
        self.committed_len += line.len() as u64;
        self.keys.insert(key);
        Ok(AppendOutcome::Inserted)
    }

    fn message_ids(&self, channel: &ChannelId) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .keys
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn records(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>> {
        let mut records: Vec<MessageRecord> = self
            .read_rows()?
            .iter()
            .filter(|row| row.first().map(String::as_str) == Some(channel.as_str()))
            .filter_map(|row| decode_record(row))
            .collect();
        records.sort_by_key(|r| r.message_id);
        Ok(records)
    }

    fn count(&self) -> Result<u64> {
        Ok(self.keys.len() as u64)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

fn check_header(path: &Path, header: Option<&Vec<String>>) -> Result<()> {
    let matches = header.is_some_and(|h| {
        h.len() == MessageRecord::COLUMNS.len()
            && h.iter().zip(MessageRecord::COLUMNS).all(|(a, b)| a == b)
    });
    if matches {
        Ok(())
    } else {
        Err(HarvestError::CsvHeaderMismatch {
            path: path.to_path_buf(),
            found: header.map(|h| h.join(",")).unwrap_or_default(),
        })
    }
}

/// Quote a field when RFC 4180 requires it.
fn escape_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn encode_record(record: &MessageRecord) -> String {
    let fields = [
        record.channel_id.to_string(),
        record.channel_name.clone(),
        record.message_id.to_string(),
        record.sender_id.map(|v| v.to_string()).unwrap_or_default(),
        record.sender_name.clone().unwrap_or_default(),
        record.timestamp.map(format_timestamp).unwrap_or_default(),
        record.text.clone().unwrap_or_default(),
        record.raw_text.clone().unwrap_or_default(),
        record.attachment_name.clone().unwrap_or_default(),
        record
            .attachment_size
            .map(|v| v.to_string())
            .unwrap_or_default(),
        record.extracted_secret.clone().unwrap_or_default(),
    ];
    let mut line = fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str(LINE_END);
    line
}

fn opt(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn decode_record(row: &[String]) -> Option<MessageRecord> {
    let [
        channel_id,
        channel_name,
        message_id,
        sender_id,
        sender_name,
        timestamp,
        text,
        raw_text,
        attachment_name,
        attachment_size,
        extracted_secret,
    ] = row
    else {
        return None;
    };
    Some(MessageRecord {
        channel_id: ChannelId::new(channel_id.clone()),
        channel_name: channel_name.clone(),
        message_id: message_id.parse().ok()?,
        sender_id: sender_id.parse().ok(),
        sender_name: opt(sender_name),
        timestamp: DateTime::parse_from_rfc3339(timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        text: opt(text),
        raw_text: opt(raw_text),
        attachment_name: opt(attachment_name),
        attachment_size: attachment_size.parse().ok(),
        extracted_secret: opt(extracted_secret),
    })
}

/// Parse RFC 4180 text into rows.
///
/// Also returns the byte length of the complete, newline-terminated prefix;
/// anything after it is a partially written row.
fn parse_csv(content: &str) -> (Vec<Vec<String>>, usize) {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut complete_len = 0;

    let mut chars = content.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek().is_some_and(|&(_, next)| next == '"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
                complete_len = i + 1;
            }
            _ => field.push(c),
        }
    }
    (rows, complete_len)
}

//! Durable per-channel record of fully processed message ids.
//!
//! One file per channel, `<dir>/<channel_id>.ids`, holding one decimal id
//! per newline-terminated line. The file is only ever appended to; each
//! append is flushed and synced before `mark_done` returns, so a crash can
//! at worst leave a truncated final line, which is dropped on the next load.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::model::ChannelId;

const IDS_EXTENSION: &str = "ids";
const FAILED_EXTENSION: &str = "failed";

/// Dedup ledger covering every channel under one directory.
#[derive(Debug)]
pub struct Ledger {
    dir: PathBuf,
    seen: HashMap<ChannelId, HashSet<i64>>,
}

impl Ledger {
    /// Open the ledger directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| HarvestError::path_error("create ledger directory", &dir, e))?;
        Ok(Self {
            dir,
            seen: HashMap::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the id file for `channel`.
    #[must_use]
    pub fn path_for(&self, channel: &ChannelId) -> PathBuf {
        self.dir
            .join(format!("{}.{IDS_EXTENSION}", file_stem(channel)))
    }

    /// Path of the transfer-failure file for `channel`.
    #[must_use]
    pub fn failed_path_for(&self, channel: &ChannelId) -> PathBuf {
        self.dir
            .join(format!("{}.{FAILED_EXTENSION}", file_stem(channel)))
    }

    /// Read the channel's id file into memory. Call once per harvest.
    ///
    /// A missing file is an empty ledger. Malformed lines are skipped; a
    /// final line without its newline is treated as a torn write and cut off
    /// so later appends start on a fresh line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or repaired.
    pub fn load(&mut self, channel: &ChannelId) -> Result<usize> {
        let path = self.path_for(channel);
        let ids = read_ids(channel, &path)?;
        let count = ids.len();
        debug!(channel = %channel, path = %path.display(), count, "Loaded ledger");
        self.seen.insert(channel.clone(), ids);
        Ok(count)
    }

    /// Whether `message_id` was already fully processed.
    #[must_use]
    pub fn contains(&self, channel: &ChannelId, message_id: i64) -> bool {
        self.seen
            .get(channel)
            .is_some_and(|ids| ids.contains(&message_id))
    }

    /// Number of ids known for `channel`.
    #[must_use]
    pub fn len(&self, channel: &ChannelId) -> usize {
        self.seen.get(channel).map_or(0, HashSet::len)
    }

    #[must_use]
    pub fn is_empty(&self, channel: &ChannelId) -> bool {
        self.len(channel) == 0
    }

    /// Ids known for `channel`, sorted.
    #[must_use]
    pub fn ids(&self, channel: &ChannelId) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .seen
            .get(channel)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Durably record `message_id` as done. Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the append, flush or sync fails. The in-memory
    /// set is only updated once the id is on disk.
    pub fn mark_done(&mut self, channel: &ChannelId, message_id: i64) -> Result<()> {
        if self.contains(channel, message_id) {
            return Ok(());
        }

        let path = self.path_for(channel);
        append_line(channel, &path, &message_id.to_string())?;
        self.seen
            .entry(channel.clone())
            .or_default()
            .insert(message_id);
        Ok(())
    }

    /// Note an attachment that could not be transferred.
    ///
    /// # Errors
    ///
    /// Returns an error if the failure file cannot be appended.
    pub fn record_failure(
        &self,
        channel: &ChannelId,
        message_id: i64,
        file: &str,
        reason: &str,
    ) -> Result<()> {
        let path = self.failed_path_for(channel);
        let line = format!(
            "{message_id}\t{}\t{}",
            single_line(file),
            single_line(reason)
        );
        append_line(channel, &path, &line)
    }

    /// Message ids listed in the channel's failure file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn failed_ids(&self, channel: &ChannelId) -> Result<Vec<i64>> {
        let path = self.failed_path_for(channel);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ledger_error(channel, &path, source)),
        };
        let mut ids: Vec<i64> = content
            .lines()
            .filter_map(|line| line.split('\t').next())
            .filter_map(parse_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Replace the channel's ledger with `ids`, e.g. those already in the sink.
    ///
    /// Written to a temp file and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn rebuild_from(
        &mut self,
        channel: &ChannelId,
        ids: impl IntoIterator<Item = i64>,
    ) -> Result<usize> {
        let mut ids: Vec<i64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let path = self.path_for(channel);
        let tmp = path.with_extension(format!("{IDS_EXTENSION}.tmp"));

        let mut body = String::with_capacity(ids.len() * 8);
        for id in &ids {
            body.push_str(&id.to_string());
            body.push('\n');
        }

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(source) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(ledger_error(channel, &path, source));
        }

        info!(channel = %channel, count = ids.len(), "Rebuilt ledger");
        let count = ids.len();
        self.seen.insert(channel.clone(), ids.into_iter().collect());
        Ok(count)
    }
}

/// File-system safe stem for a channel id.
fn file_stem(channel: &ChannelId) -> String {
    let stem: String = channel
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

fn parse_id(line: &str) -> Option<i64> {
    line.trim().parse().ok()
}

fn single_line(value: &str) -> String {
    value.replace(['\n', '\r', '\t'], " ")
}

fn ledger_error(channel: &ChannelId, path: &Path, source: std::io::Error) -> HarvestError {
    HarvestError::Ledger {
        channel_id: channel.to_string(),
        path: path.to_path_buf(),
        source,
    }
}

fn read_ids(channel: &ChannelId, path: &Path) -> Result<HashSet<i64>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => return Err(ledger_error(channel, path, source)),
    };

    // Everything after the last newline is a torn write.
    let complete_len = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    if complete_len < bytes.len() {
        warn!(
            channel = %channel,
            path = %path.display(),
            dropped_bytes = bytes.len() - complete_len,
            "Ledger ends with a partial line; truncating it"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| ledger_error(channel, path, e))?;
        file.set_len(complete_len as u64)
            .and_then(|()| file.sync_data())
            .map_err(|e| ledger_error(channel, path, e))?;
    }

    let mut ids = HashSet::new();
    let mut malformed = 0usize;
    for line in BufReader::new(&bytes[..complete_len]).lines() {
        let line = line.map_err(|e| ledger_error(channel, path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_id(&line) {
            Some(id) => {
                ids.insert(id);
            }
            None => malformed += 1,
        }
    }
    if malformed > 0 {
        debug!(channel = %channel, malformed, "Skipped malformed ledger lines");
    }
    Ok(ids)
}

fn append_line(channel: &ChannelId, path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ledger_error(channel, path, e))?;
    file.write_all(format!("{line}\n").as_bytes())
        .and_then(|()| file.flush())
        .and_then(|()| file.sync_data())
        .map_err(|e| ledger_error(channel, path, e))
}

//! Data models for harvested channel data.
//!
//! `RawMessage` is what a platform client yields; `MessageRecord` is the
//! flattened, immutable shape that gets persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque platform identifier of a channel or dialog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Kind of dialog as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    /// Broadcast channel (only admins post).
    Broadcast,
    /// Large group hosted as a channel.
    Megagroup,
    /// Small legacy group chat.
    Group,
    /// One-to-one conversation.
    Private,
    /// Conversation with a bot account.
    Bot,
}

impl DialogKind {
    /// Channels in the platform's sense (broadcasts and megagroups).
    #[must_use]
    pub const fn is_channel(self) -> bool {
        matches!(self, Self::Broadcast | Self::Megagroup)
    }
}

impl fmt::Display for DialogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => write!(f, "channel"),
            Self::Megagroup => write!(f, "megagroup"),
            Self::Group => write!(f, "group"),
            Self::Private => write!(f, "private"),
            Self::Bot => write!(f, "bot"),
        }
    }
}

/// A dialog visible to the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogInfo {
    pub id: ChannelId,
    pub title: String,
    pub kind: DialogKind,
}

/// A resolved channel, ready for message iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub title: String,
    pub kind: DialogKind,
}

/// Author of a message, resolved once during parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sender {
    Individual { id: i64, name: Option<String> },
    Channel { id: i64, title: Option<String> },
    Unknown,
}

impl Sender {
    #[must_use]
    pub const fn id(&self) -> Option<i64> {
        match self {
            Self::Individual { id, .. } | Self::Channel { id, .. } => Some(*id),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Individual { name, .. } => name.as_deref(),
            Self::Channel { title, .. } => title.as_deref(),
            Self::Unknown => None,
        }
    }
}

/// Descriptor of a downloadable attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Platform reference used by `download` (a file id, or a path for exports).
    pub locator: String,
    /// Original file name, if the platform has one.
    pub file_name: Option<String>,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

/// A message as delivered by the platform client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub sender: Sender,
    /// Text with formatting markup preserved.
    pub text: Option<String>,
    /// Plain text without markup.
    pub raw_text: Option<String>,
    pub attachment: Option<AttachmentRef>,
}

/// Canonical persisted metadata for one message.
///
/// `(channel_id, message_id)` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub message_id: i64,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub raw_text: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_size: Option<u64>,
    pub extracted_secret: Option<String>,
}

impl MessageRecord {
    /// Column names in persisted order.
    pub const COLUMNS: [&'static str; 11] = [
        "channel_id",
        "channel_name",
        "message_id",
        "sender_id",
        "sender_name",
        "timestamp",
        "text",
        "raw_text",
        "attachment_name",
        "attachment_size",
        "extracted_secret",
    ];
}

/// Why a transfer did not need to contact the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyExists { path: PathBuf },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists { path } => write!(f, "already exists at {}", path.display()),
        }
    }
}

/// Terminal result of one attachment transfer.
#[derive(Debug)]
pub enum TransferOutcome {
    Completed { path: PathBuf, bytes: u64 },
    Skipped(SkipReason),
    Failed(crate::error::HarvestError),
}

/// Counts emitted when a harvest run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestSummary {
    pub channel_id: Option<ChannelId>,
    pub channel_name: Option<String>,
    /// Messages yielded by the platform.
    pub messages_seen: usize,
    /// Messages skipped because the ledger already had them.
    pub messages_skipped: usize,
    /// Messages fully processed and marked done this run.
    pub messages_processed: usize,
    pub records_persisted: usize,
    /// Records the sink already held (insert-or-ignore hit).
    pub records_already_present: usize,
    pub files_transferred: usize,
    pub files_skipped: usize,
    pub bytes_transferred: u64,
    pub transfer_failures: usize,
    pub persistence_failures: usize,
    pub elapsed_ms: u64,
    /// Stopped early on a shutdown request.
    pub interrupted: bool,
}

impl HarvestSummary {
    /// Total failures of any kind.
    #[must_use]
    pub const fn failures(&self) -> usize {
        self.transfer_failures + self.persistence_failures
    }

    /// Fold another channel's summary into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.messages_seen += other.messages_seen;
        self.messages_skipped += other.messages_skipped;
        self.messages_processed += other.messages_processed;
        self.records_persisted += other.records_persisted;
        self.records_already_present += other.records_already_present;
        self.files_transferred += other.files_transferred;
        self.files_skipped += other.files_skipped;
        self.bytes_transferred += other.bytes_transferred;
        self.transfer_failures += other.transfer_failures;
        self.persistence_failures += other.persistence_failures;
        self.elapsed_ms += other.elapsed_ms;
        self.interrupted |= other.interrupted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_accessors() {
        let user = Sender::Individual {
            id: 7,
            name: Some("alice".into()),
        };
        assert_eq!(user.id(), Some(7));
        assert_eq!(user.name(), Some("alice"));

        let chan = Sender::Channel {
            id: 9,
            title: Some("News".into()),
        };
        assert_eq!(chan.name(), Some("News"));
        assert_eq!(Sender::Unknown.id(), None);
    }

    #[test]
    fn dialog_kind_channel_filter() {
        assert!(DialogKind::Broadcast.is_channel());
        assert!(DialogKind::Megagroup.is_channel());
        assert!(!DialogKind::Group.is_channel());
        assert!(!DialogKind::Private.is_channel());
    }

    #[test]
    fn summary_absorb_accumulates() {
        let mut total = HarvestSummary::default();
        let part = HarvestSummary {
            messages_seen: 3,
            records_persisted: 2,
            transfer_failures: 1,
            ..Default::default()
        };
        total.absorb(&part);
        total.absorb(&part);
        assert_eq!(total.messages_seen, 6);
        assert_eq!(total.records_persisted, 4);
        assert_eq!(total.failures(), 2);
    }
}

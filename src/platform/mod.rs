//! Narrow interface to the messaging platform.
//!
//! The harvester only talks to the platform through [`PlatformClient`].
//! Authentication, sessions and the wire protocol live behind it.
//! [`ExportClient`] serves an offline desktop export through the same trait.

pub mod export;
#[cfg(test)]
pub(crate) mod testing;

pub use export::ExportClient;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{AttachmentRef, ChannelHandle, DialogInfo, RawMessage};
use crate::progress::ProgressTracker;

/// Errors surfaced by a platform client.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Platform asked us to slow down for `wait`.
    #[error("Rate limited, retry after {}s", .wait.as_secs())]
    RateLimited { wait: Duration },

    /// Identifier matched no dialog (or several).
    #[error("'{identifier}' not found")]
    NotFound {
        identifier: String,
        reason: Option<String>,
    },

    /// Dialog is private or access was denied.
    #[error("access to '{identifier}' is forbidden")]
    Forbidden { identifier: String },

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Lazy, ordered sequence of messages for one channel.
///
/// Restartable per `iter_messages` call, not resumable mid-sequence.
#[async_trait]
pub trait MessageCursor: Send {
    /// Next message in platform-native order, or `None` when exhausted.
    async fn next(&mut self) -> Result<Option<RawMessage>, PlatformError>;
}

/// Operations the harvester needs from a platform client.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Map a configured name, `@username` or numeric id to a channel.
    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelHandle, PlatformError>;

    /// All dialogs visible to the account.
    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, PlatformError>;

    /// Start iterating a channel's history, newest first, up to `limit` messages.
    async fn iter_messages(
        &self,
        channel: &ChannelHandle,
        limit: Option<usize>,
    ) -> Result<Box<dyn MessageCursor>, PlatformError>;

    /// Write the attachment's bytes to `dest`, reporting progress.
    ///
    /// Returns the number of bytes written.
    async fn download(
        &self,
        attachment: &AttachmentRef,
        dest: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<u64, PlatformError>;
}

/// Cursor over an in-memory list, used by clients that load history eagerly.
pub struct VecCursor {
    messages: std::vec::IntoIter<RawMessage>,
}

impl VecCursor {
    #[must_use]
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages: messages.into_iter(),
        }
    }
}

#[async_trait]
impl MessageCursor for VecCursor {
    async fn next(&mut self) -> Result<Option<RawMessage>, PlatformError> {
        Ok(self.messages.next())
    }
}

//! Scripted in-memory client for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{MessageCursor, PlatformClient, PlatformError};
use crate::model::{
    AttachmentRef, ChannelHandle, ChannelId, DialogInfo, DialogKind, RawMessage, Sender,
};
use crate::progress::ProgressTracker;

#[derive(Default)]
pub struct ScriptedClient {
    channels: Vec<(ChannelHandle, Vec<RawMessage>)>,
    forbidden: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    download_errors: Mutex<HashMap<String, VecDeque<PlatformError>>>,
    cursor_errors: Mutex<VecDeque<PlatformError>>,
    downloads: Mutex<Vec<String>>,
    download_delay: Option<Duration>,
    active_downloads: AtomicUsize,
    peak_downloads: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, id: &str, title: &str, messages: Vec<RawMessage>) -> Self {
        self.channels.push((
            ChannelHandle {
                id: ChannelId::new(id),
                title: title.to_string(),
                kind: DialogKind::Broadcast,
            },
            messages,
        ));
        self
    }

    pub fn with_kind(mut self, id: &str, title: &str, kind: DialogKind) -> Self {
        self.channels.push((
            ChannelHandle {
                id: ChannelId::new(id),
                title: title.to_string(),
                kind,
            },
            Vec::new(),
        ));
        self
    }

    pub fn with_forbidden(mut self, title: &str) -> Self {
        self.forbidden.push(title.to_string());
        self
    }

    pub fn with_file(mut self, locator: &str, content: &[u8]) -> Self {
        self.files.insert(locator.to_string(), content.to_vec());
        self
    }

    /// Make every download take `delay` before returning.
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    /// Most downloads that were running at the same time.
    pub fn peak_downloads(&self) -> usize {
        self.peak_downloads.load(Ordering::SeqCst)
    }

    /// Queue an error for the next download of `locator`.
    pub fn fail_download(&self, locator: &str, err: PlatformError) {
        self.download_errors
            .lock()
            .entry(locator.to_string())
            .or_default()
            .push_back(err);
    }

    /// Queue an error for the next cursor `next()` call.
    pub fn fail_cursor(&self, err: PlatformError) {
        self.cursor_errors.lock().push_back(err);
    }

    /// Locators passed to `download`, in call order.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }

    pub fn download_count(&self, locator: &str) -> usize {
        self.downloads.lock().iter().filter(|l| *l == locator).count()
    }

    fn cursor_errors(&self) -> VecDeque<PlatformError> {
        std::mem::take(&mut *self.cursor_errors.lock())
    }
}

/// Message with optional attachment stored under `locator`.
pub fn message(id: i64, text: &str, attachment: Option<(&str, Option<&str>)>) -> RawMessage {
    RawMessage {
        id,
        date: None,
        sender: Sender::Individual {
            id: 1,
            name: Some("alice".into()),
        },
        text: Some(text.to_string()),
        raw_text: Some(text.to_string()),
        attachment: attachment.map(|(locator, name)| AttachmentRef {
            locator: locator.to_string(),
            file_name: name.map(str::to_string),
            size: None,
            mime_type: None,
        }),
    }
}

struct ScriptedCursor {
    errors: VecDeque<PlatformError>,
    messages: std::vec::IntoIter<RawMessage>,
}

#[async_trait]
impl MessageCursor for ScriptedCursor {
    async fn next(&mut self) -> Result<Option<RawMessage>, PlatformError> {
        if let Some(err) = self.errors.pop_front() {
            return Err(err);
        }
        Ok(self.messages.next())
    }
}

#[async_trait]
impl PlatformClient for ScriptedClient {
    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelHandle, PlatformError> {
        if self.forbidden.iter().any(|t| t == identifier) {
            return Err(PlatformError::Forbidden {
                identifier: identifier.to_string(),
            });
        }
        self.channels
            .iter()
            .find(|(h, _)| h.title == identifier || h.id.as_str() == identifier)
            .map(|(h, _)| h.clone())
            .ok_or_else(|| PlatformError::NotFound {
                identifier: identifier.to_string(),
                reason: None,
            })
    }

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, PlatformError> {
        Ok(self
            .channels
            .iter()
            .map(|(h, _)| DialogInfo {
                id: h.id.clone(),
                title: h.title.clone(),
                kind: h.kind,
            })
            .collect())
    }

    async fn iter_messages(
        &self,
        channel: &ChannelHandle,
        limit: Option<usize>,
    ) -> Result<Box<dyn MessageCursor>, PlatformError> {
        let mut messages = self
            .channels
            .iter()
            .find(|(h, _)| h.id == channel.id)
            .map(|(_, m)| m.clone())
            .unwrap_or_default();
        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(Box::new(ScriptedCursor {
            errors: self.cursor_errors(),
            messages: messages.into_iter(),
        }))
    }

    async fn download(
        &self,
        attachment: &AttachmentRef,
        dest: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<u64, PlatformError> {
        let active = self.active_downloads.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_downloads.fetch_max(active, Ordering::SeqCst);
        let result = self.serve(attachment, dest, progress).await;
        self.active_downloads.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedClient {
    async fn serve(
        &self,
        attachment: &AttachmentRef,
        dest: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<u64, PlatformError> {
        self.downloads.lock().push(attachment.locator.clone());
        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .download_errors
            .lock()
            .get_mut(&attachment.locator)
            .and_then(VecDeque::pop_front);
        if let Some(err) = queued {
            // Leave a partial file behind, like a dropped connection would.
            tokio::fs::write(dest, b"partial").await?;
            return Err(err);
        }

        let content = self
            .files
            .get(&attachment.locator)
            .cloned()
            .unwrap_or_else(|| format!("content of {}", attachment.locator).into_bytes());
        let total = content.len() as u64;
        tokio::fs::write(dest, &content).await?;
        progress.update(total, Some(total));
        Ok(total)
    }
}

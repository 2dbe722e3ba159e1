//! Offline platform client backed by a desktop export.
//!
//! Reads `result.json` as written by the platform's desktop app, either a
//! single chat export (`{"name", "type", "id", "messages": [...]}`) or a
//! full account export (`{"chats": {"list": [...]}}`). Attachments are
//! the files the export placed next to `result.json`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{MessageCursor, PlatformClient, PlatformError, VecCursor};
use crate::error::{HarvestError, Result, find_closest_match};
use crate::model::{
    AttachmentRef, ChannelHandle, ChannelId, DialogInfo, DialogKind, RawMessage, Sender,
};
use crate::progress::ProgressTracker;

const RESULT_FILE: &str = "result.json";
const CHUNK_SIZE: usize = 64 * 1024;
/// Placeholder the exporter writes when media was excluded.
const NOT_INCLUDED_PREFIX: &str = "(File not included";

#[derive(Debug, Clone)]
struct ExportChat {
    id: ChannelId,
    title: String,
    username: Option<String>,
    kind: DialogKind,
    forbidden: bool,
    /// Newest first.
    messages: Vec<RawMessage>,
}

/// Platform client over an exported chat history.
#[derive(Debug, Clone)]
pub struct ExportClient {
    root: PathBuf,
    chats: Vec<ExportChat>,
}

impl ExportClient {
    /// Load an export from a directory holding `result.json`, or from the
    /// JSON file itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not an export.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (root, json_path) = if path.is_dir() {
            (path.to_path_buf(), path.join(RESULT_FILE))
        } else {
            let root = path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            (root, path.to_path_buf())
        };

        let content = std::fs::read_to_string(&json_path)
            .map_err(|e| HarvestError::path_error("read export", &json_path, e))?;
        let data: Value = serde_json::from_str(&content).map_err(|e| HarvestError::ConfigError {
            path: json_path.clone(),
            reason: format!("not a valid export: {e}"),
        })?;

        let client = Self::from_value(root, &data);
        info!(
            path = %json_path.display(),
            chats = client.chats.len(),
            "Loaded export"
        );
        Ok(client)
    }

    /// Build from already parsed export JSON; attachments resolve under `root`.
    #[must_use]
    pub fn from_value(root: impl Into<PathBuf>, data: &Value) -> Self {
        let chats = data["chats"]["list"].as_array().map_or_else(
            || parse_chat(data).into_iter().collect(),
            |list| list.iter().filter_map(parse_chat).collect(),
        );
        Self {
            root: root.into(),
            chats,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find_by_id(&self, id: &ChannelId) -> Option<&ExportChat> {
        self.chats.iter().find(|c| &c.id == id)
    }

    fn lookup(&self, identifier: &str) -> std::result::Result<&ExportChat, PlatformError> {
        let ident = identifier.trim();
        let not_found = |reason: Option<String>| PlatformError::NotFound {
            identifier: identifier.to_string(),
            reason,
        };

        if let Some(username) = ident.strip_prefix('@') {
            return self
                .chats
                .iter()
                .find(|c| {
                    c.username
                        .as_deref()
                        .is_some_and(|u| u.eq_ignore_ascii_case(username))
                })
                .ok_or_else(|| not_found(None));
        }

        if ident.parse::<i64>().is_ok() {
            let bare = ident.strip_prefix("-100").unwrap_or(ident);
            if let Some(chat) = self
                .chats
                .iter()
                .find(|c| c.id.as_str() == ident || c.id.as_str() == bare)
            {
                return Ok(chat);
            }
        }

        let wanted = ident.to_lowercase();
        let matches: Vec<&ExportChat> = self
            .chats
            .iter()
            .filter(|c| c.title.to_lowercase() == wanted)
            .collect();

        match matches.as_slice() {
            [chat] => Ok(chat),
            [] => {
                let titles: Vec<&str> = self.chats.iter().map(|c| c.title.as_str()).collect();
                let reason = find_closest_match(ident, &titles, None)
                    .map(|t| format!("did you mean '{t}'?"));
                Err(not_found(reason))
            }
            many => Err(not_found(Some(format!(
                "{} dialogs share this title; use the numeric id",
                many.len()
            )))),
        }
    }

    /// Resolve an attachment locator to a file inside the export.
    fn attachment_path(&self, locator: &str) -> std::result::Result<PathBuf, PlatformError> {
        if locator.starts_with(NOT_INCLUDED_PREFIX) {
            return Err(PlatformError::Other(
                "attachment was not included in the export".into(),
            ));
        }
        let relative = Path::new(locator);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PlatformError::Other(format!(
                "attachment path escapes the export: {locator}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl PlatformClient for ExportClient {
    async fn resolve_channel(
        &self,
        identifier: &str,
    ) -> std::result::Result<ChannelHandle, PlatformError> {
        let chat = self.lookup(identifier)?;
        if chat.forbidden {
            return Err(PlatformError::Forbidden {
                identifier: identifier.to_string(),
            });
        }
        debug!(identifier, id = %chat.id, title = %chat.title, "Resolved channel");
        Ok(ChannelHandle {
            id: chat.id.clone(),
            title: chat.title.clone(),
            kind: chat.kind,
        })
    }

    async fn list_dialogs(&self) -> std::result::Result<Vec<DialogInfo>, PlatformError> {
        Ok(self
            .chats
            .iter()
            .map(|c| DialogInfo {
                id: c.id.clone(),
                title: c.title.clone(),
                kind: c.kind,
            })
            .collect())
    }

    async fn iter_messages(
        &self,
        channel: &ChannelHandle,
        limit: Option<usize>,
    ) -> std::result::Result<Box<dyn MessageCursor>, PlatformError> {
        let chat = self
            .find_by_id(&channel.id)
            .ok_or_else(|| PlatformError::NotFound {
                identifier: channel.id.to_string(),
                reason: None,
            })?;
        let mut messages = chat.messages.clone();
        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(Box::new(VecCursor::new(messages)))
    }

    async fn download(
        &self,
        attachment: &AttachmentRef,
        dest: &Path,
        progress: &mut ProgressTracker,
    ) -> std::result::Result<u64, PlatformError> {
        let source = self.attachment_path(&attachment.locator)?;
        let mut reader = tokio::fs::File::open(&source).await?;
        let total = reader.metadata().await?.len();
        let mut writer = tokio::fs::File::create(dest).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        progress.update(0, Some(total));
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            received += n as u64;
            progress.update(received, Some(total));
        }
        writer.flush().await?;
        writer.sync_data().await?;
        Ok(received)
    }
}

// =============================================================================
// JSON parsing
// =============================================================================

fn parse_kind(kind: &str) -> DialogKind {
    match kind {
        "public_supergroup" | "private_supergroup" => DialogKind::Megagroup,
        "private_group" => DialogKind::Group,
        "personal_chat" | "saved_messages" => DialogKind::Private,
        "bot_chat" => DialogKind::Bot,
        // public_channel, private_channel and anything unknown
        _ => DialogKind::Broadcast,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn parse_chat(value: &Value) -> Option<ExportChat> {
    let id = id_string(&value["id"])?;
    let Some(raw_messages) = value["messages"].as_array() else {
        warn!(chat = %id, "Export chat has no message list, skipping");
        return None;
    };

    let title = value["name"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map_or_else(|| format!("chat_{id}"), str::to_string);

    let mut messages: Vec<RawMessage> = raw_messages.iter().filter_map(parse_message).collect();
    messages.sort_by(|a, b| b.id.cmp(&a.id));

    Some(ExportChat {
        id: ChannelId::new(id),
        title,
        username: value["username"]
            .as_str()
            .map(|u| u.trim_start_matches('@').to_string()),
        kind: parse_kind(value["type"].as_str().unwrap_or_default()),
        forbidden: value["forbidden"].as_bool().unwrap_or(false),
        messages,
    })
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(ts) = value["date_unixtime"]
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| value["date_unixtime"].as_i64())
    {
        return DateTime::from_timestamp(ts, 0);
    }
    let date = value["date"].as_str()?;
    DateTime::parse_from_rfc3339(date)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn parse_sender(value: &Value) -> Sender {
    let name = value["from"]
        .as_str()
        .or_else(|| value["actor"].as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let Some(from_id) = value["from_id"].as_str().or_else(|| value["actor_id"].as_str()) else {
        return Sender::Unknown;
    };

    if let Some(id) = from_id.strip_prefix("user").and_then(|s| s.parse().ok()) {
        Sender::Individual { id, name }
    } else if let Some(id) = from_id.strip_prefix("channel").and_then(|s| s.parse().ok()) {
        Sender::Channel { id, title: name }
    } else {
        Sender::Unknown
    }
}

/// Render message text: (formatted, plain).
///
/// Formatted text wraps `pre` entities in fenced blocks and `code` entities
/// in single backticks; everything else is kept as plain text.
fn parse_text(value: &Value) -> (Option<String>, Option<String>) {
    match value {
        Value::String(s) => (Some(s.clone()), Some(s.clone())),
        Value::Array(parts) => {
            let mut formatted = String::new();
            let mut plain = String::new();
            for part in parts {
                match part {
                    Value::String(s) => {
                        formatted.push_str(s);
                        plain.push_str(s);
                    }
                    Value::Object(_) => {
                        let text = part["text"].as_str().unwrap_or_default();
                        match part["type"].as_str() {
                            Some("pre") => {
                                formatted.push_str("```");
                                formatted.push_str(text);
                                formatted.push_str("```");
                            }
                            Some("code") => {
                                formatted.push('`');
                                formatted.push_str(text);
                                formatted.push('`');
                            }
                            _ => formatted.push_str(text),
                        }
                        plain.push_str(text);
                    }
                    _ => {}
                }
            }
            (Some(formatted), Some(plain))
        }
        _ => (None, None),
    }
}

fn parse_attachment(value: &Value) -> Option<AttachmentRef> {
    if let Some(file) = value["file"].as_str() {
        let file_name = value["file_name"]
            .as_str()
            .map(str::to_string)
            .or_else(|| {
                (!file.starts_with(NOT_INCLUDED_PREFIX))
                    .then(|| Path::new(file).file_name())
                    .flatten()
                    .map(|n| n.to_string_lossy().into_owned())
            });
        return Some(AttachmentRef {
            locator: file.to_string(),
            file_name,
            size: value["file_size"].as_u64(),
            mime_type: value["mime_type"].as_str().map(str::to_string),
        });
    }

    // Photos carry no original name.
    value["photo"].as_str().map(|photo| AttachmentRef {
        locator: photo.to_string(),
        file_name: None,
        size: value["photo_file_size"].as_u64(),
        mime_type: Some("image/jpeg".to_string()),
    })
}

fn parse_message(value: &Value) -> Option<RawMessage> {
    let id = value["id"].as_i64()?;
    let (text, raw_text) = parse_text(&value["text"]);
    Some(RawMessage {
        id,
        date: parse_date(value),
        sender: parse_sender(value),
        text,
        raw_text,
        attachment: parse_attachment(value),
    })
}

//! Turns platform messages into persisted records.
//!
//! Flattens the sender, carries the attachment descriptor over, and pulls
//! the first secret-looking value out of the formatted text.

use regex::Regex;

use crate::error::{HarvestError, Result};
use crate::model::{ChannelHandle, MessageRecord, RawMessage};

/// Default secret pattern: the first token inside a fenced code span.
pub const DEFAULT_SECRET_PATTERN: &str = r"```\s*([^\s`]+)\s*```";

/// Parser for raw platform messages.
#[derive(Debug, Clone)]
pub struct MessageParser {
    secret: Regex,
}

impl MessageParser {
    /// Build a parser with a custom secret pattern.
    ///
    /// The first capture group is extracted, or the whole match when the
    /// pattern has no groups.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` if the pattern does not compile.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let secret = Regex::new(pattern)
            .map_err(|e| HarvestError::invalid_setting("extract.secret_pattern", e.to_string()))?;
        Ok(Self { secret })
    }

    /// Extract the secret from formatted text, if any.
    #[must_use]
    pub fn extract_secret(&self, text: &str) -> Option<String> {
        let caps = self.secret.captures(text)?;
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Build the record for `raw` as seen in `channel`.
    #[must_use]
    pub fn parse(&self, channel: &ChannelHandle, raw: &RawMessage) -> MessageRecord {
        let extracted_secret = raw.text.as_deref().and_then(|t| self.extract_secret(t));

        let (attachment_name, attachment_size) = raw.attachment.as_ref().map_or((None, None), |a| {
            (
                Some(
                    a.file_name
                        .clone()
                        .unwrap_or_else(|| synthetic_file_name(raw.id)),
                ),
                a.size,
            )
        });

        MessageRecord {
            channel_id: channel.id.clone(),
            channel_name: channel.title.clone(),
            message_id: raw.id,
            sender_id: raw.sender.id(),
            sender_name: raw.sender.name().map(str::to_string),
            timestamp: raw.date,
            text: non_empty(raw.text.as_deref()),
            raw_text: non_empty(raw.raw_text.as_deref()),
            attachment_name,
            attachment_size,
            extracted_secret,
        }
    }
}

/// Name used for attachments the platform did not name.
#[must_use]
pub fn synthetic_file_name(message_id: i64) -> String {
    format!("media_from_message_{message_id}")
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttachmentRef, ChannelId, DialogKind, Sender};
    use chrono::{TimeZone, Utc};

    fn parser() -> MessageParser {
        MessageParser::with_pattern(DEFAULT_SECRET_PATTERN).unwrap()
    }

    fn channel() -> ChannelHandle {
        ChannelHandle {
            id: ChannelId::new("100"),
            title: "Test".into(),
            kind: DialogKind::Broadcast,
        }
    }

    fn raw(id: i64) -> RawMessage {
        RawMessage {
            id,
            date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            sender: Sender::Unknown,
            text: None,
            raw_text: None,
            attachment: None,
        }
    }

    #[test]
    fn test_extract_secret_from_code_span() {
        let parser = parser();
        assert_eq!(
            parser.extract_secret("password: ```  hunter2 ``` enjoy"),
            Some("hunter2".to_string())
        );
        assert_eq!(parser.extract_secret("no code here"), None);
        assert_eq!(parser.extract_secret("``````"), None);
    }

    #[test]
    fn test_custom_pattern_without_group() {
        let parser = MessageParser::with_pattern(r"KEY-\d+").unwrap();
        assert_eq!(
            parser.extract_secret("use KEY-123 now"),
            Some("KEY-123".to_string())
        );
    }

    #[test]
    fn test_invalid_pattern_is_setting_error() {
        let err = MessageParser::with_pattern("(unclosed").unwrap_err();
        assert!(matches!(err, HarvestError::InvalidSetting { .. }));
    }

    #[test]
    fn test_parse_user_message() {
        let mut msg = raw(5);
        msg.sender = Sender::Individual {
            id: 77,
            name: Some("alice".into()),
        };
        msg.text = Some("pass ```abc123```".into());
        msg.raw_text = Some("pass abc123".into());

        let record = parser().parse(&channel(), &msg);
        assert_eq!(record.channel_id.as_str(), "100");
        assert_eq!(record.channel_name, "Test");
        assert_eq!(record.message_id, 5);
        assert_eq!(record.sender_id, Some(77));
        assert_eq!(record.sender_name.as_deref(), Some("alice"));
        assert_eq!(record.extracted_secret.as_deref(), Some("abc123"));
        assert_eq!(record.raw_text.as_deref(), Some("pass abc123"));
        assert!(record.attachment_name.is_none());
        assert!(record.attachment_size.is_none());
    }

    #[test]
    fn test_parse_channel_sender_and_unnamed_attachment() {
        let mut msg = raw(9);
        msg.sender = Sender::Channel {
            id: 100,
            title: Some("Test".into()),
        };
        msg.attachment = Some(AttachmentRef {
            locator: "photos/1.jpg".into(),
            file_name: None,
            size: Some(2048),
            mime_type: Some("image/jpeg".into()),
        });

        let record = parser().parse(&channel(), &msg);
        assert_eq!(record.sender_name.as_deref(), Some("Test"));
        assert_eq!(
            record.attachment_name.as_deref(),
            Some("media_from_message_9")
        );
        assert_eq!(record.attachment_size, Some(2048));
    }

    #[test]
    fn test_empty_text_is_null() {
        let mut msg = raw(1);
        msg.text = Some(String::new());
        let record = parser().parse(&channel(), &msg);
        assert!(record.text.is_none());
        assert!(record.extracted_secret.is_none());
    }
}

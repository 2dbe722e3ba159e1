//! Error types for chanharvest.
//!
//! One error enum for the whole pipeline, grouped by the concern that
//! raised it. Callers decide per variant whether a failure ends the run,
//! only the current message, or only the current transfer.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::platform::PlatformError;

/// Primary error type for harvest operations.
#[derive(Error, Debug)]
pub enum HarvestError {
    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// Channel identifier matched nothing (or more than one dialog).
    #[error("Channel '{identifier}' not found{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ChannelNotFound {
        identifier: String,
        reason: Option<String>,
    },

    /// Channel exists but is private or the account has no access.
    #[error("Channel '{identifier}' is private or access is forbidden")]
    ChannelForbidden { identifier: String },

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// The platform kept rate limiting the same call.
    #[error("Rate limit retries exhausted for {operation} after {attempts} attempts")]
    RateLimitExhausted { operation: String, attempts: u32 },

    // =========================================================================
    // Platform / Transfer Errors
    // =========================================================================
    /// Non rate-limit failure reported by the platform client.
    #[error("Platform error during {operation}: {source}")]
    Platform {
        operation: String,
        #[source]
        source: PlatformError,
    },

    /// A single attachment download failed.
    #[error("Transfer of '{file}' (message {message_id}) failed: {reason}")]
    Transfer {
        message_id: i64,
        file: String,
        reason: String,
    },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Sink write failed; the message stays unmarked.
    #[error("Failed to persist message {message_id} of channel {channel_id}: {reason}")]
    Persistence {
        channel_id: String,
        message_id: i64,
        reason: String,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Flat-file sink header does not match the record layout.
    #[error("Unexpected CSV header in '{path}': {found}")]
    CsvHeaderMismatch { path: PathBuf, found: String },

    // =========================================================================
    // Ledger Errors
    // =========================================================================
    /// Ledger file could not be read or appended.
    #[error("Ledger error for channel {channel_id} at '{path}': {source}")]
    Ledger {
        channel_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // IO Errors
    // =========================================================================
    /// File read/write error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file parsing error.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigError { path: PathBuf, reason: String },

    /// Invalid or missing setting.
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    // =========================================================================
    // Control Flow
    // =========================================================================
    /// Shutdown was requested while waiting.
    #[error("Interrupted while waiting {}s", .waited.as_secs())]
    Cancelled { waited: Duration },

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Create a channel not found error.
    pub fn channel_not_found(identifier: impl Into<String>) -> Self {
        Self::ChannelNotFound {
            identifier: identifier.into(),
            reason: None,
        }
    }

    /// Create a channel forbidden error.
    pub fn channel_forbidden(identifier: impl Into<String>) -> Self {
        Self::ChannelForbidden {
            identifier: identifier.into(),
        }
    }

    /// Wrap a platform error raised while performing `operation`.
    pub fn platform(operation: impl Into<String>, source: PlatformError) -> Self {
        Self::Platform {
            operation: operation.into(),
            source,
        }
    }

    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Create an invalid setting error.
    pub fn invalid_setting(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error ends a whole channel run rather than one message or file.
    #[must_use]
    pub const fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::ChannelNotFound { .. }
                | Self::ChannelForbidden { .. }
                | Self::RateLimitExhausted { .. }
                | Self::Platform { .. }
                | Self::Ledger { .. }
                | Self::Cancelled { .. }
                | Self::ConfigError { .. }
                | Self::InvalidSetting { .. }
        )
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ChannelNotFound { .. } => {
                Some("Run 'chanharvest dialogs' to list the channels visible to this account.")
            }
            Self::ChannelForbidden { .. } => {
                Some("Join the channel with this account or ask an admin for access.")
            }
            Self::RateLimitExhausted { .. } => Some(
                "Wait before re-running; already processed messages will be skipped.",
            ),
            Self::CsvHeaderMismatch { .. } => {
                Some("Point --csv at a new file or move the old one aside.")
            }
            Self::ConfigError { .. } => {
                Some("Run 'chanharvest config --show' to inspect the effective configuration.")
            }
            _ => None,
        }
    }
}

impl From<PlatformError> for HarvestError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotFound { identifier, reason } => {
                Self::ChannelNotFound { identifier, reason }
            }
            PlatformError::Forbidden { identifier } => Self::ChannelForbidden { identifier },
            other => Self::platform("platform call", other),
        }
    }
}

// =============================================================================
// CLI Error Formatting Utilities
// =============================================================================

use colored::Colorize;

/// Format a structured CLI error with explanation and suggestions.
#[must_use]
pub fn format_error(title: &str, explanation: &str, suggestions: &[&str]) -> String {
    use std::fmt::Write;

    let mut output = format!("{} {}", "✗".red().bold(), title.bold());

    if !explanation.is_empty() {
        let _ = write!(output, "\n\n   {explanation}");
    }

    if !suggestions.is_empty() {
        output.push_str("\n\n   ");
        if suggestions.len() == 1 {
            let _ = write!(output, "{} {}", "Hint:".cyan(), suggestions[0]);
        } else {
            let _ = write!(output, "{}:", "Try".cyan());
            for suggestion in suggestions {
                let _ = write!(output, "\n     {} {}", "•".dimmed(), suggestion);
            }
        }
    }

    output
}

/// Calculate the Levenshtein edit distance between two strings.
///
/// Used to suggest the closest dialog title when a channel lookup fails.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let b_len = b_chars.len();

    if a_chars.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a_chars.len();
    }

    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        curr_row[0] = i + 1;

        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }

        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

/// Find the closest candidate within `max_distance` edits (case-insensitive).
///
/// Exact matches are not returned; the caller already knows about those.
#[must_use]
pub fn find_closest_match<'a>(
    input: &str,
    candidates: &[&'a str],
    max_distance: Option<usize>,
) -> Option<&'a str> {
    let max_dist = max_distance.unwrap_or(2);
    let input_lower = input.to_lowercase();

    candidates
        .iter()
        .map(|&candidate| {
            let distance = levenshtein_distance(&input_lower, &candidate.to_lowercase());
            (candidate, distance)
        })
        .filter(|(_, distance)| *distance <= max_dist && *distance > 0)
        .min_by_key(|(_, distance)| *distance)
        .map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarvestError::channel_not_found("Some Channel");
        assert_eq!(err.to_string(), "Channel 'Some Channel' not found");

        let err = HarvestError::ChannelNotFound {
            identifier: "Tset".to_string(),
            reason: Some("did you mean 'Test'?".to_string()),
        };
        assert!(err.to_string().ends_with(": did you mean 'Test'?"));
    }

    #[test]
    fn test_run_fatality() {
        assert!(HarvestError::channel_forbidden("x").is_fatal_for_run());
        assert!(
            HarvestError::RateLimitExhausted {
                operation: "iterate".into(),
                attempts: 5
            }
            .is_fatal_for_run()
        );
        let persistence = HarvestError::Persistence {
            channel_id: "1".into(),
            message_id: 2,
            reason: "disk full".into(),
        };
        assert!(!persistence.is_fatal_for_run());

        let ledger = HarvestError::Ledger {
            channel_id: "1".into(),
            path: PathBuf::from("1.ids"),
            source: std::io::Error::other("read-only file system"),
        };
        assert!(ledger.is_fatal_for_run());
    }

    #[test]
    fn test_platform_error_conversion() {
        let err: HarvestError = PlatformError::Forbidden {
            identifier: "secret".into(),
        }
        .into();
        assert!(matches!(err, HarvestError::ChannelForbidden { .. }));
        assert!(err.suggestion().is_some());

        let err: HarvestError = PlatformError::Transport("reset".into()).into();
        assert!(matches!(err, HarvestError::Platform { .. }));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HarvestError = io_err.into();
        assert!(matches!(err, HarvestError::IoError(_)));
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
        assert_eq!(levenshtein_distance("cat", "cats"), 1);
        assert_eq!(levenshtein_distance("", "abc"), 3);
    }

    #[test]
    fn find_closest_match_typo() {
        let candidates = ["Test", "Announcements", "Dev Chat"];
        assert_eq!(find_closest_match("tset", &candidates, None), Some("Test"));
        assert_eq!(find_closest_match("dev chta", &candidates, None), Some("Dev Chat"));
        assert_eq!(find_closest_match("zzz", &candidates, None), None);
    }

    #[test]
    fn format_error_includes_hint() {
        let output = format_error("Channel not found", "No dialog named X", &["Try this"]);
        assert!(output.contains("Channel not found"));
        assert!(output.contains("Try this"));
    }
}

//! chanharvest - Resumable channel history and media harvester
//!
//! Walks a channel's message history through a [`platform::PlatformClient`],
//! persists one record per message, downloads attachments with bounded
//! concurrency, and keeps a per-channel ledger so interrupted runs resume.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`config`] - Layered configuration (file, environment, CLI)
//! - [`error`] - Custom error types with rich context
//! - [`model`] - Records, dialogs and run summaries
//! - [`ledger`] - Append-only per-channel dedup ledger
//! - [`rate_limit`] - Retry-after handling for platform calls
//! - [`progress`] - Throttled per-transfer progress
//! - [`transfer`] - Attachment downloads with atomic finalization
//! - [`harvester`] - The per-channel harvest loop
//! - [`sink`], [`storage`], [`flatfile`] - `SQLite` and CSV persistence

pub mod cli;
pub mod config;
pub mod error;
pub mod flatfile;
pub mod harvester;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod parser;
pub mod platform;
pub mod progress;
pub mod rate_limit;
pub mod shutdown;
pub mod sink;
pub mod storage;
pub mod transfer;

pub use cli::*;
pub use config::Config;
pub use error::{HarvestError, Result, find_closest_match, format_error};
pub use flatfile::CsvSink;
pub use harvester::{FailurePolicy, HarvestConfig, Harvester, MultiHarvestReport};
pub use ledger::Ledger;
pub use model::*;
pub use parser::MessageParser;
pub use platform::{ExportClient, PlatformClient, PlatformError};
pub use shutdown::Shutdown;
pub use sink::{RecordSink, SharedSink, SinkBackend, open_sink};
pub use storage::Storage;

/// Default database filename
pub const DEFAULT_DB_NAME: &str = "harvest.db";

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Get the default data directory for chanharvest
#[must_use]
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("chanharvest")
}

/// Get the default database path
#[must_use]
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join(DEFAULT_DB_NAME)
}

/// Format an unsigned integer with thousands separators.
#[must_use]
pub fn format_number(value: u64) -> String {
    let mut out = String::with_capacity(24);

    for (idx, ch) in value.to_string().chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }

    out.chars().rev().collect()
}

/// Format a usize with thousands separators.
#[must_use]
pub fn format_count(value: usize) -> String {
    format_number(u64::try_from(value).unwrap_or(u64::MAX))
}

/// Format bytes into a human-friendly string.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < BYTES_PER_KB {
        format!("{bytes} B")
    } else if bytes < BYTES_PER_MB {
        format_bytes_with_unit(bytes, BYTES_PER_KB, "KB")
    } else if bytes < BYTES_PER_GB {
        format_bytes_with_unit(bytes, BYTES_PER_MB, "MB")
    } else {
        format_bytes_with_unit(bytes, BYTES_PER_GB, "GB")
    }
}

fn format_bytes_with_unit(bytes: u64, unit: u64, suffix: &str) -> String {
    let whole = bytes / unit;
    let tenths = (bytes % unit) * 10 / unit;
    format!("{whole}.{tenths} {suffix}")
}

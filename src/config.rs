//! Configuration system for chanharvest.
//!
//! Provides layered configuration from multiple sources:
//!
//! 1. **Compiled defaults** - Sensible defaults built into the binary
//! 2. **Config file** - `--config <path>` or `~/.config/chanharvest/config.toml`
//! 3. **Environment variables** - `HARVEST_*` prefix, `.env` included
//! 4. **CLI arguments** - Highest priority, always wins
//!
//! # Example Configuration File
//!
//! ```toml
//! [harvest]
//! channel = "Test"
//! message_limit = 500
//! include_groups = false
//!
//! [paths]
//! download_dir = "downloads"
//!
//! [sink]
//! backend = "sqlite"
//!
//! [transfer]
//! max_concurrent = 3
//! on_failure = "mark_done"
//!
//! [rate_limit]
//! max_retries = 5
//! max_wait_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HarvestError, Result};
use crate::harvester::{DEFAULT_MAX_CONCURRENT_TRANSFERS, FailurePolicy, HarvestConfig};
use crate::parser::DEFAULT_SECRET_PATTERN;
use crate::rate_limit::{DEFAULT_MAX_RETRIES, DEFAULT_MAX_WAIT, RateLimitPolicy};
use crate::sink::SinkBackend;

const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const LEDGER_DIR_NAME: &str = ".ledger";
const CSV_FILE_NAME: &str = "messages.csv";

/// Main configuration structure for chanharvest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// What to harvest.
    pub harvest: HarvestSection,
    /// File-system locations.
    pub paths: PathsConfig,
    /// Record persistence.
    pub sink: SinkConfig,
    /// Attachment downloads.
    pub transfer: TransferConfig,
    /// Rate-limit handling.
    pub rate_limit: RateLimitConfig,
    /// Secret extraction.
    pub extract: ExtractConfig,
    /// Log output.
    pub log: LogSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestSection {
    /// Channel title, `@username` or numeric id.
    /// Environment variable: `HARVEST_CHANNEL`
    pub channel: Option<String>,

    /// Stop after this many messages.
    /// Environment variable: `HARVEST_LIMIT`
    pub message_limit: Option<usize>,

    /// Also harvest small groups in all-dialogs mode.
    /// Environment variable: `HARVEST_INCLUDE_GROUPS`
    pub include_groups: bool,

    /// Harvest every channel the account can see.
    pub all_dialogs: bool,
}

/// Path configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for downloaded attachments.
    /// Environment variable: `HARVEST_DOWNLOAD_DIR`
    pub download_dir: Option<PathBuf>,

    /// Ledger directory, `<download_dir>/.ledger` when unset.
    pub ledger_dir: Option<PathBuf>,

    /// `SQLite` database file.
    /// Environment variable: `HARVEST_DB`
    pub db: Option<PathBuf>,

    /// CSV file, `<download_dir>/messages.csv` when unset.
    /// Environment variable: `HARVEST_CSV`
    pub csv: Option<PathBuf>,

    /// Desktop export directory served by the offline client.
    /// Environment variable: `HARVEST_EXPORT`
    pub export: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Environment variable: `HARVEST_SINK`
    pub backend: SinkBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent downloads.
    /// Environment variable: `HARVEST_MAX_CONCURRENT`
    pub max_concurrent: usize,

    /// Minimum milliseconds between progress lines per download.
    pub progress_interval_ms: u64,

    /// `mark_done` or `retry`.
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_retries: u32,
    /// Longest single wait honoured; longer requests are clamped.
    pub max_wait_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Regex applied to message text; the first capture group is stored.
    pub secret_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Environment variable: `HARVEST_LOG_LEVEL`
    pub level: String,
    /// pretty, compact or full.
    pub format: String,
    /// Environment variable: `HARVEST_LOG_FILE`
    pub file: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            progress_interval_ms: 1000,
            on_failure: FailurePolicy::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_wait_secs: DEFAULT_MAX_WAIT.as_secs(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            secret_pattern: DEFAULT_SECRET_PATTERN.to_string(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources except the CLI.
    ///
    /// An explicit `path` must exist; the user config file is optional.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable or invalid files and
    /// `InvalidSetting` for malformed environment values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::user_config_path().filter(|p| p.exists()) {
                Some(user) => Self::load_from_file(&user)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;

        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarvestError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = toml::from_str(&content).map_err(|e| HarvestError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Get the path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("chanharvest").join("config.toml"))
    }

    /// Apply `HARVEST_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` when a numeric or enum value does not parse.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(channel) = get("HARVEST_CHANNEL") {
            self.harvest.channel = Some(channel);
        }
        if let Some(limit) = get("HARVEST_LIMIT") {
            self.harvest.message_limit = Some(parse_env("HARVEST_LIMIT", &limit)?);
        }
        if let Some(flag) = get("HARVEST_INCLUDE_GROUPS") {
            self.harvest.include_groups = parse_flag(&flag);
        }

        if let Some(dir) = get("HARVEST_DOWNLOAD_DIR") {
            self.paths.download_dir = Some(PathBuf::from(dir));
        }
        if let Some(db) = get("HARVEST_DB") {
            self.paths.db = Some(PathBuf::from(db));
        }
        if let Some(csv) = get("HARVEST_CSV") {
            self.paths.csv = Some(PathBuf::from(csv));
        }
        if let Some(export) = get("HARVEST_EXPORT") {
            self.paths.export = Some(PathBuf::from(export));
        }

        if let Some(sink) = get("HARVEST_SINK") {
            self.sink.backend = sink
                .parse()
                .map_err(|e: String| HarvestError::invalid_setting("HARVEST_SINK", e))?;
        }
        if let Some(n) = get("HARVEST_MAX_CONCURRENT") {
            self.transfer.max_concurrent = parse_env("HARVEST_MAX_CONCURRENT", &n)?;
        }

        if let Some(level) = get("HARVEST_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(file) = get("HARVEST_LOG_FILE") {
            self.log.file = Some(PathBuf::from(file));
        }
        Ok(())
    }

    /// Root directory for attachments.
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.paths
            .download_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR))
    }

    /// Directory holding the per-channel ledgers.
    #[must_use]
    pub fn ledger_dir(&self) -> PathBuf {
        self.paths
            .ledger_dir
            .clone()
            .unwrap_or_else(|| self.download_dir().join(LEDGER_DIR_NAME))
    }

    /// Get the database path, using defaults if not configured.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.paths.db.clone().unwrap_or_else(crate::default_db_path)
    }

    #[must_use]
    pub fn csv_path(&self) -> PathBuf {
        self.paths
            .csv
            .clone()
            .unwrap_or_else(|| self.download_dir().join(CSV_FILE_NAME))
    }

    /// File the configured sink writes to.
    #[must_use]
    pub fn sink_path(&self) -> PathBuf {
        match self.sink.backend {
            SinkBackend::Sqlite => self.db_path(),
            SinkBackend::Csv => self.csv_path(),
        }
    }

    /// Runtime settings for the harvester.
    #[must_use]
    pub fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig {
            download_root: self.download_dir(),
            message_limit: self.harvest.message_limit,
            include_groups: self.harvest.include_groups,
            max_concurrent_transfers: self.transfer.max_concurrent,
            progress_interval: Duration::from_millis(self.transfer.progress_interval_ms),
            on_failure: self.transfer.on_failure,
            rate_limit: RateLimitPolicy {
                max_retries: self.rate_limit.max_retries,
                max_wait: Duration::from_secs(self.rate_limit.max_wait_secs),
            },
            secret_pattern: self.extract.secret_pattern.clone(),
        }
    }

    /// Write `config` to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarvestError::path_error("create directory", parent, e))?;
        }
        std::fs::write(path, self.to_toml()?)
            .map_err(|e| HarvestError::path_error("write", path, e))?;
        info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HarvestError::invalid_setting("config", e.to_string()))
    }
}

/// Truthy values accepted for boolean environment toggles.
#[must_use]
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| HarvestError::invalid_setting(key, format!("'{value}': {e}")))
}

//! CLI definitions for chanharvest.
//!
//! Uses clap for argument parsing with derive macros. Flags left unset fall
//! back to the config file and `HARVEST_*` environment variables.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::harvester::FailurePolicy;
use crate::sink::SinkBackend;

/// chanharvest - Resumable channel history and media harvester
#[derive(Parser, Debug)]
#[command(name = "chanharvest")]
#[command(version)]
#[command(about = "Resumable harvester for channel messages and attachments")]
#[command(long_about = r#"
chanharvest walks the history of a channel, stores every message in SQLite
or CSV, and downloads attached files. Progress is kept in a per-channel
ledger so an interrupted run picks up where it stopped.

Quick start:
  1. Export the channel with Telegram Desktop (JSON format)
  2. Run: chanharvest dialogs --export ./ChatExport
  3. Run: chanharvest harvest --export ./ChatExport --channel "News"
"#)]
pub struct Cli {
    /// Path to a config file (default: ~/.config/chanharvest/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Be quiet (errors only, no progress bars)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Also append logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest messages and attachments from one channel or all dialogs
    Harvest(HarvestArgs),

    /// List dialogs visible to the account
    Dialogs(DialogsArgs),

    /// Rebuild a channel's ledger from the records already persisted
    RebuildLedger(RebuildLedgerArgs),

    /// Show or manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
pub struct HarvestArgs {
    /// Channel title, @username or numeric id
    #[arg(long, short = 'c', conflicts_with = "all")]
    pub channel: Option<String>,

    /// Harvest every channel the account can see
    #[arg(long)]
    pub all: bool,

    /// Stop after this many messages per channel
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,

    /// With --all, also harvest small groups
    #[arg(long)]
    pub include_groups: bool,

    /// Root directory for downloaded attachments
    #[arg(long, short = 'd')]
    pub download_dir: Option<PathBuf>,

    /// Where to persist records
    #[arg(long)]
    pub sink: Option<SinkBackend>,

    /// `SQLite` database path (sqlite sink)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// CSV file path (csv sink)
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Concurrent attachment downloads
    #[arg(long, short = 'j')]
    pub max_concurrent: Option<usize>,

    /// What to do with messages whose attachment failed
    #[arg(long)]
    pub on_failure: Option<FailurePolicy>,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Where messages come from.
#[derive(Args, Debug, Default, Clone)]
pub struct SourceArgs {
    /// Telegram Desktop export directory (or its result.json)
    #[arg(long)]
    pub export: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DialogsArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Only list dialogs an all-dialogs harvest would visit
    #[arg(long)]
    pub channels_only: bool,

    /// Print the dialog list as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RebuildLedgerArgs {
    /// Channel title, @username or numeric id
    #[arg(long, short = 'c')]
    pub channel: String,

    /// Replace an existing ledger instead of refusing
    #[arg(long, short = 'F')]
    pub force: bool,

    /// Where the records were persisted
    #[arg(long)]
    pub sink: Option<SinkBackend>,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the effective configuration
    #[arg(long)]
    pub show: bool,

    /// Write the default config to the user config path
    #[arg(long)]
    pub init: bool,

    /// Print the user config path
    #[arg(long)]
    pub path: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

//! chanharvest - Resumable channel history and media harvester
//!
//! Main entry point for the chanharvest command-line tool.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use chanharvest::harvester::select_dialogs;
use chanharvest::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use chanharvest::progress::{LogObserver, NullObserver, ProgressObserver, ProgressSnapshot};
use chanharvest::rate_limit::RateLimiter;
use chanharvest::*;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<ExitCode> {
    if let Commands::Completions(args) = &cli.command {
        cmd_completions(args);
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(file) = &cli.log_file {
        config.log.file = Some(file.clone());
    }
    init_logging(&log_config(cli, &config)?)?;
    debug!(command = ?cli.command, "Starting");

    match &cli.command {
        Commands::Harvest(args) => cmd_harvest(cli, args, config).await,
        Commands::Dialogs(args) => cmd_dialogs(args, config).await,
        Commands::RebuildLedger(args) => cmd_rebuild_ledger(args, config).await,
        Commands::Config(args) => cmd_config(args, &config),
        Commands::Completions(_) => Ok(ExitCode::SUCCESS),
    }
}

fn log_config(cli: &Cli, config: &Config) -> Result<LogConfig> {
    let level: LogLevel = config
        .log
        .level
        .parse()
        .map_err(|e: String| HarvestError::invalid_setting("log.level", e))?;
    let format: LogFormat = config
        .log
        .format
        .parse()
        .map_err(|e: String| HarvestError::invalid_setting("log.format", e))?;

    Ok(LogConfig {
        level,
        format,
        colors: io::stderr().is_terminal(),
        file: config.log.file.clone(),
        ..LogConfig::default()
    }
    .with_verbosity(cli.quiet, cli.verbose))
}

/// CLI flags win over file and environment settings.
fn apply_harvest_args(config: &mut Config, args: &HarvestArgs) {
    if let Some(channel) = &args.channel {
        config.harvest.channel = Some(channel.clone());
        config.harvest.all_dialogs = false;
    }
    if args.all {
        config.harvest.all_dialogs = true;
    }
    if let Some(limit) = args.limit {
        config.harvest.message_limit = Some(limit);
    }
    if args.include_groups {
        config.harvest.include_groups = true;
    }
    if let Some(dir) = &args.download_dir {
        config.paths.download_dir = Some(dir.clone());
    }
    if let Some(backend) = args.sink {
        config.sink.backend = backend;
    }
    if let Some(db) = &args.db {
        config.paths.db = Some(db.clone());
    }
    if let Some(csv) = &args.csv {
        config.paths.csv = Some(csv.clone());
    }
    if let Some(n) = args.max_concurrent {
        config.transfer.max_concurrent = n;
    }
    if let Some(policy) = args.on_failure {
        config.transfer.on_failure = policy;
    }
    apply_source(config, &args.source);
}

fn apply_source(config: &mut Config, source: &SourceArgs) {
    if let Some(export) = &source.export {
        config.paths.export = Some(export.clone());
    }
}

fn open_client(config: &Config) -> Result<Arc<dyn PlatformClient>> {
    let path = config.paths.export.as_ref().ok_or_else(|| {
        HarvestError::invalid_setting(
            "paths.export",
            "no message source configured; pass --export <dir> or set HARVEST_EXPORT",
        )
    })?;
    let client = ExportClient::open(path)?;
    info!(export = %client.root().display(), "Using desktop export");
    Ok(Arc::new(client))
}

fn progress_observer(cli: &Cli) -> Arc<dyn ProgressObserver> {
    if cli.quiet {
        Arc::new(NullObserver)
    } else if io::stderr().is_terminal() {
        Arc::new(BarObserver::default())
    } else {
        Arc::new(LogObserver)
    }
}

/// One progress bar per in-flight download.
#[derive(Default)]
struct BarObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl BarObserver {
    fn new_bar(&self, snapshot: &ProgressSnapshot) -> ProgressBar {
        let template = if snapshot.total.is_some() {
            "{spinner:.green} {msg:24} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}"
        } else {
            "{spinner:.green} {msg:24} {bytes} {bytes_per_sec}"
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        let bar = self
            .multi
            .add(ProgressBar::new(snapshot.total.unwrap_or(0)));
        bar.set_style(style);
        bar.set_message(snapshot.label.clone());
        bar.enable_steady_tick(Duration::from_millis(200));
        bar
    }
}

impl ProgressObserver for BarObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let mut bars = self.bars.lock();
        if snapshot.finished {
            if let Some(bar) = bars.remove(&snapshot.label) {
                bar.finish_and_clear();
            }
            self.multi
                .println(format!("  {} {snapshot}", "✓".green()))
                .ok();
            return;
        }

        let bar = bars
            .entry(snapshot.label.clone())
            .or_insert_with(|| self.new_bar(snapshot));
        if let Some(total) = snapshot.total {
            bar.set_length(total);
        }
        bar.set_position(snapshot.received);
    }
}

async fn cmd_harvest(cli: &Cli, args: &HarvestArgs, mut config: Config) -> Result<ExitCode> {
    apply_harvest_args(&mut config, args);

    let client = open_client(&config)?;
    let ledger = Ledger::open(config.ledger_dir())?;
    let sink = open_sink(config.sink.backend, &config.sink_path())?;
    info!(sink = %sink.lock().describe(), "Records sink ready");

    let shutdown = Shutdown::new();
    shutdown.listen_for_ctrl_c();

    let mut harvester = Harvester::new(
        client,
        ledger,
        sink,
        config.harvest_config(),
        progress_observer(cli),
        shutdown,
    )?;

    if config.harvest.all_dialogs {
        let report = harvester.harvest_all().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }
        return Ok(if report.failed.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let channel = config.harvest.channel.clone().ok_or_else(|| {
        HarvestError::invalid_setting(
            "harvest.channel",
            "no channel given; pass --channel <name> or --all",
        )
    })?;
    let summary = harvester.harvest_channel(&channel).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &HarvestSummary) {
    let name = summary.channel_name.as_deref().unwrap_or("channel");
    let id = summary
        .channel_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();

    if summary.interrupted {
        println!("{} Interrupted '{}' ({})", "!".yellow().bold(), name.bold(), id);
    } else {
        println!("{} Harvested '{}' ({})", "✓".green().bold(), name.bold(), id);
    }
    print_counts(summary);
    if summary.interrupted {
        println!(
            "  {}",
            "Re-run the same command to resume; finished messages are skipped.".yellow()
        );
    }
}

fn print_counts(summary: &HarvestSummary) {
    println!(
        "  {:<20} {:>10}",
        "Messages seen:",
        format_count(summary.messages_seen)
    );
    println!(
        "  {:<20} {:>10}",
        "Already done:",
        format_count(summary.messages_skipped)
    );
    println!(
        "  {:<20} {:>10}",
        "Processed:",
        format_count(summary.messages_processed)
    );
    println!(
        "  {:<20} {:>10}  ({} already stored)",
        "Records stored:",
        format_count(summary.records_persisted),
        format_count(summary.records_already_present)
    );
    println!(
        "  {:<20} {:>10}  ({}, {} already on disk)",
        "Files downloaded:",
        format_count(summary.files_transferred),
        format_bytes(summary.bytes_transferred),
        format_count(summary.files_skipped)
    );
    if summary.failures() > 0 {
        println!(
            "  {:<20} {:>10}  ({} transfer, {} persistence)",
            "Failures:".red(),
            format_count(summary.failures()),
            summary.transfer_failures,
            summary.persistence_failures
        );
    }
    #[allow(clippy::cast_precision_loss)]
    let secs = summary.elapsed_ms as f64 / 1000.0;
    println!("  {:<20} {:>9.1}s", "Elapsed:", secs);
}

fn print_report(report: &MultiHarvestReport) {
    for summary in &report.channels {
        print_summary(summary);
        println!();
    }
    for (title, err) in &report.failed {
        println!("{} '{}': {}", "✗".red().bold(), title.bold(), err);
    }
    println!(
        "{} {} channels harvested, {} failed",
        "Total:".bold().cyan(),
        report.channels.len(),
        report.failed.len()
    );
    print_counts(&report.total);
}

async fn cmd_dialogs(args: &DialogsArgs, mut config: Config) -> Result<ExitCode> {
    apply_source(&mut config, &args.source);
    let client = open_client(&config)?;
    let limiter = RateLimiter::new(config.harvest_config().rate_limit, Shutdown::new());

    let mut dialogs = limiter
        .execute("list dialogs", || client.list_dialogs())
        .await?;
    if args.channels_only {
        dialogs = select_dialogs(dialogs, config.harvest.include_groups);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&dialogs)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", "Dialogs".bold().cyan());
    println!("{}", "─".repeat(60));
    for dialog in &dialogs {
        println!(
            "  {:<10} {:>16}  {}",
            dialog.kind.to_string().dimmed(),
            dialog.id.as_str(),
            dialog.title
        );
    }
    println!("{}", "─".repeat(60));
    println!("  {} dialogs", format_count(dialogs.len()));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_rebuild_ledger(args: &RebuildLedgerArgs, mut config: Config) -> Result<ExitCode> {
    apply_source(&mut config, &args.source);
    if let Some(backend) = args.sink {
        config.sink.backend = backend;
    }

    let client = open_client(&config)?;
    let ledger = Ledger::open(config.ledger_dir())?;
    let sink_path = config.sink_path();
    let sink = open_sink(config.sink.backend, &sink_path)?;

    let mut harvester = Harvester::new(
        client,
        ledger,
        sink,
        config.harvest_config(),
        Arc::new(NullObserver),
        Shutdown::new(),
    )?;
    let count = harvester.rebuild_ledger(&args.channel, args.force).await?;

    println!(
        "{} Rebuilt ledger for '{}' with {} message ids from {}",
        "✓".green().bold(),
        args.channel,
        format_count(count),
        sink_path.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(args: &ConfigArgs, config: &Config) -> Result<ExitCode> {
    let user_path = Config::user_config_path();

    if args.path {
        match &user_path {
            Some(path) => println!("{}", path.display()),
            None => println!("{}", "No config directory on this platform".yellow()),
        }
    }

    if args.init {
        let path = user_path
            .as_ref()
            .context("No config directory on this platform")?;
        if path.exists() {
            println!(
                "{} Config already exists at {}",
                "!".yellow().bold(),
                path.display()
            );
        } else {
            Config::default().save_to(path)?;
            println!(
                "{} Wrote default config to {}",
                "✓".green().bold(),
                path.display()
            );
        }
    }

    if args.show || !(args.path || args.init) {
        print!("{}", config.to_toml()?);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_completions(args: &CompletionsArgs) {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "chanharvest", &mut io::stdout());
}

fn report_error(err: &anyhow::Error) {
    let harvest_err = err.chain().find_map(|e| e.downcast_ref::<HarvestError>());
    let hint: Vec<&str> = harvest_err.and_then(HarvestError::suggestion).into_iter().collect();

    // Context layers added on top of a typed error carry the explanation.
    let explanation = if err.downcast_ref::<HarvestError>().is_some() {
        String::new()
    } else {
        err.chain()
            .skip(1)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    };

    eprintln!("{}", format_error(&err.to_string(), &explanation, &hint));
}

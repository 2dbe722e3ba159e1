//! Channel harvester.
//!
//! Drives one channel through `Resolving -> Iterating -> Draining -> Done`:
//! resolve the identifier, walk the history in platform order, skip ids the
//! ledger already has, persist each new record, hand attachments to the
//! transfer manager, and mark an id done only once its record is stored and
//! its transfer (if any) reached a terminal outcome.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{HarvestError, Result};
use crate::ledger::Ledger;
use crate::model::{
    ChannelHandle, ChannelId, DialogInfo, DialogKind, HarvestSummary, TransferOutcome,
};
use crate::parser::{DEFAULT_SECRET_PATTERN, MessageParser};
use crate::platform::{PlatformClient, PlatformError};
use crate::progress::{DEFAULT_PROGRESS_INTERVAL, ProgressObserver};
use crate::rate_limit::{RateLimitPolicy, RateLimiter, classify};
use crate::shutdown::Shutdown;
use crate::sink::{AppendOutcome, SharedSink};
use crate::transfer::{TransferJob, TransferManager};

/// Default number of attachments downloaded at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// What to do with a message whose attachment could not be fetched.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the message done; the failure is only kept in the `.failed` file.
    #[default]
    MarkDone,
    /// Leave the message unmarked so the next run tries again.
    Retry,
}

/// Runtime settings for a harvest.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub download_root: PathBuf,
    pub message_limit: Option<usize>,
    pub include_groups: bool,
    pub max_concurrent_transfers: usize,
    pub progress_interval: Duration,
    pub on_failure: FailurePolicy,
    pub rate_limit: RateLimitPolicy,
    pub secret_pattern: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("downloads"),
            message_limit: None,
            include_groups: false,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            on_failure: FailurePolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            secret_pattern: DEFAULT_SECRET_PATTERN.to_string(),
        }
    }
}

/// Result of an all-dialogs run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiHarvestReport {
    pub channels: Vec<HarvestSummary>,
    /// `(title, error)` for channels that could not be harvested.
    pub failed: Vec<(String, String)>,
    pub total: HarvestSummary,
}

/// Dialogs worth harvesting: channels and megagroups, plus small groups on request.
#[must_use]
pub fn select_dialogs(dialogs: Vec<DialogInfo>, include_groups: bool) -> Vec<DialogInfo> {
    dialogs
        .into_iter()
        .filter(|d| d.kind.is_channel() || (include_groups && d.kind == DialogKind::Group))
        .collect()
}

type TransferResult = (i64, String, TransferOutcome);

/// Orchestrates harvesting of one or more channels.
pub struct Harvester {
    client: Arc<dyn PlatformClient>,
    limiter: RateLimiter,
    ledger: Ledger,
    sink: SharedSink,
    parser: MessageParser,
    transfers: Arc<TransferManager>,
    permits: Arc<Semaphore>,
    shutdown: Shutdown,
    config: HarvestConfig,
}

impl Harvester {
    /// Wire up a harvester.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` for a bad secret pattern or a zero
    /// transfer limit.
    pub fn new(
        client: Arc<dyn PlatformClient>,
        ledger: Ledger,
        sink: SharedSink,
        config: HarvestConfig,
        observer: Arc<dyn ProgressObserver>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        if config.max_concurrent_transfers == 0 {
            return Err(HarvestError::invalid_setting(
                "transfer.max_concurrent",
                "must be at least 1",
            ));
        }
        let parser = MessageParser::with_pattern(&config.secret_pattern)?;
        let limiter = RateLimiter::new(config.rate_limit, shutdown.clone());
        let transfers = Arc::new(TransferManager::new(
            Arc::clone(&client),
            limiter.clone(),
            config.download_root.clone(),
            observer,
            config.progress_interval,
        ));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_transfers));

        Ok(Self {
            client,
            limiter,
            ledger,
            sink,
            parser,
            transfers,
            permits,
            shutdown,
            config,
        })
    }

    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub fn sink(&self) -> SharedSink {
        Arc::clone(&self.sink)
    }

    /// Resolve `identifier` through the rate limiter.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound`, `ChannelForbidden`, or a rate-limit failure.
    pub async fn resolve(&self, identifier: &str) -> Result<ChannelHandle> {
        let client = &self.client;
        self.limiter
            .execute("resolve channel", || client.resolve_channel(identifier))
            .await
    }

    /// Harvest a single channel by name, `@username` or id.
    ///
    /// # Errors
    ///
    /// Fails the run on resolution errors, rate-limit exhaustion while
    /// fetching messages, or ledger write errors. Per-message persistence
    /// and per-file transfer failures are counted, not raised.
    pub async fn harvest_channel(&mut self, identifier: &str) -> Result<HarvestSummary> {
        info!(channel = identifier, "Resolving channel");
        let handle = match self.resolve(identifier).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(channel = identifier, "Could not resolve channel: {err}");
                return Err(err);
            }
        };
        self.harvest_handle(&handle).await
    }

    /// Harvest every selected dialog, one after another.
    ///
    /// # Errors
    ///
    /// Only fails if the dialog list cannot be fetched; per-channel failures
    /// are collected in the report.
    pub async fn harvest_all(&mut self) -> Result<MultiHarvestReport> {
        let client = &self.client;
        let dialogs = self
            .limiter
            .execute("list dialogs", || client.list_dialogs())
            .await?;
        let selected = select_dialogs(dialogs, self.config.include_groups);
        info!(count = selected.len(), "Harvesting all dialogs");

        let mut report = MultiHarvestReport::default();
        for dialog in selected {
            if self.shutdown.is_triggered() {
                report.total.interrupted = true;
                break;
            }
            let handle = ChannelHandle {
                id: dialog.id,
                title: dialog.title,
                kind: dialog.kind,
            };
            match self.harvest_handle(&handle).await {
                Ok(summary) => {
                    report.total.absorb(&summary);
                    report.channels.push(summary);
                }
                Err(HarvestError::Cancelled { .. }) => {
                    report.total.interrupted = true;
                    break;
                }
                Err(err) => {
                    error!(channel = %handle.title, "Channel harvest failed: {err}");
                    report.failed.push((handle.title.clone(), err.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Replace the channel's ledger with the ids already in the sink.
    ///
    /// # Errors
    ///
    /// Refuses to overwrite a non-empty ledger unless `force` is set.
    pub async fn rebuild_ledger(&mut self, identifier: &str, force: bool) -> Result<usize> {
        let handle = self.resolve(identifier).await?;
        self.ledger.load(&handle.id)?;
        if !force && !self.ledger.is_empty(&handle.id) {
            return Err(HarvestError::invalid_setting(
                "rebuild-ledger",
                format!(
                    "ledger for '{}' already has {} entries (use --force to replace it)",
                    handle.title,
                    self.ledger.len(&handle.id)
                ),
            ));
        }
        let ids = self.sink.lock().message_ids(&handle.id)?;
        self.ledger.rebuild_from(&handle.id, ids)
    }

    async fn harvest_handle(&mut self, handle: &ChannelHandle) -> Result<HarvestSummary> {
        let started = Instant::now();
        let mut summary = HarvestSummary {
            channel_id: Some(handle.id.clone()),
            channel_name: Some(handle.title.clone()),
            ..Default::default()
        };

        let known = self.ledger.load(&handle.id)?;
        info!(
            channel = %handle.title,
            id = %handle.id,
            known,
            "Harvesting channel"
        );

        let client = &self.client;
        let limit = self.config.message_limit;
        let mut cursor = self
            .limiter
            .execute("open message history", || client.iter_messages(handle, limit))
            .await?;

        let mut pending: JoinSet<TransferResult> = JoinSet::new();
        let mut fatal: Option<HarvestError> = None;
        let mut attempt = 0;

        // Iterating
        loop {
            if self.shutdown.is_triggered() {
                info!(channel = %handle.title, "Stop requested, no further messages");
                summary.interrupted = true;
                break;
            }

            while let Some(joined) = pending.try_join_next() {
                if let Err(err) = self.settle(&handle.id, joined, &mut summary) {
                    fatal = Some(err);
                }
            }
            if fatal.is_some() {
                break;
            }

            let raw = match cursor.next().await {
                Ok(Some(raw)) => {
                    attempt = 0;
                    raw
                }
                Ok(None) => break,
                Err(PlatformError::RateLimited { wait }) => {
                    attempt += 1;
                    match self.limiter.backoff("fetch messages", attempt, wait).await {
                        Ok(()) => continue,
                        Err(HarvestError::Cancelled { .. }) => {
                            summary.interrupted = true;
                            break;
                        }
                        Err(err) => {
                            fatal = Some(err);
                            break;
                        }
                    }
                }
                Err(err) => {
                    fatal = Some(classify("fetch messages", err));
                    break;
                }
            };

            summary.messages_seen += 1;
            if self.ledger.contains(&handle.id, raw.id) {
                debug!(message_id = raw.id, "Already processed, skipping");
                summary.messages_skipped += 1;
                continue;
            }

            let record = self.parser.parse(handle, &raw);
            let appended = self.sink.lock().append(&record);
            match appended {
                Ok(AppendOutcome::Inserted) => summary.records_persisted += 1,
                Ok(AppendOutcome::AlreadyPresent) => summary.records_already_present += 1,
                Err(err) if err.is_fatal_for_run() => {
                    fatal = Some(err);
                    break;
                }
                Err(err) => {
                    error!(
                        channel = %handle.title,
                        message_id = raw.id,
                        file = record.attachment_name.as_deref().unwrap_or("-"),
                        "Failed to persist record, leaving message unmarked: {err}"
                    );
                    summary.persistence_failures += 1;
                    continue;
                }
            }

            let Some(attachment) = raw.attachment else {
                if let Err(err) = self.mark_done(&handle.id, raw.id, &mut summary) {
                    fatal = Some(err);
                    break;
                }
                continue;
            };

            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    fatal = Some(HarvestError::Other(anyhow::anyhow!(
                        "transfer pool closed: {e}"
                    )));
                    break;
                }
            };
            let job = TransferJob {
                channel_name: handle.title.clone(),
                message_id: raw.id,
                attachment,
            };
            let manager = Arc::clone(&self.transfers);
            debug!(message_id = raw.id, file = %job.file_name(), "Queued transfer");
            pending.spawn(async move {
                let _permit = permit;
                let outcome = manager.transfer(&job).await;
                (job.message_id, job.file_name(), outcome)
            });
        }

        // Draining
        if !pending.is_empty() {
            info!(
                channel = %handle.title,
                outstanding = pending.len(),
                "Waiting for transfers to finish"
            );
        }
        while let Some(joined) = pending.join_next().await {
            if let Err(err) = self.settle(&handle.id, joined, &mut summary) {
                error!(channel = %handle.title, "{err}");
                fatal.get_or_insert(err);
            }
        }

        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if let Some(err) = fatal {
            error!(channel = %handle.title, "Harvest failed: {err}");
            return Err(err);
        }

        info!(
            channel = %handle.title,
            seen = summary.messages_seen,
            skipped = summary.messages_skipped,
            persisted = summary.records_persisted,
            files = summary.files_transferred,
            failures = summary.failures(),
            interrupted = summary.interrupted,
            "Harvest finished"
        );
        Ok(summary)
    }

    fn mark_done(
        &mut self,
        channel: &ChannelId,
        message_id: i64,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        self.ledger.mark_done(channel, message_id)?;
        summary.messages_processed += 1;
        Ok(())
    }

    /// Apply a finished transfer to the ledger and summary.
    fn settle(
        &mut self,
        channel: &ChannelId,
        joined: std::result::Result<TransferResult, JoinError>,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        let (message_id, file, outcome) = match joined {
            Ok(result) => result,
            Err(err) => {
                // Message stays unmarked; the next run retries it.
                error!(channel = %channel, "Transfer task ended abnormally: {err}");
                summary.transfer_failures += 1;
                return Ok(());
            }
        };

        match outcome {
            TransferOutcome::Completed { bytes, .. } => {
                summary.files_transferred += 1;
                summary.bytes_transferred += bytes;
                self.mark_done(channel, message_id, summary)
            }
            TransferOutcome::Skipped(_) => {
                summary.files_skipped += 1;
                self.mark_done(channel, message_id, summary)
            }
            TransferOutcome::Failed(err) => {
                summary.transfer_failures += 1;
                error!(
                    channel = %channel,
                    message_id,
                    file = %file,
                    "Attachment failed: {err}"
                );
                if let Err(e) = self
                    .ledger
                    .record_failure(channel, message_id, &file, &err.to_string())
                {
                    warn!(channel = %channel, message_id, "Could not record failure: {e}");
                }

                if matches!(err, HarvestError::Cancelled { .. }) {
                    return Ok(());
                }
                match self.config.on_failure {
                    FailurePolicy::MarkDone => self.mark_done(channel, message_id, summary),
                    FailurePolicy::Retry => Ok(()),
                }
            }
        }
    }
}

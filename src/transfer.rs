//! Media transfer manager.
//!
//! Downloads one attachment to
//! `<download_root>/<sanitized channel>/<sanitized file name>`:
//!
//! 1. an existing destination is a skip, the platform is not contacted
//! 2. bytes go to a hidden `.<name>.part` file next to the destination
//! 3. rate-limit signals restart the download after the requested wait
//! 4. the temp file is renamed into place only after a complete download
//!
//! Failures are returned as [`TransferOutcome::Failed`], never raised.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::HarvestError;
use crate::model::{AttachmentRef, SkipReason, TransferOutcome};
use crate::parser::synthetic_file_name;
use crate::platform::{PlatformClient, PlatformError};
use crate::progress::{ProgressObserver, ProgressTracker};
use crate::rate_limit::{RateLimiter, classify};

const UNNAMED: &str = "unnamed";
const TEMP_SUFFIX: &str = ".part";
/// Room left for the temp file's leading dot and suffix under NAME_MAX.
const MAX_NAME_BYTES: usize = 255 - 1 - TEMP_SUFFIX.len();
const MAX_EXTENSION_BYTES: usize = 16;

/// One attachment to fetch.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub channel_name: String,
    pub message_id: i64,
    pub attachment: AttachmentRef,
}

impl TransferJob {
    /// File name before sanitizing.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.attachment
            .file_name
            .clone()
            .unwrap_or_else(|| synthetic_file_name(self.message_id))
    }
}

/// Make `name` safe as a single path component on common file systems.
///
/// Reserved characters and control characters become `_`, whitespace runs
/// collapse to one space, leading/trailing whitespace and trailing dots are
/// dropped. Empty results, `.` and `..` become `unnamed`. Long names are
/// cut so the temp file still fits in one path component, keeping a short
/// extension.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        let reserved = matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|');
        out.push(if reserved || c.is_control() { '_' } else { c });
    }

    let trimmed = out.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        UNNAMED.to_string()
    } else {
        cap_length(trimmed)
    }
}

fn cap_length(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= MAX_EXTENSION_BYTES => {
            (stem, Some(ext))
        }
        _ => (name, None),
    };
    let budget = MAX_NAME_BYTES - ext.map_or(0, |e| e.len() + 1);
    let mut end = budget.min(stem.len());
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    let stem = match stem[..end].trim_end_matches(['.', ' ']) {
        "" => UNNAMED,
        stem => stem,
    };
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

/// Hidden sibling of `dest` that receives bytes while downloading.
#[must_use]
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map_or_else(|| UNNAMED.into(), |n| n.to_string_lossy().into_owned());
    dest.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
}

/// Downloads attachments with skip, retry and atomic placement.
pub struct TransferManager {
    client: Arc<dyn PlatformClient>,
    limiter: RateLimiter,
    download_root: PathBuf,
    observer: Arc<dyn ProgressObserver>,
    progress_interval: Duration,
    in_flight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransferManager {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        limiter: RateLimiter,
        download_root: impl Into<PathBuf>,
        observer: Arc<dyn ProgressObserver>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            client,
            limiter,
            download_root: download_root.into(),
            observer,
            progress_interval,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Final location of the job's file.
    #[must_use]
    pub fn destination(&self, job: &TransferJob) -> PathBuf {
        self.download_root
            .join(sanitize_file_name(&job.channel_name))
            .join(sanitize_file_name(&job.file_name()))
    }

    /// Run one job to a terminal outcome.
    pub async fn transfer(&self, job: &TransferJob) -> TransferOutcome {
        let dest = self.destination(job);

        // Two messages may name the same file; only one may write it at a time.
        let slot = self
            .in_flight
            .lock()
            .entry(dest.clone())
            .or_default()
            .clone();
        let outcome = {
            let _guard = slot.lock().await;
            self.transfer_to(job, &dest).await
        };
        drop(slot);
        self.in_flight
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        match &outcome {
            TransferOutcome::Completed { path, bytes } => info!(
                message_id = job.message_id,
                file = %path.display(),
                bytes,
                "Transfer complete"
            ),
            TransferOutcome::Skipped(reason) => info!(
                message_id = job.message_id,
                file = %dest.display(),
                "Skipping download: {reason}"
            ),
            TransferOutcome::Failed(err) => warn!(
                channel = %job.channel_name,
                message_id = job.message_id,
                file = %dest.display(),
                "Transfer failed: {err}"
            ),
        }
        outcome
    }

    async fn transfer_to(&self, job: &TransferJob, dest: &Path) -> TransferOutcome {
        match tokio::fs::try_exists(dest).await {
            Ok(true) => {
                return TransferOutcome::Skipped(SkipReason::AlreadyExists {
                    path: dest.to_path_buf(),
                });
            }
            Ok(false) => {}
            Err(e) => return TransferOutcome::Failed(HarvestError::path_error("check", dest, e)),
        }

        if let Some(dir) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return TransferOutcome::Failed(HarvestError::path_error(
                    "create directory",
                    dir,
                    e,
                ));
            }
        }

        let tmp = temp_path_for(dest);
        match tokio::fs::try_exists(&tmp).await {
            Ok(true) => {
                debug!(file = %tmp.display(), "Removing stale partial download");
                if let Err(e) = tokio::fs::remove_file(&tmp).await {
                    return TransferOutcome::Failed(HarvestError::path_error(
                        "remove stale temp file",
                        &tmp,
                        e,
                    ));
                }
            }
            Ok(false) => {}
            Err(e) => return TransferOutcome::Failed(HarvestError::path_error("check", &tmp, e)),
        }

        let file_name = dest
            .file_name()
            .map_or_else(|| job.file_name(), |n| n.to_string_lossy().into_owned());
        let bytes = match self.download_with_retry(job, &tmp, &file_name).await {
            Ok(bytes) => bytes,
            Err(err) => {
                remove_quietly(&tmp).await;
                return TransferOutcome::Failed(err);
            }
        };

        if let Err(e) = tokio::fs::rename(&tmp, dest).await {
            remove_quietly(&tmp).await;
            return TransferOutcome::Failed(HarvestError::path_error("rename", &tmp, e));
        }

        TransferOutcome::Completed {
            path: dest.to_path_buf(),
            bytes,
        }
    }

    /// Retry loop for one download. The tracker borrows mutably into each
    /// call, so the controller's single-step `backoff` is used directly.
    async fn download_with_retry(
        &self,
        job: &TransferJob,
        tmp: &Path,
        file_name: &str,
    ) -> Result<u64, HarvestError> {
        let operation = format!("download of '{file_name}'");
        let mut tracker =
            ProgressTracker::new(file_name, Arc::clone(&self.observer), self.progress_interval);
        let mut attempt = 0;

        loop {
            match self.client.download(&job.attachment, tmp, &mut tracker).await {
                Ok(bytes) => return Ok(bytes),
                Err(PlatformError::RateLimited { wait }) => {
                    attempt += 1;
                    remove_quietly(tmp).await;
                    self.limiter.backoff(&operation, attempt, wait).await?;
                    tracker.restart();
                }
                Err(err) => {
                    let err = classify(&operation, err);
                    return Err(HarvestError::Transfer {
                        message_id: job.message_id,
                        file: file_name.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(file = %path.display(), "Could not remove temp file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::ScriptedClient;
    use crate::progress::NullObserver;
    use crate::rate_limit::RateLimitPolicy;
    use crate::shutdown::Shutdown;
    use tempfile::TempDir;

    fn job(name: Option<&str>) -> TransferJob {
        TransferJob {
            channel_name: "Test".into(),
            message_id: 42,
            attachment: AttachmentRef {
                locator: "files/report.pdf".into(),
                file_name: name.map(str::to_string),
                size: None,
                mime_type: None,
            },
        }
    }

    fn manager(client: Arc<ScriptedClient>, root: &Path) -> TransferManager {
        TransferManager::new(
            client,
            RateLimiter::new(
                RateLimitPolicy {
                    max_retries: 2,
                    max_wait: Duration::from_secs(30),
                },
                Shutdown::new(),
            ),
            root,
            Arc::new(NullObserver),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_sanitize_reserved_characters() {
        let name = sanitize_file_name("My/Group:Name");
        assert!(!name.is_empty());
        assert!(!name.contains(['/', ':', '\\', '*', '?', '"', '<', '>', '|']));
        assert_eq!(name, "My_Group_Name");
    }

    #[test]
    fn test_sanitize_whitespace_and_edges() {
        assert_eq!(sanitize_file_name("  a \t\n b  "), "a b");
        assert_eq!(sanitize_file_name("name. . "), "name");
        assert_eq!(sanitize_file_name("bell\u{7}.txt"), "bell_.txt");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name("   "), "unnamed");
        assert_eq!(sanitize_file_name(".."), "unnamed");
        assert_eq!(sanitize_file_name("."), "unnamed");
    }

    #[test]
    fn test_sanitize_caps_long_names() {
        let long = format!("{}.pdf", "a".repeat(300));
        let name = sanitize_file_name(&long);
        assert_eq!(name.len(), MAX_NAME_BYTES);
        assert!(name.ends_with(".pdf"));

        let tmp = temp_path_for(&Path::new("/data").join(&name));
        assert!(tmp.file_name().unwrap().len() <= 255);

        // Cut lands on a char boundary
        let wide = sanitize_file_name(&"é".repeat(200));
        assert!(wide.len() <= MAX_NAME_BYTES);
        assert!(wide.chars().all(|c| c == 'é'));

        let odd_ext = sanitize_file_name(&format!("{}.{}", "b".repeat(10), "x".repeat(300)));
        assert!(odd_ext.len() <= MAX_NAME_BYTES);
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let tmp = temp_path_for(Path::new("/data/Test/report.pdf"));
        assert_eq!(tmp, Path::new("/data/Test/.report.pdf.part"));
    }

    #[test]
    fn test_destination_uses_synthetic_name() {
        let dir = TempDir::new().unwrap();
        let m = manager(Arc::new(ScriptedClient::new()), dir.path());
        assert_eq!(
            m.destination(&job(None)),
            dir.path().join("Test").join("media_from_message_42")
        );
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped_without_download() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        let m = manager(Arc::clone(&client), dir.path());
        let dest = m.destination(&job(Some("report.pdf")));
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"already here").unwrap();

        let outcome = m.transfer(&job(Some("report.pdf"))).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Skipped(SkipReason::AlreadyExists { .. })
        ));
        assert!(client.downloads().is_empty());
        assert_eq!(std::fs::read(&dest).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_unreadable_destination_fails_without_download() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        let m = manager(Arc::clone(&client), dir.path());
        // Channel directory is a plain file, so the existence check errors
        std::fs::write(dir.path().join("Test"), b"not a directory").unwrap();

        let outcome = m.transfer(&job(Some("report.pdf"))).await;
        match outcome {
            TransferOutcome::Failed(err) => {
                assert!(err.to_string().starts_with("Failed to check"), "{err}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(client.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_stale_temp_is_replaced() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().with_file("files/report.pdf", b"full body"));
        let m = manager(Arc::clone(&client), dir.path());
        let dest = m.destination(&job(Some("report.pdf")));
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(temp_path_for(&dest), b"half").unwrap();

        let outcome = m.transfer(&job(Some("report.pdf"))).await;
        assert!(matches!(outcome, TransferOutcome::Completed { bytes: 9, .. }));
        assert_eq!(std::fs::read(&dest).unwrap(), b"full body");
        assert!(!temp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn test_failure_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        client.fail_download(
            "files/report.pdf",
            PlatformError::Transport("connection reset".into()),
        );
        let m = manager(Arc::clone(&client), dir.path());
        let dest = m.destination(&job(Some("report.pdf")));

        let outcome = m.transfer(&job(Some("report.pdf"))).await;
        match outcome {
            TransferOutcome::Failed(HarvestError::Transfer { message_id, file, .. }) => {
                assert_eq!(message_id, 42);
                assert_eq!(file, "report.pdf");
            }
            other => panic!("expected transfer failure, got {other:?}"),
        }
        assert!(!dest.exists());
        assert!(!temp_path_for(&dest).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_download_is_retried() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().with_file("files/report.pdf", b"ok"));
        client.fail_download(
            "files/report.pdf",
            PlatformError::RateLimited {
                wait: Duration::from_secs(5),
            },
        );
        let m = manager(Arc::clone(&client), dir.path());

        let outcome = m.transfer(&job(Some("report.pdf"))).await;
        assert!(matches!(outcome, TransferOutcome::Completed { bytes: 2, .. }));
        assert_eq!(client.download_count("files/report.pdf"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_fails_job() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        for _ in 0..3 {
            client.fail_download(
                "files/report.pdf",
                PlatformError::RateLimited {
                    wait: Duration::from_secs(1),
                },
            );
        }
        let m = manager(Arc::clone(&client), dir.path());

        let outcome = m.transfer(&job(Some("report.pdf"))).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed(HarvestError::RateLimitExhausted { .. })
        ));
        assert_eq!(client.download_count("files/report.pdf"), 3);
    }

    #[tokio::test]
    async fn test_same_destination_is_downloaded_once() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        let m = Arc::new(manager(Arc::clone(&client), dir.path()));

        let a = tokio::spawn({
            let m = Arc::clone(&m);
            async move { m.transfer(&job(Some("report.pdf"))).await }
        });
        let b = tokio::spawn({
            let m = Arc::clone(&m);
            async move { m.transfer(&job(Some("report.pdf"))).await }
        });
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(client.download_count("files/report.pdf"), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, TransferOutcome::Skipped(_)))
                .count(),
            1
        );
    }
}

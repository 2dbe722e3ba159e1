//! Per-transfer progress tracking.
//!
//! The transport calls [`ProgressTracker::update`] every few kilobytes. The
//! tracker computes throughput, percentage and ETA, and forwards a
//! [`ProgressSnapshot`] to its observer only when one of these holds:
//!
//! - the throttle interval has passed since the last emission
//! - the percentage entered a new decile
//! - the transfer completed (emitted exactly once)

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::format_bytes;

/// Default minimum time between two progress emissions.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Below this rate the ETA is reported as unknown.
const MIN_RATE_FOR_ETA: f64 = 1.0;

const LABEL_WIDTH: usize = 24;

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub label: String,
    pub received: u64,
    pub total: Option<u64>,
    pub percent: Option<f64>,
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    /// Set on the single completion emission.
    pub finished: bool,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label: String = self.label.chars().take(LABEL_WIDTH).collect();
        let ellipsis = if self.label.chars().count() > LABEL_WIDTH {
            "..."
        } else {
            ""
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rate = format_bytes(self.bytes_per_sec.max(0.0) as u64);

        match (self.total, self.percent) {
            (Some(total), Some(percent)) => {
                write!(
                    f,
                    "[{label}{ellipsis}] {percent:5.1}% ({} / {}) @ {rate}/s",
                    format_bytes(self.received),
                    format_bytes(total),
                )?;
                match self.eta {
                    Some(eta) => write!(f, " ETA {}s", eta.as_secs()),
                    None => write!(f, " ETA --"),
                }
            }
            _ => write!(
                f,
                "[{label}{ellipsis}] {} @ {rate}/s",
                format_bytes(self.received)
            ),
        }
    }
}

/// Receives throttled progress emissions.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

/// Writes progress lines through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if snapshot.finished {
            info!(transfer = %snapshot.label, "Downloaded {snapshot}");
        } else {
            info!(transfer = %snapshot.label, "Downloading {snapshot}");
        }
    }
}

/// Discards all emissions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
}

/// Stateful progress accounting for a single transfer.
pub struct ProgressTracker {
    label: String,
    observer: Arc<dyn ProgressObserver>,
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
    last_decile: Option<u8>,
    received: u64,
    total: Option<u64>,
    finished: bool,
    emissions: usize,
}

impl ProgressTracker {
    pub fn new(
        label: impl Into<String>,
        observer: Arc<dyn ProgressObserver>,
        interval: Duration,
    ) -> Self {
        Self::started_at(label, observer, interval, Instant::now())
    }

    /// Tracker whose clock starts at `started` (for deterministic tests).
    pub fn started_at(
        label: impl Into<String>,
        observer: Arc<dyn ProgressObserver>,
        interval: Duration,
        started: Instant,
    ) -> Self {
        Self {
            label: label.into(),
            observer,
            interval,
            started,
            last_emit: None,
            last_decile: None,
            received: 0,
            total: None,
            finished: false,
            emissions: 0,
        }
    }

    /// Record a byte-count update. Returns `true` if an emission happened.
    pub fn update(&mut self, received: u64, total: Option<u64>) -> bool {
        self.update_at(Instant::now(), received, total)
    }

    /// Same as [`update`](Self::update) with an explicit clock reading.
    pub fn update_at(&mut self, now: Instant, received: u64, total: Option<u64>) -> bool {
        if self.finished {
            return false;
        }

        // A zero total means the transport does not know the size.
        let total = total.filter(|&t| t > 0);
        self.received = received;
        self.total = total;

        let snapshot = self.snapshot_at(now);
        let decile = snapshot.percent.map(percent_decile);
        let complete = total.is_some_and(|t| received >= t);

        let due_by_time = self
            .last_emit
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        let due_by_decile = match (decile, self.last_decile) {
            (Some(current), Some(last)) => current > last,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !(due_by_time || due_by_decile || complete) {
            return false;
        }

        self.last_emit = Some(now);
        if let Some(d) = decile {
            self.last_decile = Some(d);
        }
        if complete {
            self.finished = true;
        }
        self.emissions += 1;

        let snapshot = ProgressSnapshot {
            finished: complete,
            ..snapshot
        };
        self.observer.on_progress(&snapshot);
        true
    }

    /// Forget progress from an aborted attempt before retrying from scratch.
    pub fn restart(&mut self) {
        self.restart_at(Instant::now());
    }

    pub fn restart_at(&mut self, now: Instant) {
        self.started = now;
        self.last_emit = None;
        self.last_decile = None;
        self.received = 0;
        self.finished = false;
    }

    /// Current view without emitting.
    #[must_use]
    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started);
        let secs = elapsed.as_secs_f64().max(1e-6);
        #[allow(clippy::cast_precision_loss)]
        let bytes_per_sec = self.received as f64 / secs;

        #[allow(clippy::cast_precision_loss)]
        let percent = self
            .total
            .map(|t| (self.received as f64 * 100.0 / t as f64).min(100.0));

        let eta = self.total.and_then(|t| {
            if bytes_per_sec < MIN_RATE_FOR_ETA {
                return None;
            }
            #[allow(clippy::cast_precision_loss)]
            let remaining = t.saturating_sub(self.received) as f64;
            Some(Duration::from_secs_f64(remaining / bytes_per_sec))
        });

        ProgressSnapshot {
            label: self.label.clone(),
            received: self.received,
            total: self.total,
            percent,
            bytes_per_sec,
            eta,
            elapsed,
            finished: self.finished,
        }
    }

    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of emissions sent to the observer so far.
    #[must_use]
    pub const fn emissions(&self) -> usize {
        self.emissions
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_decile(percent: f64) -> u8 {
    (percent / 10.0).floor().clamp(0.0, 10.0) as u8
}

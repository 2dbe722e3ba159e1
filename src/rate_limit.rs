//! Rate-limit aware retry controller.
//!
//! Only [`PlatformError::RateLimited`] is retried. The controller sleeps for
//! the platform-provided wait (clamped to `max_wait`) and re-invokes the same
//! operation, at most `max_retries` times in a row. Every other error
//! propagates on first sight.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};
use crate::platform::PlatformError;
use crate::shutdown::Shutdown;

/// Default number of consecutive rate-limit retries for one call.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default ceiling for a single rate-limit wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);

/// Retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_retries: u32,
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Wraps platform calls with wait-and-retry on rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    shutdown: Shutdown,
}

impl RateLimiter {
    #[must_use]
    pub const fn new(policy: RateLimitPolicy, shutdown: Shutdown) -> Self {
        Self { policy, shutdown }
    }

    /// Run `op`, retrying it after each rate-limit signal.
    ///
    /// # Errors
    ///
    /// `RateLimitExhausted` after too many consecutive signals, `Cancelled`
    /// if shutdown fires during a wait, or the classified platform error.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, PlatformError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(PlatformError::RateLimited { wait }) => {
                    attempt += 1;
                    self.backoff(operation, attempt, wait).await?;
                }
                Err(err) => return Err(classify(operation, err)),
            }
        }
    }

    /// Sleep for one rate-limit signal, or fail if retries are used up.
    ///
    /// `attempt` counts consecutive signals for the same call, starting at 1.
    /// Callers that cannot express their call as a re-invocable closure
    /// (borrowing cursors, progress trackers) loop on this directly.
    ///
    /// # Errors
    ///
    /// `RateLimitExhausted` when `attempt` exceeds `max_retries`;
    /// `Cancelled` when shutdown fires first.
    pub async fn backoff(&self, operation: &str, attempt: u32, wait: Duration) -> Result<()> {
        if attempt > self.policy.max_retries {
            warn!(
                operation,
                attempts = attempt,
                "Giving up after repeated rate limiting"
            );
            return Err(HarvestError::RateLimitExhausted {
                operation: operation.to_string(),
                attempts: attempt,
            });
        }

        let wait = if wait > self.policy.max_wait {
            warn!(
                operation,
                requested_secs = wait.as_secs(),
                ceiling_secs = self.policy.max_wait.as_secs(),
                "Platform asked for a wait above the ceiling; clamping"
            );
            self.policy.max_wait
        } else {
            wait
        };

        warn!(
            operation,
            attempt,
            max_retries = self.policy.max_retries,
            "Rate limited, waiting {}s",
            wait.as_secs()
        );

        let started = tokio::time::Instant::now();
        tokio::select! {
            () = tokio::time::sleep(wait) => {
                debug!(operation, "Rate-limit wait elapsed, retrying");
                Ok(())
            }
            () = self.shutdown.triggered() => Err(HarvestError::Cancelled {
                waited: started.elapsed(),
            }),
        }
    }
}

/// Map a non rate-limit platform error onto the harvest taxonomy.
pub(crate) fn classify(operation: &str, err: PlatformError) -> HarvestError {
    match err {
        PlatformError::NotFound { .. } | PlatformError::Forbidden { .. } => err.into(),
        other => HarvestError::platform(operation, other),
    }
}

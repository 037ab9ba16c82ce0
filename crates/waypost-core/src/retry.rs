//! Bounded retry with exponential backoff for sync calls.
//!
//! [`RetryingDispatcher::dispatch`] sends one request through a
//! [`SyncClient`], retrying failures that [`SyncError::is_retryable`]
//! classifies as transient. After failed attempt `k` (1-indexed) it waits
//! `base_delay * 2^(k-1)` plus a random jitter in `[0, base_delay)`, capped
//! at `max_delay`. A server `Retry-After` hint raises the wait, still within
//! the cap.
//!
//! Waits happen on the tokio timer, so the caller's thread is never blocked,
//! and every wait races the session's [`CancellationToken`]. An attempt that
//! is already in flight is not interrupted.
//!
//! # Example
//!
//! ```ignore
//! use waypost_core::{RetryConfig, RetryingDispatcher};
//! use tokio_util::sync::CancellationToken;
//!
//! let dispatcher = RetryingDispatcher::new(client);
//! let config = RetryConfig::for_live_sync();
//! let response = dispatcher.dispatch(&request, &config, &CancellationToken::new()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use waypost_types::{SyncRequest, SyncResponse};

use crate::error::{Error, Result, SyncError};
use crate::metrics::TrackingMetrics;
use crate::traits::SyncClient;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first (1 means no retries).
    pub max_attempts: u32,
    /// Wait after the first failed attempt, before jitter.
    pub base_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Whether to add random jitter in `[0, base_delay)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_live_sync()
    }
}

impl RetryConfig {
    /// Create a config with `max_attempts` and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::for_live_sync()
        }
    }

    /// Retry settings for syncing a live fix.
    ///
    /// A few quick attempts; anything still failing is buffered for replay
    /// rather than holding up the next fix.
    pub fn for_live_sync() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// Retry settings for flushing buffered entries.
    ///
    /// Flushing only starts after a live sync succeeded, so the network is
    /// probably up; fewer attempts with a longer base.
    pub fn for_replay() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    // ==================== Builder Methods ====================

    /// Set total attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set base delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// Checks that:
    /// - at least one attempt is made
    /// - `max_delay` is not below `base_delay`
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be >= 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::invalid_config("max_delay must be >= base_delay"));
        }
        Ok(())
    }

    /// Wait after failed attempt `attempt` (1-indexed), before the cap.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        if self.jitter && !self.base_delay.is_zero() {
            let fraction: f64 = rand::rng().random_range(0.0..1.0);
            delay.saturating_add(self.base_delay.mul_f64(fraction))
        } else {
            delay
        }
    }

    /// Wait before the attempt following failed attempt `attempt` (1-indexed).
    pub fn delay_after_attempt(&self, attempt: u32, error: &SyncError) -> Duration {
        let delay = match error.retry_after() {
            Some(hint) => self.backoff(attempt).max(hint),
            None => self.backoff(attempt),
        };
        delay.min(self.max_delay)
    }
}

/// Wraps a [`SyncClient`] with bounded, cancellable retry.
#[derive(Clone)]
pub struct RetryingDispatcher {
    client: Arc<dyn SyncClient>,
    metrics: Arc<TrackingMetrics>,
}

impl std::fmt::Debug for RetryingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingDispatcher").finish_non_exhaustive()
    }
}

impl RetryingDispatcher {
    /// Create a dispatcher around `client`.
    pub fn new(client: Arc<dyn SyncClient>) -> Self {
        Self {
            client,
            metrics: Arc::new(TrackingMetrics::new()),
        }
    }

    /// Record attempts and outcomes into shared metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<TrackingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics this dispatcher records into.
    pub fn metrics(&self) -> &Arc<TrackingMetrics> {
        &self.metrics
    }

    /// Send `request`, retrying transient failures.
    ///
    /// Returns the first success, the first terminal failure, or the last
    /// retryable failure once `config.max_attempts` are used up. If `cancel`
    /// fires before an attempt or during a wait, returns
    /// [`SyncError::Cancelled`].
    pub async fn dispatch(
        &self,
        request: &SyncRequest,
        config: &RetryConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<SyncResponse, SyncError> {
        let max_attempts = config.max_attempts.max(1);
        self.metrics.record_dispatch();

        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                debug!("Dispatch of {} cancelled before attempt {}", request.request_id, attempt);
                return Err(SyncError::Cancelled);
            }

            self.metrics.record_attempt();
            let error = match self.client.sync(request).await {
                Ok(response) => {
                    if attempt > 1 {
                        debug!(
                            "Sync {} succeeded after {} attempts",
                            request.request_id, attempt
                        );
                    }
                    self.metrics.record_success();
                    return Ok(response);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!("Sync {} failed terminally: {}", request.request_id, error);
                self.metrics.record_failure();
                return Err(error);
            }
            if attempt >= max_attempts {
                warn!(
                    "Sync {} failed after {} attempts: {}",
                    request.request_id, attempt, error
                );
                self.metrics.record_failure();
                return Err(error);
            }

            let delay = config.delay_after_attempt(attempt, &error);
            warn!(
                "Sync {} failed (attempt {}/{}): {}, retrying in {:?}",
                request.request_id, attempt, max_attempts, error, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Retry wait for {} cancelled", request.request_id);
                    return Err(SyncError::Cancelled);
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

//! Tracking and sync counters.
//!
//! [`TrackingMetrics`] is shared between the session and its dispatcher and
//! updated with relaxed atomics. Call [`TrackingMetrics::snapshot`] for a
//! serializable copy.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of [`TrackingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Fixes evaluated while tracking.
    pub fixes_processed: u64,
    /// Fixes handled locally without a sync.
    pub syncs_skipped: u64,
    /// Dispatch calls, live and replay.
    pub dispatches: u64,
    /// Individual attempts across all dispatches.
    pub attempts: u64,
    /// Dispatches that succeeded.
    pub successes: u64,
    /// Dispatches that failed, terminally or after exhausting retries.
    pub failures: u64,
    /// Observations written to the replay buffer.
    pub queued: u64,
    /// Replay entries dropped because the buffer was full.
    pub evicted: u64,
    /// Replay entries delivered.
    pub flushed: u64,
    /// Completed dispatches whose result was dropped because tracking stopped.
    pub discarded: u64,
}

impl MetricsSnapshot {
    /// Fraction of evaluated fixes that needed no network call.
    pub fn skip_ratio(&self) -> Option<f64> {
        (self.fixes_processed > 0)
            .then(|| self.syncs_skipped as f64 / self.fixes_processed as f64)
    }
}

/// Thread-safe counters for the tracking engine.
#[derive(Debug, Default)]
pub struct TrackingMetrics {
    fixes_processed: AtomicU64,
    syncs_skipped: AtomicU64,
    dispatches: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    queued: AtomicU64,
    evicted: AtomicU64,
    flushed: AtomicU64,
    discarded: AtomicU64,
}

impl TrackingMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fix(&self, synced: bool) {
        self.fixes_processed.fetch_add(1, Ordering::Relaxed);
        if !synced {
            self.syncs_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self, evicted: bool) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_evicted(&self, count: u64) {
        self.evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_flushed(&self, count: u64) {
        self.flushed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fixes_processed: self.fixes_processed.load(Ordering::Relaxed),
            syncs_skipped: self.syncs_skipped.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.fixes_processed,
            &self.syncs_skipped,
            &self.dispatches,
            &self.attempts,
            &self.successes,
            &self.failures,
            &self.queued,
            &self.evicted,
            &self.flushed,
            &self.discarded,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = TrackingMetrics::new();
        metrics.record_fix(false);
        metrics.record_fix(false);
        metrics.record_fix(true);
        metrics.record_queued(true);
        metrics.record_flushed(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fixes_processed, 3);
        assert_eq!(snapshot.syncs_skipped, 2);
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.evicted, 1);
        assert_eq!(snapshot.flushed, 2);

        let ratio = snapshot.skip_ratio().unwrap();
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let metrics = TrackingMetrics::new();
        metrics.record_attempt();
        metrics.record_discarded();
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert!(metrics.snapshot().skip_ratio().is_none());
    }
}

//! Transfer coordinator metrics.

use crate::metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, CUTOVER_BUCKETS, TRANSFER_DURATION_BUCKETS,
};
use crate::transfer::types::TransferMethod;
use std::time::Duration;

/// Metrics for shard transfers.
#[derive(Debug)]
pub struct TransferMetrics {
    pub active: Gauge,
    pub started: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub cancelled: Counter,
    /// Admissions refused (validation or limits).
    pub rejected: Counter,
    /// `wal_delta` requests that shipped a snapshot instead.
    pub fallbacks: Counter,
    pub points_transferred: Counter,
    pub records_replayed: Counter,
    pub bytes_transferred: Counter,
    /// Whole-transfer wall time (seconds).
    pub duration: Histogram,
    /// Time the source stayed sealed (seconds).
    pub cutover: Histogram,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self {
            active: Gauge::new("transfers_active"),
            started: Counter::new("transfers_started"),
            completed: Counter::new("transfers_completed"),
            failed: Counter::new("transfers_failed"),
            cancelled: Counter::new("transfers_cancelled"),
            rejected: Counter::new("transfers_rejected"),
            fallbacks: Counter::new("transfers_wal_delta_fallbacks"),
            points_transferred: Counter::new("transfer_points"),
            records_replayed: Counter::new("transfer_records"),
            bytes_transferred: Counter::new("transfer_bytes"),
            duration: Histogram::new("transfer_duration_seconds", TRANSFER_DURATION_BUCKETS),
            cutover: Histogram::new("transfer_cutover_seconds", CUTOVER_BUCKETS),
        }
    }

    pub fn record_start(&self) {
        self.started.inc();
        self.active.inc();
    }

    pub fn record_completed(&self, duration: Duration) {
        self.completed.inc();
        self.active.dec();
        self.duration.observe_duration(duration);
    }

    pub fn record_failed(&self, cancelled: bool) {
        if cancelled {
            self.cancelled.inc();
        } else {
            self.failed.inc();
        }
        self.active.dec();
    }

    pub fn record_fallback(&self, requested: TransferMethod) {
        if requested == TransferMethod::WalDelta {
            self.fallbacks.inc();
        }
    }

    pub fn snapshot(&self) -> TransferMetricsSnapshot {
        TransferMetricsSnapshot {
            active: self.active.get().max(0) as u64,
            started: self.started.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            cancelled: self.cancelled.get(),
            rejected: self.rejected.get(),
            fallbacks: self.fallbacks.get(),
            points_transferred: self.points_transferred.get(),
            records_replayed: self.records_replayed.get(),
            bytes_transferred: self.bytes_transferred.get(),
            duration: self.duration.snapshot(),
            cutover: self.cutover.snapshot(),
        }
    }
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transfer metrics.
#[derive(Debug, Clone)]
pub struct TransferMetricsSnapshot {
    pub active: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub fallbacks: u64,
    pub points_transferred: u64,
    pub records_replayed: u64,
    pub bytes_transferred: u64,
    pub duration: HistogramSnapshot,
    pub cutover: HistogramSnapshot,
}

impl TransferMetricsSnapshot {
    /// Completed share of finalized transfers, as a percentage. Cancellations
    /// are not counted as failures.
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            return 100.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters() {
        let metrics = TransferMetrics::new();
        metrics.record_start();
        metrics.record_start();
        metrics.record_start();
        metrics.record_completed(Duration::from_millis(120));
        metrics.record_failed(false);
        metrics.record_failed(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.started, 3);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.duration.count, 1);
        assert_eq!(snapshot.success_rate(), 50.0);
    }

    #[test]
    fn test_fallback_only_counts_wal_delta() {
        let metrics = TransferMetrics::new();
        metrics.record_fallback(TransferMethod::Snapshot);
        metrics.record_fallback(TransferMethod::WalDelta);
        assert_eq!(metrics.snapshot().fallbacks, 1);
    }
}

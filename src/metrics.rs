//! Metrics and observability for mongo-stage-sync.
//!
//! Counters are kept in-process for run summaries and mirrored to the
//! `metrics` facade, which is a no-op unless the host installs a recorder.

use crate::load::LoadReport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for sync runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Stream synchronizations attempted
    pub streams_total: AtomicU64,
    /// Successful stream synchronizations
    pub streams_success: AtomicU64,
    /// Failed stream synchronizations
    pub streams_failed: AtomicU64,
    /// Documents fetched from the source
    pub documents_fetched: AtomicU64,
    /// Rows inserted into staging
    pub rows_inserted: AtomicU64,
    /// Rows absorbed by primary-key conflicts
    pub rows_duplicate: AtomicU64,
    /// Documents dropped for a missing id or timestamp
    pub documents_dropped: AtomicU64,
    /// Total stream sync duration in milliseconds
    pub sync_duration_ms: AtomicU64,
    /// Transformation scripts applied
    pub scripts_applied: AtomicU64,
    /// Retry count
    pub retries: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one stream synchronization.
    pub fn record_stream(&self, stream: &str, report: Option<&LoadReport>, duration_ms: u64) {
        self.streams_total.fetch_add(1, Ordering::Relaxed);
        self.sync_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        metrics::histogram!("stage_sync_stream_duration_ms", "stream" => stream.to_string())
            .record(duration_ms as f64);

        let Some(report) = report else {
            self.streams_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("stage_sync_streams_failed_total", "stream" => stream.to_string())
                .increment(1);
            return;
        };

        self.streams_success.fetch_add(1, Ordering::Relaxed);
        self.documents_fetched
            .fetch_add(report.fetched as u64, Ordering::Relaxed);
        self.rows_inserted
            .fetch_add(report.inserted as u64, Ordering::Relaxed);
        self.rows_duplicate
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.documents_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        metrics::counter!("stage_sync_rows_inserted_total", "stream" => stream.to_string())
            .increment(report.inserted as u64);
        metrics::counter!("stage_sync_rows_duplicate_total", "stream" => stream.to_string())
            .increment(report.duplicates as u64);
        metrics::counter!("stage_sync_documents_dropped_total", "stream" => stream.to_string())
            .increment(report.dropped as u64);
    }

    /// Record an applied transformation script.
    pub fn record_script(&self) {
        self.scripts_applied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stage_sync_scripts_applied_total").increment(1);
    }

    /// Record a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stage_sync_retries_total").increment(1);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_total: self.streams_total.load(Ordering::Relaxed),
            streams_success: self.streams_success.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            documents_fetched: self.documents_fetched.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_duplicate: self.rows_duplicate.load(Ordering::Relaxed),
            documents_dropped: self.documents_dropped.load(Ordering::Relaxed),
            sync_duration_ms: self.sync_duration_ms.load(Ordering::Relaxed),
            scripts_applied: self.scripts_applied.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Stream synchronizations attempted
    pub streams_total: u64,
    /// Successful stream synchronizations
    pub streams_success: u64,
    /// Failed stream synchronizations
    pub streams_failed: u64,
    /// Documents fetched from the source
    pub documents_fetched: u64,
    /// Rows inserted into staging
    pub rows_inserted: u64,
    /// Rows absorbed by primary-key conflicts
    pub rows_duplicate: u64,
    /// Documents dropped
    pub documents_dropped: u64,
    /// Total stream sync duration in milliseconds
    pub sync_duration_ms: u64,
    /// Transformation scripts applied
    pub scripts_applied: u64,
    /// Retry count
    pub retries: u64,
}

impl MetricsSnapshot {
    /// Calculate success rate.
    pub fn success_rate(&self) -> f64 {
        if self.streams_total == 0 {
            0.0
        } else {
            self.streams_success as f64 / self.streams_total as f64
        }
    }

    /// Calculate rows inserted per second.
    pub fn rows_per_second(&self) -> f64 {
        if self.sync_duration_ms == 0 {
            0.0
        } else {
            (self.rows_inserted as f64 * 1000.0) / self.sync_duration_ms as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();
        let report = LoadReport {
            fetched: 10,
            inserted: 7,
            duplicates: 2,
            dropped: 1,
            watermark: None,
        };

        metrics.record_stream("ads", Some(&report), 1000);
        metrics.record_stream("leads", None, 500);
        metrics.record_script();
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.streams_total, 2);
        assert_eq!(snapshot.streams_success, 1);
        assert_eq!(snapshot.streams_failed, 1);
        assert_eq!(snapshot.documents_fetched, 10);
        assert_eq!(snapshot.rows_inserted, 7);
        assert_eq!(snapshot.rows_duplicate, 2);
        assert_eq!(snapshot.documents_dropped, 1);
        assert_eq!(snapshot.scripts_applied, 1);
        assert_eq!(snapshot.retries, 1);
    }

    #[test]
    fn test_metrics_calculations() {
        let snapshot = MetricsSnapshot {
            streams_total: 10,
            streams_success: 8,
            streams_failed: 2,
            documents_fetched: 1200,
            rows_inserted: 1000,
            rows_duplicate: 150,
            documents_dropped: 50,
            sync_duration_ms: 5000,
            scripts_applied: 4,
            retries: 3,
        };

        assert!((snapshot.success_rate() - 0.8).abs() < 0.001);
        assert!((snapshot.rows_per_second() - 200.0).abs() < 0.001);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("noop");
        assert!(timer.stop() < 60_000);
    }
}

//! Custom metric collectors for delivery operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and
//! provides convenient methods for the scheduler, workers, and monitor.
//! Every method is a no-op when metrics were never initialized, so library
//! users who skip `init_metrics()` pay nothing.

use std::time::Duration;

use crate::queue::JobCounts;

use super::prometheus::{
    ACTIVE_WORKERS, ALERTS_TOTAL, DELIVERIES_TOTAL, DELIVERY_DURATION, FAILURE_RATE,
    HEALTH_CHECK_FAILURES, JOBS_IN_PROGRESS, QUEUE_DEPTH, SCHEDULED_TOTAL, THROUGHPUT,
};

/// Metrics collector for recording delivery operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    ///
    /// Note: Metrics must be initialized with `init_metrics()` before
    /// recorded values show up in the export.
    pub fn new() -> Self {
        Self
    }

    /// Record a terminal delivery outcome.
    pub fn record_delivery(&self, status: &str, tier: &str, duration: Duration) {
        if let Some(deliveries) = DELIVERIES_TOTAL.get() {
            deliveries.with_label_values(&[status, tier]).inc();
        }
        if let Some(durations) = DELIVERY_DURATION.get() {
            durations
                .with_label_values(&[tier])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(status, tier, duration_ms = duration.as_millis() as u64, "Recorded delivery metric");
    }

    /// Record a scheduler admission outcome (`new`, `skipped`, or `failed`).
    pub fn record_scheduled(&self, outcome: &str, count: usize) {
        if let Some(scheduled) = SCHEDULED_TOTAL.get() {
            scheduled
                .with_label_values(&[outcome])
                .inc_by(count as f64);
        }
    }

    /// Update the per-state depth gauges for a queue from a counts snapshot.
    pub fn update_queue_depth(&self, queue: &str, counts: &JobCounts) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            depth
                .with_label_values(&[queue, "waiting"])
                .set(counts.waiting as f64);
            depth
                .with_label_values(&[queue, "active"])
                .set(counts.active as f64);
            depth
                .with_label_values(&[queue, "delayed"])
                .set(counts.delayed as f64);
            depth
                .with_label_values(&[queue, "failed"])
                .set(counts.failed as f64);
        }
    }

    /// Update the rolling failure-rate gauge for a queue.
    pub fn update_failure_rate(&self, queue: &str, rate: f64) {
        if let Some(failure_rate) = FAILURE_RATE.get() {
            failure_rate.with_label_values(&[queue]).set(rate);
        }
    }

    /// Update the rolling throughput gauge for a queue.
    pub fn update_throughput(&self, queue: &str, jobs_per_minute: f64) {
        if let Some(throughput) = THROUGHPUT.get() {
            throughput.with_label_values(&[queue]).set(jobs_per_minute);
        }
    }

    /// Record a raised alert.
    pub fn record_alert(&self, severity: &str, alert_type: &str) {
        if let Some(alerts) = ALERTS_TOTAL.get() {
            alerts.with_label_values(&[severity, alert_type]).inc();
        }
    }

    /// Record a failed health check.
    pub fn record_health_check_failure(&self) {
        if let Some(failures) = HEALTH_CHECK_FAILURES.get() {
            failures.inc();
        }
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Increment the count of jobs being sent.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs being sent.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

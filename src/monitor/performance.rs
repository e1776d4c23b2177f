//! Rolling performance window.
//!
//! Each monitored queue keeps a bounded FIFO window of recent job samples.
//! Rolling metrics (average processing time, throughput) are derived from
//! this window on every monitoring tick, so memory stays constant no
//! matter how many jobs flow through.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of samples retained per queue.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// One processed job as observed by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSample {
    pub job_id: Uuid,
    pub processing_time: Duration,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobSample {
    /// Records a successful job.
    pub fn success(job_id: Uuid, processing_time: Duration) -> Self {
        Self {
            job_id,
            processing_time,
            timestamp: Utc::now(),
            success: true,
            error: None,
        }
    }

    /// Records a failed job.
    pub fn failure(job_id: Uuid, processing_time: Duration, error: impl Into<String>) -> Self {
        Self {
            job_id,
            processing_time,
            timestamp: Utc::now(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Monitor-derived view of one queue's recent performance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// `successful / total_processed`; 0.0 for an empty window.
    pub success_rate: f64,
    pub avg_processing_time: Duration,
    /// Jobs per minute over the window span; 0.0 with fewer than 2 samples.
    pub throughput_per_minute: f64,
}

/// Bounded FIFO buffer of recent job samples.
#[derive(Debug, Clone)]
pub struct PerformanceWindow {
    capacity: usize,
    samples: VecDeque<JobSample>,
}

impl Default for PerformanceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl PerformanceWindow {
    /// Creates a window retaining at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Appends a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: JobSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest-first iteration over the retained samples.
    pub fn iter(&self) -> impl Iterator<Item = &JobSample> {
        self.samples.iter()
    }

    /// Average processing time over the window; zero when empty.
    pub fn avg_processing_time(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total_ms: u128 = self
            .samples
            .iter()
            .map(|s| s.processing_time.as_millis())
            .sum();
        Duration::from_millis((total_ms / self.samples.len() as u128) as u64)
    }

    /// Throughput in jobs per minute: window job count over window time
    /// span. Defined as 0.0 with fewer than 2 samples, since a span needs
    /// two endpoints.
    pub fn throughput_per_minute(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let oldest = self.samples.front().map(|s| s.timestamp);
        let newest = self.samples.back().map(|s| s.timestamp);
        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return 0.0;
        };
        let span_ms = (newest - oldest).num_milliseconds();
        if span_ms <= 0 {
            return 0.0;
        }
        let minutes = span_ms as f64 / 60_000.0;
        self.samples.len() as f64 / minutes
    }

    /// Summarizes the window into the monitor's derived view.
    pub fn summarize(&self) -> PerformanceSummary {
        let total = self.samples.len();
        let successful = self.samples.iter().filter(|s| s.success).count();
        let failed = total - successful;
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };

        PerformanceSummary {
            total_processed: total,
            successful,
            failed,
            success_rate,
            avg_processing_time: self.avg_processing_time(),
            throughput_per_minute: self.throughput_per_minute(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_at(offset_secs: i64, success: bool) -> JobSample {
        JobSample {
            job_id: Uuid::new_v4(),
            processing_time: Duration::from_millis(500),
            timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
            success,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut window = PerformanceWindow::new(3);
        let first = sample_at(0, true);
        let first_id = first.job_id;
        window.push(first);
        for i in 1..=3 {
            window.push(sample_at(i, true));
        }

        assert_eq!(window.len(), 3);
        assert!(window.iter().all(|s| s.job_id != first_id));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut window = PerformanceWindow::new(DEFAULT_WINDOW_CAPACITY);
        for i in 0..(DEFAULT_WINDOW_CAPACITY as i64 + 50) {
            window.push(sample_at(i, true));
        }
        assert_eq!(window.len(), DEFAULT_WINDOW_CAPACITY);
    }

    #[test]
    fn test_throughput_requires_two_samples() {
        let mut window = PerformanceWindow::new(10);
        assert_eq!(window.throughput_per_minute(), 0.0);

        window.push(sample_at(0, true));
        assert_eq!(window.throughput_per_minute(), 0.0);

        window.push(sample_at(60, true));
        // 2 jobs over 1 minute.
        assert!((window.throughput_per_minute() - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_avg_processing_time() {
        let mut window = PerformanceWindow::new(10);
        let mut fast = sample_at(0, true);
        fast.processing_time = Duration::from_millis(100);
        let mut slow = sample_at(1, true);
        slow.processing_time = Duration::from_millis(300);

        window.push(fast);
        window.push(slow);
        assert_eq!(window.avg_processing_time(), Duration::from_millis(200));
    }

    #[test]
    fn test_summary_counts_successes_and_failures() {
        let mut window = PerformanceWindow::new(10);
        window.push(sample_at(0, true));
        window.push(sample_at(1, true));
        window.push(sample_at(2, false));

        let summary = window.summarize();
        assert_eq!(summary.total_processed, 3);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_window_summary() {
        let window = PerformanceWindow::default();
        let summary = window.summarize();
        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.avg_processing_time, Duration::ZERO);
        assert_eq!(summary.throughput_per_minute, 0.0);
    }
}

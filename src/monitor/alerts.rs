//! Alert types and the bounded recent-alert log.
//!
//! Alerts are the operator's single anomaly channel: threshold breaches,
//! stalled jobs, and failed health checks all land here. The log keeps a
//! fixed number of recent entries and is not a durable audit trail; it is
//! rebuilt from zero on restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of alerts retained in the log.
pub const ALERT_LOG_CAPACITY: usize = 100;

/// Alert severity, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::High => write!(f, "high"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Time-based, severity-tagged identifier.
    pub id: String,
    /// Machine-readable alert type, e.g. `high_queue_depth`.
    pub alert_type: String,
    pub severity: AlertSeverity,
    /// Queue the alert concerns.
    pub queue: String,
    /// Human-readable description.
    pub message: String,
    /// Observed value that triggered the alert, where applicable.
    #[serde(default)]
    pub value: Option<f64>,
    /// Threshold the value was compared against, where applicable.
    #[serde(default)]
    pub threshold: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// Disambiguates alerts raised within the same millisecond.
static ALERT_SEQ: AtomicU64 = AtomicU64::new(0);

impl Alert {
    /// Creates an alert with a fresh time-based id.
    pub fn new(
        alert_type: impl Into<String>,
        severity: AlertSeverity,
        queue: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let timestamp = Utc::now();
        let seq = ALERT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{}-{severity}-{seq}", timestamp.timestamp_millis()),
            alert_type: alert_type.into(),
            severity,
            queue: queue.into(),
            message: message.into(),
            value: None,
            threshold: None,
            timestamp,
        }
    }

    /// Attaches the observed value and the breached threshold.
    pub fn with_measurement(mut self, value: f64, threshold: f64) -> Self {
        self.value = Some(value);
        self.threshold = Some(threshold);
        self
    }
}

/// Bounded FIFO log of recent alerts.
#[derive(Debug, Default)]
pub struct AlertLog {
    entries: VecDeque<Alert>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an alert, evicting the oldest when the log is full.
    pub fn push(&mut self, alert: Alert) {
        if self.entries.len() == ALERT_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(alert);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent alerts, newest first, optionally filtered by severity.
    pub fn recent(&self, severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        self.entries
            .iter()
            .rev()
            .filter(|alert| severity.map_or(true, |s| alert.severity == s))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_ids_are_unique_and_tagged() {
        let a = Alert::new("high_queue_depth", AlertSeverity::Warning, "distribution", "x");
        let b = Alert::new("high_queue_depth", AlertSeverity::Warning, "distribution", "x");
        assert_ne!(a.id, b.id);
        assert!(a.id.contains("warning"));
    }

    #[test]
    fn test_measurement_attachment() {
        let alert = Alert::new("high_failure_rate", AlertSeverity::High, "retry", "rate high")
            .with_measurement(0.12, 0.05);
        assert_eq!(alert.value, Some(0.12));
        assert_eq!(alert.threshold, Some(0.05));
    }

    #[test]
    fn test_log_capacity_and_eviction() {
        let mut log = AlertLog::new();
        for i in 0..(ALERT_LOG_CAPACITY + 10) {
            log.push(Alert::new(
                "slow_processing",
                AlertSeverity::Warning,
                "batch",
                format!("alert {i}"),
            ));
        }
        assert_eq!(log.len(), ALERT_LOG_CAPACITY);

        // Oldest entries are gone, newest retained.
        let recent = log.recent(None, ALERT_LOG_CAPACITY);
        assert!(recent.iter().all(|a| a.message != "alert 0"));
        assert_eq!(recent[0].message, format!("alert {}", ALERT_LOG_CAPACITY + 9));
    }

    #[test]
    fn test_recent_newest_first_with_filter() {
        let mut log = AlertLog::new();
        log.push(Alert::new("a", AlertSeverity::Info, "q", "first"));
        log.push(Alert::new("b", AlertSeverity::High, "q", "second"));
        log.push(Alert::new("c", AlertSeverity::Info, "q", "third"));

        let all = log.recent(None, 10);
        assert_eq!(all[0].message, "third");
        assert_eq!(all[2].message, "first");

        let high_only = log.recent(Some(AlertSeverity::High), 10);
        assert_eq!(high_only.len(), 1);
        assert_eq!(high_only[0].message, "second");

        let limited = log.recent(None, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].message, "third");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::High);
        assert!(AlertSeverity::High < AlertSeverity::Critical);
    }
}

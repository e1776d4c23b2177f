//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for delivery
//! operations: terminal outcomes, queue depths, rolling rates, and alert
//! counts.
//!
//! # Example
//!
//! ```ignore
//! use daybreak::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_delivery("sent", "pro", std::time::Duration::from_millis(300));
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    ACTIVE_WORKERS, ALERTS_TOTAL, DELIVERIES_TOTAL, DELIVERY_DURATION, FAILURE_RATE,
    HEALTH_CHECK_FAILURES, JOBS_IN_PROGRESS, QUEUE_DEPTH, REGISTRY, SCHEDULED_TOTAL, THROUGHPUT,
};

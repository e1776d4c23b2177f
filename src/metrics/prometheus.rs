//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by daybreak and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all daybreak metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total deliveries reaching a terminal state, labeled by status and tier.
pub static DELIVERIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Delivery send duration in seconds, labeled by tier.
pub static DELIVERY_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs admitted by the scheduler, labeled by outcome (new/skipped/failed).
pub static SCHEDULED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs per queue and state (waiting/active/delayed/failed).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Rolling failure rate per queue, as computed by the monitor.
pub static FAILURE_RATE: OnceLock<GaugeVec> = OnceLock::new();

/// Rolling throughput per queue in jobs per minute.
pub static THROUGHPUT: OnceLock<GaugeVec> = OnceLock::new();

/// Alerts raised, labeled by severity and alert type.
pub static ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Health-check failures observed.
pub static HEALTH_CHECK_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Number of jobs currently being sent.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup; repeat calls are harmless.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let deliveries_total = CounterVec::new(
        Opts::new(
            "daybreak_deliveries_total",
            "Total deliveries reaching a terminal state",
        ),
        &["status", "tier"],
    )?;

    let delivery_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "daybreak_delivery_duration_seconds",
            "Delivery send duration in seconds",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["tier"],
    )?;

    let scheduled_total = CounterVec::new(
        Opts::new(
            "daybreak_scheduled_total",
            "Jobs admitted by the scheduler, by outcome",
        ),
        &["outcome"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("daybreak_queue_depth", "Number of jobs per queue and state"),
        &["queue", "state"],
    )?;

    let failure_rate = GaugeVec::new(
        Opts::new("daybreak_failure_rate", "Rolling failure rate per queue"),
        &["queue"],
    )?;

    let throughput = GaugeVec::new(
        Opts::new(
            "daybreak_throughput_jobs_per_minute",
            "Rolling throughput per queue in jobs per minute",
        ),
        &["queue"],
    )?;

    let alerts_total = CounterVec::new(
        Opts::new("daybreak_alerts_total", "Alerts raised"),
        &["severity", "type"],
    )?;

    let health_check_failures = Counter::new(
        "daybreak_health_check_failures_total",
        "Health-check failures observed",
    )?;

    let jobs_in_progress = Gauge::new(
        "daybreak_jobs_in_progress",
        "Number of jobs currently being sent",
    )?;

    let active_workers = Gauge::new("daybreak_active_workers", "Number of active workers")?;

    registry.register(Box::new(deliveries_total.clone()))?;
    registry.register(Box::new(delivery_duration.clone()))?;
    registry.register(Box::new(scheduled_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(failure_rate.clone()))?;
    registry.register(Box::new(throughput.clone()))?;
    registry.register(Box::new(alerts_total.clone()))?;
    registry.register(Box::new(health_check_failures.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = DELIVERIES_TOTAL.set(deliveries_total);
    let _ = DELIVERY_DURATION.set(delivery_duration);
    let _ = SCHEDULED_TOTAL.set(scheduled_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = FAILURE_RATE.set(failure_rate);
    let _ = THROUGHPUT.set(throughput);
    let _ = ALERTS_TOTAL.set(alerts_total);
    let _ = HEALTH_CHECK_FAILURES.set(health_check_failures);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Suitable for scraping by a Prometheus server. If the registry has not
/// been initialized or encoding fails, returns an error message comment.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

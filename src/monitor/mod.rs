//! Queue health monitoring.
//!
//! The monitor observes; it never claims jobs. It subscribes to each
//! queue's lifecycle events to build rolling performance windows, runs a
//! fixed-interval metrics tick with threshold evaluation, and runs a
//! separate, coarser health check that detects broker-connectivity loss
//! even when no jobs are flowing. Operators reach queue administration
//! (pause, resume, retry, purge) through it as well.
//!
//! All monitor state is process-local and rebuilt from zero on restart;
//! the broker's own job store stays authoritative.

pub mod alerts;
pub mod performance;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::metrics::MetricsCollector;
use crate::queue::{BrokerError, FailedJob, JobBroker, JobCounts, QueueEvent};

pub use alerts::{Alert, AlertLog, AlertSeverity, ALERT_LOG_CAPACITY};
pub use performance::{
    JobSample, PerformanceSummary, PerformanceWindow, DEFAULT_WINDOW_CAPACITY,
};

/// Capacity of the monitor notification channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur during monitor operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The named queue is not registered with this monitor.
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// The underlying broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Point-in-time metrics snapshot for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub counts: JobCounts,
    /// `failed / (completed + failed)`; 0.0 when nothing is terminal yet.
    pub failure_rate: f64,
    pub avg_processing_time: Duration,
    pub throughput_per_minute: f64,
}

/// Result of one health probe for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub queue: String,
    pub paused: bool,
    pub ready: bool,
    /// `!paused && ready`.
    pub healthy: bool,
}

/// Per-job outcome of a bulk retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub job_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-queue outcome of a completed-job purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearOutcome {
    pub queue: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Notifications published to monitor subscribers.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    JobCompleted {
        queue: String,
        job_id: Uuid,
    },
    JobFailed {
        queue: String,
        job_id: Uuid,
        error: String,
    },
    JobStalled {
        queue: String,
        job_id: Uuid,
    },
    MetricsUpdated {
        queue: String,
        metrics: QueueMetrics,
    },
    QueuePaused {
        queue: String,
    },
    QueueResumed {
        queue: String,
    },
    AlertRaised(Alert),
    HealthCheckFailed {
        issues: Vec<String>,
    },
}

/// Mutable monitor state, touched only by event handlers and ticks.
#[derive(Default)]
struct MonitorState {
    /// Claim instants of currently active jobs, keyed by job id.
    active: HashMap<Uuid, Instant>,
    /// One rolling window per queue.
    windows: HashMap<String, PerformanceWindow>,
    alerts: AlertLog,
}

/// Shared internals between the monitor handle and its background tasks.
struct MonitorCore {
    config: DispatchConfig,
    state: Mutex<MonitorState>,
    notifications: broadcast::Sender<MonitorEvent>,
    metrics: MetricsCollector,
}

impl MonitorCore {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, event: MonitorEvent) {
        // No subscribers is fine; notifications are best-effort.
        let _ = self.notifications.send(event);
    }

    fn raise(&self, alert: Alert) {
        warn!(
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            queue = %alert.queue,
            message = %alert.message,
            "Alert raised"
        );
        self.metrics
            .record_alert(&alert.severity.to_string(), &alert.alert_type);
        self.lock_state().alerts.push(alert.clone());
        self.notify(MonitorEvent::AlertRaised(alert));
    }

    /// Handles one broker lifecycle event for `queue`.
    fn handle_event(&self, queue: &str, event: QueueEvent) {
        match event {
            QueueEvent::Active { id, .. } => {
                self.lock_state().active.insert(id, Instant::now());
            }
            QueueEvent::Completed { id, .. } => {
                let elapsed = self.finish_active(queue, id, true, None);
                debug!(queue, job_id = %id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
                self.notify(MonitorEvent::JobCompleted {
                    queue: queue.to_string(),
                    job_id: id,
                });
            }
            QueueEvent::Failed { id, error, .. } => {
                self.finish_active(queue, id, false, Some(error.clone()));
                self.notify(MonitorEvent::JobFailed {
                    queue: queue.to_string(),
                    job_id: id,
                    error,
                });
            }
            QueueEvent::Stalled { id, .. } => {
                self.raise(Alert::new(
                    "stalled_job",
                    AlertSeverity::Warning,
                    queue,
                    format!("Job {id} stalled and was returned to the queue"),
                ));
                self.notify(MonitorEvent::JobStalled {
                    queue: queue.to_string(),
                    job_id: id,
                });
            }
            QueueEvent::BrokerError { message } => {
                self.raise(Alert::new(
                    "queue_error",
                    AlertSeverity::High,
                    queue,
                    format!("Broker error: {message}"),
                ));
            }
        }
    }

    /// Removes the job from the active map and records its sample.
    fn finish_active(
        &self,
        queue: &str,
        id: Uuid,
        success: bool,
        error: Option<String>,
    ) -> Duration {
        let mut state = self.lock_state();
        let elapsed = state
            .active
            .remove(&id)
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO);
        let sample = match error {
            None if success => JobSample::success(id, elapsed),
            Some(reason) => JobSample::failure(id, elapsed, reason),
            None => JobSample::failure(id, elapsed, "unknown error"),
        };
        state
            .windows
            .entry(queue.to_string())
            .or_default()
            .push(sample);
        elapsed
    }

    /// One metrics tick for one queue: snapshot, derive, evaluate.
    async fn tick_queue(&self, queue: &str, broker: &dyn JobBroker) {
        let counts = match broker.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                // A per-queue read failure never aborts the tick for others.
                warn!(queue, error = %e, "Metrics tick failed for queue");
                return;
            }
        };

        let (avg, throughput) = {
            let state = self.lock_state();
            match state.windows.get(queue) {
                Some(window) => (window.avg_processing_time(), window.throughput_per_minute()),
                None => (Duration::ZERO, 0.0),
            }
        };

        let terminal = counts.completed + counts.failed;
        let failure_rate = if terminal == 0 {
            0.0
        } else {
            counts.failed as f64 / terminal as f64
        };

        let metrics = QueueMetrics {
            queue: queue.to_string(),
            counts,
            failure_rate,
            avg_processing_time: avg,
            throughput_per_minute: throughput,
        };

        self.metrics.update_queue_depth(queue, &metrics.counts);
        self.metrics.update_failure_rate(queue, failure_rate);
        self.metrics.update_throughput(queue, throughput);

        for alert in evaluate_thresholds(&self.config, &metrics) {
            self.raise(alert);
        }

        self.notify(MonitorEvent::MetricsUpdated {
            queue: queue.to_string(),
            metrics,
        });
    }

    /// One health probe across all queues; raises a single aggregated
    /// alert when anything is unhealthy.
    async fn run_health_check(&self, queues: &HashMap<String, Arc<dyn JobBroker>>) {
        let probes = queues
            .iter()
            .map(|(name, broker)| async move { (name, probe_queue(name, broker.as_ref()).await) });

        let mut issues = Vec::new();
        for (name, health) in futures::future::join_all(probes).await {
            match health {
                Ok(health) if health.healthy => {}
                Ok(health) => {
                    if health.paused {
                        issues.push(format!("{name}: paused"));
                    }
                    if !health.ready {
                        issues.push(format!("{name}: broker not ready"));
                    }
                }
                Err(e) => issues.push(format!("{name}: health probe failed: {e}")),
            }
        }
        issues.sort();

        if !issues.is_empty() {
            self.metrics.record_health_check_failure();
            self.raise(Alert::new(
                "health_check_failed",
                AlertSeverity::High,
                "all",
                format!("Unhealthy queues: {}", issues.join("; ")),
            ));
            self.notify(MonitorEvent::HealthCheckFailed { issues });
        }
    }
}

/// Probes one queue's paused and ready flags.
async fn probe_queue(name: &str, broker: &dyn JobBroker) -> Result<QueueHealth, BrokerError> {
    let paused = broker.is_paused().await?;
    let ready = broker.is_ready().await;
    Ok(QueueHealth {
        queue: name.to_string(),
        paused,
        ready,
        healthy: !paused && ready,
    })
}

/// Compares a fresh metrics snapshot against the configured thresholds.
/// Each breached threshold yields exactly one alert.
fn evaluate_thresholds(config: &DispatchConfig, metrics: &QueueMetrics) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if metrics.counts.waiting > config.queue_depth_threshold {
        alerts.push(
            Alert::new(
                "high_queue_depth",
                AlertSeverity::Warning,
                &metrics.queue,
                format!(
                    "{} waiting jobs exceeds threshold {}",
                    metrics.counts.waiting, config.queue_depth_threshold
                ),
            )
            .with_measurement(
                metrics.counts.waiting as f64,
                config.queue_depth_threshold as f64,
            ),
        );
    }

    if metrics.failure_rate > config.failure_rate_threshold {
        alerts.push(
            Alert::new(
                "high_failure_rate",
                AlertSeverity::High,
                &metrics.queue,
                format!(
                    "failure rate {:.1}% exceeds threshold {:.1}%",
                    metrics.failure_rate * 100.0,
                    config.failure_rate_threshold * 100.0
                ),
            )
            .with_measurement(metrics.failure_rate, config.failure_rate_threshold),
        );
    }

    if metrics.avg_processing_time > config.processing_time_threshold {
        alerts.push(
            Alert::new(
                "slow_processing",
                AlertSeverity::Warning,
                &metrics.queue,
                format!(
                    "average processing time {:?} exceeds threshold {:?}",
                    metrics.avg_processing_time, config.processing_time_threshold
                ),
            )
            .with_measurement(
                metrics.avg_processing_time.as_secs_f64(),
                config.processing_time_threshold.as_secs_f64(),
            ),
        );
    }

    alerts
}

/// Observes a set of queues and exposes queue administration.
pub struct QueueMonitor {
    core: Arc<MonitorCore>,
    queues: HashMap<String, Arc<dyn JobBroker>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl QueueMonitor {
    /// Creates a monitor with no queues registered yet.
    pub fn new(config: DispatchConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            core: Arc::new(MonitorCore {
                config,
                state: Mutex::new(MonitorState::default()),
                notifications,
                metrics: MetricsCollector::new(),
            }),
            queues: HashMap::new(),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Registers a queue under its broker name.
    pub fn add_queue(&mut self, broker: Arc<dyn JobBroker>) {
        self.queues.insert(broker.name().to_string(), broker);
    }

    /// Names of all registered queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn broker(&self, name: &str) -> Result<&Arc<dyn JobBroker>, MonitorError> {
        self.queues
            .get(name)
            .ok_or_else(|| MonitorError::UnknownQueue(name.to_string()))
    }

    /// Subscribes to monitor notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.core.notifications.subscribe()
    }

    /// Starts event tracking, the metrics tick, and the health check.
    ///
    /// Calling it again while running restarts nothing; the first loops
    /// keep going.
    pub fn start_monitoring(&mut self) {
        if !self.handles.is_empty() {
            return;
        }

        // One event listener per queue.
        for (name, broker) in &self.queues {
            let core = Arc::clone(&self.core);
            let name = name.clone();
            let mut events = broker.subscribe();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        event = events.recv() => match event {
                            Ok(event) => core.handle_event(&name, event),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(queue = %name, missed, "Monitor lagged behind queue events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        // Metrics tick.
        {
            let core = Arc::clone(&self.core);
            let queues = self.queues.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let interval = self.core.config.metrics_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            for (name, broker) in &queues {
                                core.tick_queue(name, broker.as_ref()).await;
                            }
                        }
                    }
                }
            }));
        }

        // Independent health check: must notice a dead broker even when
        // zero throughput makes the metrics tick look idle.
        {
            let core = Arc::clone(&self.core);
            let queues = self.queues.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let interval = self.core.config.health_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => core.run_health_check(&queues).await,
                    }
                }
            }));
        }

        info!(queues = self.queues.len(), "Queue monitoring started");
    }

    /// Stops all monitoring loops. Safe to call repeatedly; this is the
    /// only supported shutdown path.
    pub async fn stop_monitoring(&mut self) {
        if self.handles.is_empty() {
            return;
        }

        let _ = self.shutdown_tx.send(());
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Monitor task panicked during shutdown");
                }
            }
        }
        info!("Queue monitoring stopped");
    }

    /// Probes every queue's health flags.
    pub async fn health_check(&self) -> Vec<QueueHealth> {
        let probes = self.queues.iter().map(|(name, broker)| async move {
            match probe_queue(name, broker.as_ref()).await {
                Ok(health) => health,
                Err(e) => {
                    warn!(queue = %name, error = %e, "Health probe failed");
                    QueueHealth {
                        queue: name.clone(),
                        paused: false,
                        ready: false,
                        healthy: false,
                    }
                }
            }
        });
        let mut results = futures::future::join_all(probes).await;
        results.sort_by(|a, b| a.queue.cmp(&b.queue));
        results
    }

    /// Pauses intake on the named queue.
    pub async fn pause_queue(&self, name: &str) -> Result<(), MonitorError> {
        self.broker(name)?.pause().await?;
        info!(queue = name, "Queue paused");
        self.core.notify(MonitorEvent::QueuePaused {
            queue: name.to_string(),
        });
        Ok(())
    }

    /// Resumes intake on the named queue.
    pub async fn resume_queue(&self, name: &str) -> Result<(), MonitorError> {
        self.broker(name)?.resume().await?;
        info!(queue = name, "Queue resumed");
        self.core.notify(MonitorEvent::QueueResumed {
            queue: name.to_string(),
        });
        Ok(())
    }

    /// Recent terminally failed jobs for the named queue, newest first.
    pub async fn get_failed_jobs(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<FailedJob>, MonitorError> {
        Ok(self.broker(name)?.failed_jobs(0, limit).await?)
    }

    /// Re-submits failed jobs: either the given ids or every currently
    /// failed job. Each retry is attempted independently; one failure
    /// never aborts the rest.
    pub async fn retry_failed_jobs(
        &self,
        name: &str,
        job_ids: Option<Vec<Uuid>>,
    ) -> Result<Vec<RetryOutcome>, MonitorError> {
        let broker = self.broker(name)?;

        let ids = match job_ids {
            Some(ids) => ids,
            None => broker
                .failed_jobs(0, usize::MAX)
                .await?
                .into_iter()
                .map(|job| job.id)
                .collect(),
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            match broker.retry_failed(id).await {
                Ok(()) => outcomes.push(RetryOutcome {
                    job_id: id,
                    success: true,
                    error: None,
                }),
                Err(e) => outcomes.push(RetryOutcome {
                    job_id: id,
                    success: false,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(outcomes)
    }

    /// Purges completed-job records for one queue or all of them.
    pub async fn clear_completed(&self, name: Option<&str>) -> Vec<ClearOutcome> {
        let targets: Vec<(String, Arc<dyn JobBroker>)> = match name {
            Some(name) => match self.queues.get(name) {
                Some(broker) => vec![(name.to_string(), Arc::clone(broker))],
                None => {
                    return vec![ClearOutcome {
                        queue: name.to_string(),
                        success: false,
                        error: Some(MonitorError::UnknownQueue(name.to_string()).to_string()),
                    }]
                }
            },
            None => self
                .queues
                .iter()
                .map(|(name, broker)| (name.clone(), Arc::clone(broker)))
                .collect(),
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for (queue, broker) in targets {
            let outcome = match broker.clean_completed().await {
                Ok(()) => ClearOutcome {
                    queue,
                    success: true,
                    error: None,
                },
                Err(e) => ClearOutcome {
                    queue,
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.queue.cmp(&b.queue));
        outcomes
    }

    /// Most recent alerts, newest first, optionally filtered by severity.
    pub fn get_alerts(&self, severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        self.core.lock_state().alerts.recent(severity, limit)
    }

    /// The monitor's derived per-queue performance view.
    pub fn get_performance_metrics(&self) -> HashMap<String, PerformanceSummary> {
        let state = self.core.lock_state();
        self.queues
            .keys()
            .map(|name| {
                let summary = state
                    .windows
                    .get(name)
                    .map(PerformanceWindow::summarize)
                    .unwrap_or_default();
                (name.clone(), summary)
            })
            .collect()
    }
}

//! Worker pool for sending delivery jobs.
//!
//! The consumer side of the queue: a pool of async tasks that claim jobs
//! from a shared broker, resolve the channel template, invoke the channel
//! client, and report the terminal outcome back to the broker. The broker
//! decides retry versus terminal failure; a worker never requeues by
//! itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::metrics::MetricsCollector;
use crate::queue::{ClaimedJob, DeliveryResult, FailDisposition, JobBroker};
use crate::store::ChannelClient;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently sending.
    pub active_workers: usize,
    /// Jobs that reached a sent terminal state.
    pub jobs_sent: u64,
    /// Send attempts that failed (including retried attempts).
    pub jobs_failed: u64,
    /// Average send duration.
    pub average_send_duration: Duration,
}

impl PoolStats {
    /// Total send attempts processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_sent + self.jobs_failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_sent as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_sent: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_sent: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_sent(&self, duration: Duration) {
        self.jobs_sent.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let sent = self.jobs_sent.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = sent + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_sent: sent,
            jobs_failed: failed,
            average_send_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers sending jobs from a queue.
pub struct WorkerPool {
    config: DispatchConfig,
    broker: Arc<dyn JobBroker>,
    channel: Arc<dyn ChannelClient>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over an existing broker and channel client.
    pub fn new(
        config: DispatchConfig,
        broker: Arc<dyn JobBroker>,
        channel: Arc<dyn ChannelClient>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            broker,
            channel,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{i}"),
                broker: Arc::clone(&self.broker),
                channel: Arc::clone(&self.channel),
                shutdown_rx: self.shutdown_tx.subscribe(),
                claim_timeout: self.config.claim_timeout,
                // A send outlasting the stall timeout would be reclaimed
                // by the broker anyway, so cap it there.
                send_timeout: self.config.stall_timeout,
                template_name: self.config.template_name.clone(),
                stats: Arc::clone(&self.stats),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        MetricsCollector::new().update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal and waits for workers to finish their
    /// current sends.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().update_workers(0);

        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that sends jobs claimed from the queue.
struct Worker {
    id: String,
    broker: Arc<dyn JobBroker>,
    channel: Arc<dyn ChannelClient>,
    shutdown_rx: broadcast::Receiver<()>,
    claim_timeout: Duration,
    send_timeout: Duration,
    template_name: String,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop: claim, send, report, until shutdown.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.broker.claim(self.claim_timeout).await {
                Ok(Some(claimed)) => {
                    self.process_job(claimed).await;
                }
                Ok(None) => {
                    // No job due; the claim already waited claim_timeout.
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::time::sleep(self.claim_timeout).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sends one claimed job and reports the outcome to the broker.
    async fn process_job(&self, claimed: ClaimedJob) {
        let job_id = claimed.id;
        let tier = claimed.job.tier.to_string();
        let start_time = Instant::now();
        let metrics = MetricsCollector::new();

        info!(
            worker_id = %self.id,
            %job_id,
            advisor_id = %claimed.job.advisor_id,
            attempt = claimed.attempt,
            "Sending delivery"
        );

        self.stats.increment_active();
        metrics.inc_jobs_in_progress();

        let send_future = self.channel.send(
            &claimed.job.phone_number,
            &self.template_name,
            &claimed.job.language,
            &claimed.job.parameters,
        );
        let send_outcome = tokio::time::timeout(self.send_timeout, send_future).await;
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        metrics.dec_jobs_in_progress();

        match send_outcome {
            Ok(Ok(receipt)) => {
                let result = DeliveryResult::sent(job_id, receipt.channel_message_id);
                if let Err(e) = self.broker.complete(job_id, result).await {
                    error!(worker_id = %self.id, %job_id, error = %e, "Failed to mark job complete");
                    return;
                }
                self.stats.record_sent(duration);
                metrics.record_delivery("sent", &tier, duration);
                info!(
                    worker_id = %self.id,
                    %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Delivery sent"
                );
            }
            Ok(Err(e)) => {
                self.report_failure(job_id, &tier, &e.to_string(), duration)
                    .await;
            }
            Err(_) => {
                let message = format!("send timed out after {:?}", self.send_timeout);
                self.report_failure(job_id, &tier, &message, duration).await;
            }
        }
    }

    async fn report_failure(&self, job_id: uuid::Uuid, tier: &str, error: &str, duration: Duration) {
        self.stats.record_failure(duration);

        match self.broker.fail(job_id, error).await {
            Ok(FailDisposition::Retried) => {
                warn!(worker_id = %self.id, %job_id, error, "Send failed, job requeued for retry");
            }
            Ok(FailDisposition::Terminal) => {
                MetricsCollector::new().record_delivery("failed", tier, duration);
                error!(worker_id = %self.id, %job_id, error, "Send failed terminally");
            }
            Err(e) => {
                error!(worker_id = %self.id, %job_id, error = %e, "Failed to report job failure");
            }
        }
    }
}

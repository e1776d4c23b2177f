//! Broker contract for the delivery job queue.
//!
//! The scheduler and monitor never talk to a concrete queue implementation;
//! they hold a `JobBroker` trait object. Any implementation must preserve:
//!
//! - durable enqueue with delayed eligibility
//! - priority ordering with FIFO tie-break within a priority
//! - at-least-once delivery to exactly one active worker at a time
//! - stall detection for claims that stop making progress
//!
//! Lifecycle events are published on a broadcast channel; dropping the
//! receiver unsubscribes. Ordering of delivery to different subscribers is
//! unspecified and must not be relied upon.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::job::{DeliveryJob, DeliveryResult, DEFAULT_MAX_ATTEMPTS};

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to reach the backing store.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Backing store operation failed.
    #[error("Broker operation failed: {0}")]
    Backend(String),

    /// Failed to serialize or deserialize a job payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not found.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// Waiting for a job result exceeded the allowed time.
    #[error("Timed out after {0:?} waiting for job result")]
    ResultTimeout(Duration),
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        BrokerError::Backend(e.to_string())
    }
}

/// Options supplied when enqueueing a job.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Delay before the job becomes eligible for claim.
    pub delay: Duration,
    /// Numeric queue priority; lower values dequeue first.
    pub priority: u8,
    /// Maximum send attempts before the job is terminally failed.
    pub max_attempts: u32,
    /// Optional key suppressing duplicate enqueues while a prior job with
    /// the same key is non-terminal.
    pub dedupe_key: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dedupe_key: None,
        }
    }
}

impl EnqueueOptions {
    /// Sets the eligibility delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the numeric priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the dedupe key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job was admitted under this id.
    New(Uuid),
    /// A non-terminal job with the same dedupe key already exists; no new
    /// job was created.
    Duplicate(Uuid),
}

impl Enqueued {
    /// The id of the live job for this enqueue key.
    pub fn job_id(&self) -> Uuid {
        match self {
            Enqueued::New(id) | Enqueued::Duplicate(id) => *id,
        }
    }

    /// Returns whether a new job was admitted.
    pub fn is_new(&self) -> bool {
        matches!(self, Enqueued::New(_))
    }
}

/// A job claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Broker-assigned job id.
    pub id: Uuid,
    /// 1-based attempt number of this claim.
    pub attempt: u32,
    /// The job payload.
    pub job: DeliveryJob,
}

/// Disposition after reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// The job was requeued for another attempt.
    Retried,
    /// The job exhausted its attempts and is terminally failed.
    Terminal,
}

/// Point-in-time job counts for a queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: bool,
}

impl JobCounts {
    /// Total jobs known to the queue in any state.
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// A terminally failed job as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: Uuid,
    pub job: DeliveryJob,
    pub failed_reason: String,
    pub attempts_made: u32,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle events published by a broker.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A worker claimed the job.
    Active { id: Uuid, job: DeliveryJob },
    /// The job reached a successful terminal state.
    Completed { id: Uuid, result: DeliveryResult },
    /// The job reached a failed terminal state.
    Failed {
        id: Uuid,
        error: String,
        attempts_made: u32,
    },
    /// A claim stopped making progress and was returned to the queue.
    Stalled { id: Uuid, job: DeliveryJob },
    /// The broker itself hit an infrastructure error.
    BrokerError { message: String },
}

/// Persistent, multi-consumer work queue for delivery jobs.
///
/// See the module docs for the capabilities every implementation must
/// preserve. All methods are safe for concurrent use from multiple tasks
/// and processes; the broker serializes claim mutations.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Name of this queue (used for metrics and operator output).
    fn name(&self) -> &str;

    /// Admits a job, subject to delay, priority and dedupe suppression.
    async fn enqueue(
        &self,
        job: DeliveryJob,
        options: EnqueueOptions,
    ) -> Result<Enqueued, BrokerError>;

    /// Claims the next due job, waiting up to `timeout` for one to become
    /// available. Returns `None` on timeout or while the queue is paused.
    async fn claim(&self, timeout: Duration) -> Result<Option<ClaimedJob>, BrokerError>;

    /// Records a successful terminal result for a claimed job.
    async fn complete(&self, id: Uuid, result: DeliveryResult) -> Result<(), BrokerError>;

    /// Records a failed attempt for a claimed job. The broker decides
    /// between requeue and terminal failure based on the attempt budget.
    async fn fail(&self, id: Uuid, error: &str) -> Result<FailDisposition, BrokerError>;

    /// Blocks until the job reaches a terminal state, up to `timeout`.
    async fn await_result(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<DeliveryResult, BrokerError>;

    /// Current job counts.
    async fn counts(&self) -> Result<JobCounts, BrokerError>;

    /// Whether intake is currently paused.
    async fn is_paused(&self) -> Result<bool, BrokerError>;

    /// Whether the backing store is reachable.
    async fn is_ready(&self) -> bool;

    /// Pauses claims (already-active jobs run to completion).
    async fn pause(&self) -> Result<(), BrokerError>;

    /// Resumes claims.
    async fn resume(&self) -> Result<(), BrokerError>;

    /// Purges completed-job records.
    async fn clean_completed(&self) -> Result<(), BrokerError>;

    /// Returns terminally failed jobs, newest first.
    async fn failed_jobs(&self, offset: usize, limit: usize)
        -> Result<Vec<FailedJob>, BrokerError>;

    /// Re-submits a terminally failed job with a fresh attempt budget.
    async fn retry_failed(&self, id: Uuid) -> Result<(), BrokerError>;

    /// Subscribes to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_options_builder() {
        let opts = EnqueueOptions::default()
            .with_delay(Duration::from_secs(30))
            .with_priority(2)
            .with_max_attempts(5)
            .with_dedupe_key("delivery-a-b");

        assert_eq!(opts.delay, Duration::from_secs(30));
        assert_eq!(opts.priority, 2);
        assert_eq!(opts.max_attempts, 5);
        assert_eq!(opts.dedupe_key.as_deref(), Some("delivery-a-b"));
    }

    #[test]
    fn test_enqueued_accessors() {
        let id = Uuid::new_v4();
        assert!(Enqueued::New(id).is_new());
        assert!(!Enqueued::Duplicate(id).is_new());
        assert_eq!(Enqueued::Duplicate(id).job_id(), id);
    }

    #[test]
    fn test_job_counts_total() {
        let counts = JobCounts {
            waiting: 3,
            active: 1,
            completed: 10,
            failed: 2,
            delayed: 4,
            paused: false,
        };
        assert_eq!(counts.total(), 20);
    }

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = BrokerError::ResultTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}

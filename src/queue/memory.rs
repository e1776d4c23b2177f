//! In-memory broker implementation.
//!
//! Implements the full `JobBroker` contract against process-local state,
//! primarily for the test suite and embedded use. Eligibility, priority
//! ordering, dedupe suppression, bounded retries and stall detection all
//! behave exactly as the redis broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify, RwLock};
use uuid::Uuid;

use super::broker::{
    BrokerError, ClaimedJob, Enqueued, EnqueueOptions, FailDisposition, FailedJob, JobBroker,
    JobCounts, QueueEvent,
};
use super::job::{DeliveryJob, DeliveryResult};

/// Default stall timeout for claimed jobs.
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A stored job with its queueing metadata.
#[derive(Debug, Clone)]
struct StoredJob {
    job: DeliveryJob,
    priority: u8,
    seq: u64,
    attempts: u32,
    max_attempts: u32,
    dedupe_key: Option<String>,
}

/// A terminally failed job kept for operator retry.
#[derive(Debug, Clone)]
struct FailedEntry {
    stored: StoredJob,
    reason: String,
    failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    seq: u64,
    paused: bool,
    /// Jobs eligible for claim, ordered by (priority, seq): lower priority
    /// value first, FIFO within a priority.
    ready: BTreeMap<(u8, u64), Uuid>,
    /// Jobs not yet eligible, keyed by id with their eligibility instant.
    delayed: HashMap<Uuid, DateTime<Utc>>,
    jobs: HashMap<Uuid, StoredJob>,
    /// Claimed jobs and when they were claimed, for stall detection.
    processing: HashMap<Uuid, Instant>,
    results: HashMap<Uuid, DeliveryResult>,
    failed: VecDeque<(Uuid, FailedEntry)>,
    dedupe: HashMap<String, Uuid>,
    completed_count: usize,
}

/// Process-local `JobBroker` implementation.
pub struct MemoryBroker {
    name: String,
    stall_timeout: Duration,
    state: RwLock<State>,
    notify: Arc<Notify>,
    events: broadcast::Sender<QueueEvent>,
}

impl MemoryBroker {
    /// Creates a broker for the named queue with the default stall timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stall_timeout(name, DEFAULT_STALL_TIMEOUT)
    }

    /// Creates a broker with an explicit stall timeout.
    pub fn with_stall_timeout(name: impl Into<String>, stall_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            stall_timeout,
            state: RwLock::new(State::default()),
            notify: Arc::new(Notify::new()),
            events,
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine; events are best-effort.
        let _ = self.events.send(event);
    }

    /// Moves due delayed jobs into the ready set and returns stalled claims
    /// to the queue. Called under the write lock on every claim attempt.
    fn sweep(&self, state: &mut State, stalled: &mut Vec<(Uuid, DeliveryJob)>) {
        let now = Utc::now();
        let due: Vec<Uuid> = state
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            state.delayed.remove(&id);
            if let Some(stored) = state.jobs.get(&id) {
                state.ready.insert((stored.priority, stored.seq), id);
            }
        }

        let cutoff = Instant::now();
        let expired: Vec<Uuid> = state
            .processing
            .iter()
            .filter(|(_, claimed)| cutoff.duration_since(**claimed) >= self.stall_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            state.processing.remove(&id);
            if let Some(stored) = state.jobs.get(&id) {
                state.ready.insert((stored.priority, stored.seq), id);
                stalled.push((id, stored.job.clone()));
            }
        }
    }
}

#[cfg(test)]
impl MemoryBroker {
    /// Eligibility instants of all currently delayed jobs.
    pub(crate) async fn delayed_eligibility(&self) -> Vec<DateTime<Utc>> {
        self.state.read().await.delayed.values().copied().collect()
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        job: DeliveryJob,
        options: EnqueueOptions,
    ) -> Result<Enqueued, BrokerError> {
        let mut state = self.state.write().await;

        if let Some(key) = &options.dedupe_key {
            if let Some(existing) = state.dedupe.get(key) {
                return Ok(Enqueued::Duplicate(*existing));
            }
        }

        let id = Uuid::new_v4();
        state.seq += 1;
        let stored = StoredJob {
            job,
            priority: options.priority,
            seq: state.seq,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            dedupe_key: options.dedupe_key.clone(),
        };

        if options.delay.is_zero() {
            state.ready.insert((stored.priority, stored.seq), id);
        } else {
            let eligible_at = Utc::now()
                + chrono::Duration::from_std(options.delay)
                    .map_err(|e| BrokerError::Backend(e.to_string()))?;
            state.delayed.insert(id, eligible_at);
        }

        if let Some(key) = options.dedupe_key {
            state.dedupe.insert(key, id);
        }
        state.jobs.insert(id, stored);
        drop(state);

        self.notify.notify_waiters();
        Ok(Enqueued::New(id))
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<ClaimedJob>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();

            let mut stalled = Vec::new();
            let claimed = {
                let mut state = self.state.write().await;
                self.sweep(&mut state, &mut stalled);

                if state.paused {
                    None
                } else if let Some((&key, &id)) = state.ready.iter().next() {
                    state.ready.remove(&key);
                    state.processing.insert(id, Instant::now());
                    let stored = state
                        .jobs
                        .get_mut(&id)
                        .ok_or(BrokerError::JobNotFound(id))?;
                    stored.attempts += 1;
                    Some(ClaimedJob {
                        id,
                        attempt: stored.attempts,
                        job: stored.job.clone(),
                    })
                } else {
                    None
                }
            };

            for (id, job) in stalled {
                self.emit(QueueEvent::Stalled { id, job });
            }

            if let Some(claimed) = claimed {
                self.emit(QueueEvent::Active {
                    id: claimed.id,
                    job: claimed.job.clone(),
                });
                return Ok(Some(claimed));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Wake early on enqueue/resume; otherwise re-sweep periodically
            // so delayed jobs promote without an external nudge.
            let wait = remaining.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn complete(&self, id: Uuid, result: DeliveryResult) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        state.processing.remove(&id);
        if let Some(stored) = state.jobs.remove(&id) {
            if let Some(key) = stored.dedupe_key {
                state.dedupe.remove(&key);
            }
        }
        state.completed_count += 1;
        state.results.insert(id, result.clone());
        drop(state);

        self.notify.notify_waiters();
        self.emit(QueueEvent::Completed { id, result });
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailDisposition, BrokerError> {
        let mut state = self.state.write().await;
        state.processing.remove(&id);

        let stored = state.jobs.get(&id).ok_or(BrokerError::JobNotFound(id))?;
        let attempts = stored.attempts;
        let max_attempts = stored.max_attempts;

        if attempts < max_attempts {
            // Requeue with a fresh sequence number: retries go to the back
            // of their priority class.
            state.seq += 1;
            let seq = state.seq;
            let stored = state
                .jobs
                .get_mut(&id)
                .ok_or(BrokerError::JobNotFound(id))?;
            stored.seq = seq;
            let key = (stored.priority, seq);
            state.ready.insert(key, id);
            drop(state);

            self.notify.notify_waiters();
            return Ok(FailDisposition::Retried);
        }

        let stored = state
            .jobs
            .remove(&id)
            .ok_or(BrokerError::JobNotFound(id))?;
        if let Some(key) = &stored.dedupe_key {
            state.dedupe.remove(key);
        }
        let result = DeliveryResult::failed(id, error);
        state.results.insert(id, result);
        state.failed.push_front((
            id,
            FailedEntry {
                stored,
                reason: error.to_string(),
                failed_at: Utc::now(),
            },
        ));
        drop(state);

        self.notify.notify_waiters();
        self.emit(QueueEvent::Failed {
            id,
            error: error.to_string(),
            attempts_made: attempts,
        });
        Ok(FailDisposition::Terminal)
    }

    async fn await_result(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<DeliveryResult, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();

            if let Some(result) = self.state.read().await.results.get(&id) {
                return Ok(result.clone());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::ResultTimeout(timeout));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn counts(&self) -> Result<JobCounts, BrokerError> {
        let state = self.state.read().await;
        Ok(JobCounts {
            waiting: state.ready.len(),
            active: state.processing.len(),
            completed: state.completed_count,
            failed: state.failed.len(),
            delayed: state.delayed.len(),
            paused: state.paused,
        })
    }

    async fn is_paused(&self) -> Result<bool, BrokerError> {
        Ok(self.state.read().await.paused)
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn pause(&self) -> Result<(), BrokerError> {
        self.state.write().await.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), BrokerError> {
        self.state.write().await.paused = false;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn clean_completed(&self) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        state.completed_count = 0;
        state.results.retain(|_, result| !result.is_sent());
        Ok(())
    }

    async fn failed_jobs(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FailedJob>, BrokerError> {
        let state = self.state.read().await;
        Ok(state
            .failed
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(id, entry)| FailedJob {
                id: *id,
                job: entry.stored.job.clone(),
                failed_reason: entry.reason.clone(),
                attempts_made: entry.stored.attempts,
                timestamp: entry.failed_at,
            })
            .collect())
    }

    async fn retry_failed(&self, id: Uuid) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        let position = state
            .failed
            .iter()
            .position(|(fid, _)| *fid == id)
            .ok_or(BrokerError::JobNotFound(id))?;
        let (_, entry) = state
            .failed
            .remove(position)
            .ok_or(BrokerError::JobNotFound(id))?;

        state.seq += 1;
        let seq = state.seq;
        let mut stored = entry.stored;
        stored.attempts = 0;
        stored.seq = seq;
        let priority = stored.priority;
        if let Some(key) = &stored.dedupe_key {
            state.dedupe.insert(key.clone(), id);
        }
        state.results.remove(&id);
        state.ready.insert((priority, seq), id);
        state.jobs.insert(id, stored);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::Tier;

    fn test_job(advisor: &str, content: &str, tier: Tier) -> DeliveryJob {
        DeliveryJob::new(advisor, content, "+919876543210", tier)
    }

    #[tokio::test]
    async fn test_enqueue_and_claim_fifo() {
        let broker = MemoryBroker::new("test");

        let first = broker
            .enqueue(test_job("a", "1", Tier::Standard), EnqueueOptions::default())
            .await
            .unwrap();
        let second = broker
            .enqueue(test_job("b", "2", Tier::Standard), EnqueueOptions::default())
            .await
            .unwrap();

        let claimed = broker.claim(Duration::from_millis(100)).await.unwrap();
        assert_eq!(claimed.unwrap().id, first.job_id());
        let claimed = broker.claim(Duration::from_millis(100)).await.unwrap();
        assert_eq!(claimed.unwrap().id, second.job_id());
    }

    #[tokio::test]
    async fn test_priority_order_across_tiers() {
        let broker = MemoryBroker::new("test");

        let low = broker
            .enqueue(
                test_job("a", "1", Tier::Free),
                EnqueueOptions::default().with_priority(Tier::Free.queue_priority()),
            )
            .await
            .unwrap();
        let high = broker
            .enqueue(
                test_job("b", "2", Tier::Enterprise),
                EnqueueOptions::default().with_priority(Tier::Enterprise.queue_priority()),
            )
            .await
            .unwrap();

        let first = broker.claim(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.unwrap().id, high.job_id());
        let second = broker.claim(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.unwrap().id, low.job_id());
    }

    #[tokio::test]
    async fn test_delay_gates_claims() {
        let broker = MemoryBroker::new("test");

        broker
            .enqueue(
                test_job("a", "1", Tier::Pro),
                EnqueueOptions::default().with_delay(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert!(broker
            .claim(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        let claimed = broker.claim(Duration::from_millis(500)).await.unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn test_delay_not_overridden_by_priority() {
        let broker = MemoryBroker::new("test");

        // High priority but delayed; low priority but due now.
        broker
            .enqueue(
                test_job("a", "1", Tier::Enterprise),
                EnqueueOptions::default()
                    .with_priority(1)
                    .with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        let due = broker
            .enqueue(
                test_job("b", "2", Tier::Free),
                EnqueueOptions::default().with_priority(4),
            )
            .await
            .unwrap();

        let claimed = broker.claim(Duration::from_millis(100)).await.unwrap();
        assert_eq!(claimed.unwrap().id, due.job_id());
    }

    #[tokio::test]
    async fn test_dedupe_suppresses_duplicates() {
        let broker = MemoryBroker::new("test");
        let job = test_job("a", "1", Tier::Pro);
        let opts = EnqueueOptions::default().with_dedupe_key(job.dedupe_key());

        let first = broker.enqueue(job.clone(), opts.clone()).await.unwrap();
        let second = broker.enqueue(job.clone(), opts.clone()).await.unwrap();

        assert!(first.is_new());
        assert_eq!(second, Enqueued::Duplicate(first.job_id()));

        // Once terminal, the key is released.
        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        broker
            .complete(claimed.id, DeliveryResult::sent(claimed.id, "m-1"))
            .await
            .unwrap();

        let third = broker.enqueue(job, opts).await.unwrap();
        assert!(third.is_new());
    }

    #[tokio::test]
    async fn test_racing_enqueues_admit_exactly_one_job() {
        let broker = Arc::new(MemoryBroker::new("test"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let broker = Arc::clone(&broker);
            handles.push(tokio::spawn(async move {
                let job = test_job("a", "1", Tier::Pro);
                let opts = EnqueueOptions::default().with_dedupe_key(job.dedupe_key());
                broker.enqueue(job, opts).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_new() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1, "concurrent enqueues must dedupe to one job");

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.waiting + counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_bounded_retries_then_terminal() {
        let broker = MemoryBroker::new("test");
        broker
            .enqueue(
                test_job("a", "1", Tier::Standard),
                EnqueueOptions::default().with_max_attempts(2),
            )
            .await
            .unwrap();

        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempt, 1);
        let disposition = broker.fail(claimed.id, "channel timeout").await.unwrap();
        assert_eq!(disposition, FailDisposition::Retried);

        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempt, 2);
        let disposition = broker.fail(claimed.id, "channel timeout").await.unwrap();
        assert_eq!(disposition, FailDisposition::Terminal);

        let failed = broker.failed_jobs(0, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason, "channel timeout");
        assert_eq!(failed[0].attempts_made, 2);
    }

    #[tokio::test]
    async fn test_pause_blocks_claims() {
        let broker = MemoryBroker::new("test");
        broker
            .enqueue(test_job("a", "1", Tier::Pro), EnqueueOptions::default())
            .await
            .unwrap();

        broker.pause().await.unwrap();
        assert!(broker
            .claim(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        broker.resume().await.unwrap();
        assert!(broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_stalled_claim_returns_to_queue() {
        let broker = MemoryBroker::with_stall_timeout("test", Duration::from_millis(50));
        let mut events = broker.subscribe();

        broker
            .enqueue(test_job("a", "1", Tier::Pro), EnqueueOptions::default())
            .await
            .unwrap();

        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        // Worker "dies": never completes. The next claim sweep requeues it.
        tokio::time::sleep(Duration::from_millis(80)).await;

        let reclaimed = broker
            .claim(Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, claimed.id);

        let mut saw_stall = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, QueueEvent::Stalled { id, .. } if id == claimed.id) {
                saw_stall = true;
            }
        }
        assert!(saw_stall, "stall event should have been published");
    }

    #[tokio::test]
    async fn test_await_result_blocks_until_terminal() {
        let broker = Arc::new(MemoryBroker::new("test"));
        let enqueued = broker
            .enqueue(test_job("a", "1", Tier::Pro), EnqueueOptions::default())
            .await
            .unwrap();
        let id = enqueued.job_id();

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.await_result(id, Duration::from_secs(2)).await })
        };

        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        broker
            .complete(claimed.id, DeliveryResult::sent(claimed.id, "m-9"))
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_sent());
        assert_eq!(result.channel_message_id.as_deref(), Some("m-9"));
    }

    #[tokio::test]
    async fn test_retry_failed_resets_attempts() {
        let broker = MemoryBroker::new("test");
        broker
            .enqueue(
                test_job("a", "1", Tier::Standard),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .unwrap();

        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        broker.fail(claimed.id, "boom").await.unwrap();

        broker.retry_failed(claimed.id).await.unwrap();
        assert!(broker.failed_jobs(0, 10).await.unwrap().is_empty());

        let reclaimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.attempt, 1);
    }

    #[tokio::test]
    async fn test_retry_unknown_job_is_an_error() {
        let broker = MemoryBroker::new("test");
        let err = broker.retry_failed(Uuid::new_v4()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_counts_reflect_lifecycle() {
        let broker = MemoryBroker::new("test");
        broker
            .enqueue(test_job("a", "1", Tier::Pro), EnqueueOptions::default())
            .await
            .unwrap();
        broker
            .enqueue(
                test_job("b", "2", Tier::Pro),
                EnqueueOptions::default().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.active, 0);

        let claimed = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 1);

        broker
            .complete(claimed.id, DeliveryResult::sent(claimed.id, "m"))
            .await
            .unwrap();
        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
    }
}

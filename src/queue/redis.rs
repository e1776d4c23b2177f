//! Redis-backed broker implementation.
//!
//! # Key layout
//!
//! All keys are prefixed with the queue name:
//!
//! - `{q}:ready`: sorted set of claimable job ids, scored by
//!   `priority * 2^40 + seq` so lower priority values dequeue first and
//!   insertion order breaks ties within a priority
//! - `{q}:delayed`: sorted set of not-yet-eligible job ids, scored by the
//!   eligibility instant in epoch milliseconds
//! - `{q}:jobs`: hash of id -> serialized job record
//! - `{q}:processing`: hash of id -> claim instant (epoch ms), used for
//!   stall detection and crash recovery
//! - `{q}:failed`: list of terminally failed job records, newest first
//! - `{q}:dedupe`: hash of enqueue key -> live job id, reserved with HSETNX
//! - `{q}:results:{id}`: terminal result, kept for 7 days
//!
//! # Reliability
//!
//! A claim pops the lowest-scored ready id and writes the claim into the
//! processing hash in a single server-side script, so at every instant the
//! id is in exactly one of the two structures: two workers can never receive
//! the same member, and a worker that dies mid-claim leaves nothing
//! stranded. Claims older than the stall timeout are swept back into the
//! ready set on the next claim attempt, which also recovers jobs from
//! workers that crashed later on; the processing hash survives restarts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use super::broker::{
    BrokerError, ClaimedJob, Enqueued, EnqueueOptions, FailDisposition, FailedJob, JobBroker,
    JobCounts, QueueEvent,
};
use super::job::{DeliveryJob, DeliveryResult};

/// Result retention, matching the broker's completed-job history window.
const RESULT_TTL_SECS: u64 = 604_800; // 7 days

/// Score stride separating priority classes in the ready set.
///
/// Sequence numbers stay well below 2^40, so `priority * STRIDE + seq` is
/// exactly representable as an f64 and orders first by priority, then FIFO.
const PRIORITY_STRIDE: u64 = 1 << 40;

/// How often the claim loop re-polls redis while waiting for work.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How often `await_result` re-polls for a terminal result.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pops the lowest-scored ready id and records its claim instant in the
/// processing hash, in one server-side step.
const CLAIM_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if #popped == 0 then
    return false
end
redis.call('HSET', KEYS[2], popped[1], ARGV[1])
return popped[1]
"#;

/// Serialized representation of a queued job and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job: DeliveryJob,
    priority: u8,
    attempts: u32,
    max_attempts: u32,
    #[serde(default)]
    dedupe_key: Option<String>,
}

/// Redis-backed `JobBroker`.
pub struct RedisBroker {
    redis: ConnectionManager,
    name: String,
    stall_timeout: Duration,
    events: broadcast::Sender<QueueEvent>,
    ready_key: String,
    delayed_key: String,
    jobs_key: String,
    processing_key: String,
    failed_key: String,
    dedupe_key: String,
    seq_key: String,
    completed_key: String,
    paused_key: String,
}

impl RedisBroker {
    /// Connects to redis and creates a broker for the named queue.
    pub async fn connect(
        redis_url: &str,
        name: &str,
        stall_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, name, stall_timeout))
    }

    /// Creates a broker from an existing connection manager.
    ///
    /// Useful when sharing a connection pool across queues.
    pub fn from_connection(redis: ConnectionManager, name: &str, stall_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            redis,
            name: name.to_string(),
            stall_timeout,
            events,
            ready_key: format!("{name}:ready"),
            delayed_key: format!("{name}:delayed"),
            jobs_key: format!("{name}:jobs"),
            processing_key: format!("{name}:processing"),
            failed_key: format!("{name}:failed"),
            dedupe_key: format!("{name}:dedupe"),
            seq_key: format!("{name}:seq"),
            completed_key: format!("{name}:completed"),
            paused_key: format!("{name}:paused"),
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn result_key(&self, id: Uuid) -> String {
        format!("{}:results:{}", self.name, id)
    }

    async fn load_record(&self, id: Uuid) -> Result<JobRecord, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(&self.jobs_key, id.to_string()).await?;
        match data {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Err(BrokerError::JobNotFound(id)),
        }
    }

    async fn store_record(&self, id: Uuid, record: &JobRecord) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let data = serde_json::to_string(record)?;
        conn.hset::<_, _, _, ()>(&self.jobs_key, id.to_string(), data)
            .await?;
        Ok(())
    }

    async fn next_score(&self, priority: u8) -> Result<f64, BrokerError> {
        let mut conn = self.redis.clone();
        let seq: u64 = conn.incr(&self.seq_key, 1).await?;
        Ok((priority as u64 * PRIORITY_STRIDE + seq) as f64)
    }

    /// Promotes due delayed jobs and requeues stalled claims.
    async fn sweep(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();

        // Delayed -> ready.
        let due: Vec<String> = conn
            .zrangebyscore(&self.delayed_key, f64::NEG_INFINITY, now_ms as f64)
            .await?;
        for id_str in due {
            let Ok(id) = id_str.parse::<Uuid>() else {
                continue;
            };
            let record = match self.load_record(id).await {
                Ok(record) => record,
                Err(_) => {
                    conn.zrem::<_, _, ()>(&self.delayed_key, &id_str).await?;
                    continue;
                }
            };
            let score = self.next_score(record.priority).await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .zrem(&self.delayed_key, &id_str)
                .zadd(&self.ready_key, &id_str, score);
            pipe.query_async::<_, ()>(&mut conn).await?;
        }

        // Stalled claims -> ready.
        let claims: Vec<(String, i64)> = conn.hgetall(&self.processing_key).await?;
        let cutoff = now_ms - self.stall_timeout.as_millis() as i64;
        for (id_str, claimed_at) in claims {
            if claimed_at > cutoff {
                continue;
            }
            let Ok(id) = id_str.parse::<Uuid>() else {
                conn.hdel::<_, _, ()>(&self.processing_key, &id_str).await?;
                continue;
            };
            match self.load_record(id).await {
                Ok(record) => {
                    let score = self.next_score(record.priority).await?;
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .hdel(&self.processing_key, &id_str)
                        .zadd(&self.ready_key, &id_str, score);
                    pipe.query_async::<_, ()>(&mut conn).await?;
                    self.emit(QueueEvent::Stalled {
                        id,
                        job: record.job,
                    });
                }
                Err(_) => {
                    conn.hdel::<_, _, ()>(&self.processing_key, &id_str).await?;
                }
            }
        }

        Ok(())
    }

    /// Attempts a single non-blocking claim.
    async fn try_claim(&self) -> Result<Option<ClaimedJob>, BrokerError> {
        let mut conn = self.redis.clone();

        let paused: bool = conn.exists(&self.paused_key).await?;
        if paused {
            return Ok(None);
        }

        // The pop and the claim record land in the same script, so a worker
        // that dies here leaves the id visible to the stall sweep instead of
        // stranding it between structures.
        let popped: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(&self.ready_key)
            .key(&self.processing_key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        let Some(id_str) = popped else {
            return Ok(None);
        };
        let id = id_str
            .parse::<Uuid>()
            .map_err(|e| BrokerError::Backend(format!("malformed job id {id_str}: {e}")))?;

        let mut record = self.load_record(id).await?;
        record.attempts += 1;
        self.store_record(id, &record).await?;

        self.emit(QueueEvent::Active {
            id,
            job: record.job.clone(),
        });
        Ok(Some(ClaimedJob {
            id,
            attempt: record.attempts,
            job: record.job,
        }))
    }

    /// Writes the job record and makes the id claimable, immediately or at
    /// its eligibility instant.
    async fn admit(
        &self,
        id: Uuid,
        record: &JobRecord,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        self.store_record(id, record).await?;
        if delay.is_zero() {
            let score = self.next_score(record.priority).await?;
            conn.zadd::<_, _, _, ()>(&self.ready_key, id.to_string(), score)
                .await?;
        } else {
            let eligible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            conn.zadd::<_, _, _, ()>(&self.delayed_key, id.to_string(), eligible_at as f64)
                .await?;
        }
        Ok(())
    }

    /// Removes a terminal job's bookkeeping (dedupe key and payload).
    async fn remove_job(&self, id: Uuid) -> Result<Option<JobRecord>, BrokerError> {
        let record = match self.load_record(id).await {
            Ok(record) => record,
            Err(BrokerError::JobNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(&self.jobs_key, id.to_string())
            .hdel(&self.processing_key, id.to_string());
        if let Some(key) = &record.dedupe_key {
            pipe.hdel(&self.dedupe_key, key);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(Some(record))
    }

    async fn store_result(&self, id: Uuid, result: &DeliveryResult) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let data = serde_json::to_string(result)?;
        conn.set_ex::<_, _, ()>(self.result_key(id), data, RESULT_TTL_SECS)
            .await?;
        Ok(())
    }
}

/// Terminally failed entry as stored in the failed list.
#[derive(Debug, Serialize, Deserialize)]
struct FailedRecord {
    id: Uuid,
    record: JobRecord,
    reason: String,
    failed_at: i64,
}

#[async_trait]
impl JobBroker for RedisBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        job: DeliveryJob,
        options: EnqueueOptions,
    ) -> Result<Enqueued, BrokerError> {
        let mut conn = self.redis.clone();
        let id = Uuid::new_v4();

        // HSETNX reserves the key in one step, so two enqueuers racing on
        // the same pair cannot both admit a job.
        if let Some(key) = &options.dedupe_key {
            let reserved: bool = conn.hset_nx(&self.dedupe_key, key, id.to_string()).await?;
            if !reserved {
                let existing: Option<String> = conn.hget(&self.dedupe_key, key).await?;
                if let Some(existing_id) = existing.and_then(|s| s.parse::<Uuid>().ok()) {
                    return Ok(Enqueued::Duplicate(existing_id));
                }
                // Malformed leftover entry; take the reservation over.
                conn.hset::<_, _, _, ()>(&self.dedupe_key, key, id.to_string())
                    .await?;
            }
        }

        let record = JobRecord {
            job,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            dedupe_key: options.dedupe_key.clone(),
        };
        if let Err(e) = self.admit(id, &record, options.delay).await {
            // Release the reservation so a later run can retry the pair.
            if let Some(key) = &options.dedupe_key {
                let _ = conn.hdel::<_, _, ()>(&self.dedupe_key, key).await;
            }
            return Err(e);
        }

        Ok(Enqueued::New(id))
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<ClaimedJob>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Err(e) = self.sweep().await {
                warn!(queue = %self.name, error = %e, "Queue sweep failed");
            }
            match self.try_claim().await {
                Ok(Some(claimed)) => return Ok(Some(claimed)),
                Ok(None) => {}
                Err(e) => {
                    self.emit(QueueEvent::BrokerError {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, id: Uuid, result: DeliveryResult) -> Result<(), BrokerError> {
        self.remove_job(id).await?;
        self.store_result(id, &result).await?;
        let mut conn = self.redis.clone();
        conn.incr::<_, _, ()>(&self.completed_key, 1).await?;
        self.emit(QueueEvent::Completed { id, result });
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailDisposition, BrokerError> {
        let record = self.load_record(id).await?;

        if record.attempts < record.max_attempts {
            let mut conn = self.redis.clone();
            let score = self.next_score(record.priority).await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .hdel(&self.processing_key, id.to_string())
                .zadd(&self.ready_key, id.to_string(), score);
            pipe.query_async::<_, ()>(&mut conn).await?;
            return Ok(FailDisposition::Retried);
        }

        let record = self
            .remove_job(id)
            .await?
            .ok_or(BrokerError::JobNotFound(id))?;
        let attempts = record.attempts;
        let failed = FailedRecord {
            id,
            record,
            reason: error.to_string(),
            failed_at: Utc::now().timestamp_millis(),
        };
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.failed_key, serde_json::to_string(&failed)?)
            .await?;
        self.store_result(id, &DeliveryResult::failed(id, error))
            .await?;
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
        let deadline = tokio::time::Instant::now() + timeout;
        let key = self.result_key(id);
        loop {
            let mut conn = self.redis.clone();
            let data: Option<String> = conn.get(&key).await?;
            if let Some(data) = data {
                return Ok(serde_json::from_str(&data)?);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(BrokerError::ResultTimeout(timeout));
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn counts(&self) -> Result<JobCounts, BrokerError> {
        let mut conn = self.redis.clone();
        let (waiting, active, delayed, failed): (usize, usize, usize, usize) = redis::pipe()
            .zcard(&self.ready_key)
            .hlen(&self.processing_key)
            .zcard(&self.delayed_key)
            .llen(&self.failed_key)
            .query_async(&mut conn)
            .await?;
        let completed: Option<usize> = conn.get(&self.completed_key).await?;
        let paused: bool = conn.exists(&self.paused_key).await?;
        Ok(JobCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed,
            delayed,
            paused,
        })
    }

    async fn is_paused(&self) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(&self.paused_key).await?)
    }

    async fn is_ready(&self) -> bool {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn pause(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(&self.paused_key, 1).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.paused_key).await?;
        Ok(())
    }

    async fn clean_completed(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.completed_key).await?;
        Ok(())
    }

    async fn failed_jobs(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FailedJob>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        // Saturate so that "all jobs" limits do not wrap the stop index.
        let stop = (offset.saturating_add(limit).min(isize::MAX as usize) - 1) as isize;
        let entries: Vec<String> = conn.lrange(&self.failed_key, offset as isize, stop).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let failed: FailedRecord = serde_json::from_str(&entry)?;
            jobs.push(FailedJob {
                id: failed.id,
                job: failed.record.job,
                failed_reason: failed.reason,
                attempts_made: failed.record.attempts,
                timestamp: Utc
                    .timestamp_millis_opt(failed.failed_at)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(jobs)
    }

    async fn retry_failed(&self, id: Uuid) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.failed_key, 0, -1).await?;
        for entry in entries {
            let failed: FailedRecord = serde_json::from_str(&entry)?;
            if failed.id != id {
                continue;
            }

            let mut record = failed.record;
            record.attempts = 0;
            self.store_record(id, &record).await?;
            let score = self.next_score(record.priority).await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.failed_key, 1, &entry)
                .zadd(&self.ready_key, id.to_string(), score)
                .del(self.result_key(id));
            if let Some(key) = &record.dedupe_key {
                pipe.hset(&self.dedupe_key, key, id.to_string());
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
            return Ok(());
        }
        Err(BrokerError::JobNotFound(id))
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_stride_preserves_order() {
        // Priority dominates; sequence breaks ties FIFO.
        let high = (1u64 * PRIORITY_STRIDE + 99) as f64;
        let low_early = (4u64 * PRIORITY_STRIDE + 1) as f64;
        let low_late = (4u64 * PRIORITY_STRIDE + 2) as f64;

        assert!(high < low_early);
        assert!(low_early < low_late);
    }

    #[test]
    fn test_scores_exact_in_f64() {
        // The largest score we can produce must round-trip through f64.
        let score = 4u64 * PRIORITY_STRIDE + (PRIORITY_STRIDE - 1);
        assert!(score < 1u64 << 53);
        assert_eq!(score as f64 as u64, score);
    }

    #[test]
    fn test_claim_pops_and_records_in_one_script() {
        // The pop and the processing-hash write must stay in the same
        // server-side unit; splitting them reopens the mid-claim crash
        // window that strands a job in neither structure.
        assert!(CLAIM_SCRIPT.contains("ZPOPMIN"));
        assert!(CLAIM_SCRIPT.contains("HSET"));
        let script = redis::Script::new(CLAIM_SCRIPT);
        assert!(!script.get_hash().is_empty());
    }

    #[test]
    fn test_failed_record_roundtrip() {
        let job = DeliveryJob::new("adv", "c", "+911234567890", crate::queue::job::Tier::Pro);
        let failed = FailedRecord {
            id: Uuid::new_v4(),
            record: JobRecord {
                job,
                priority: 2,
                attempts: 3,
                max_attempts: 3,
                dedupe_key: Some("delivery-adv-c".to_string()),
            },
            reason: "channel unreachable".to_string(),
            failed_at: Utc::now().timestamp_millis(),
        };

        let json = serde_json::to_string(&failed).expect("should serialize");
        let parsed: FailedRecord = serde_json::from_str(&json).expect("should parse");
        assert_eq!(parsed.id, failed.id);
        assert_eq!(parsed.record.attempts, 3);
        assert_eq!(parsed.reason, "channel unreachable");
    }

    #[test]
    fn test_failed_timestamp_conversion() {
        let now = Utc::now();
        let restored = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .expect("valid instant");
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}

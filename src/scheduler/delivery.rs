//! Daily delivery scheduling.
//!
//! The scheduler owns admission of work: it turns due content into queued
//! delivery jobs, exactly once per (advisor, content) pair, spread across
//! the jitter window. It never retries sends itself; retry is the broker's
//! and worker's concern. Its three operations are the daily batch run, the
//! blocking immediate send, and the read-only SLA snapshot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::metrics::MetricsCollector;
use crate::queue::{
    BrokerError, DeliveryJob, DeliveryResult, EnqueueOptions, JobBroker, IMMEDIATE_QUEUE_PRIORITY,
};
use crate::store::{ContentStore, DueContent, StoreError};

use super::params::{build_parameters, ExtractionPolicy, KeywordPolicy, ProfileFields};
use super::window::{format_local, jitter_delay, DeliveryWindow};

/// Errors that can occur during scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The content store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result of one daily scheduling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    /// Jobs newly admitted to the queue.
    pub scheduled: usize,
    /// Items whose enqueue failed.
    pub failed: usize,
    /// Items suppressed because a non-terminal job already exists.
    pub skipped: usize,
    /// Per-item error descriptions, plus the fetch error if the run aborted.
    pub errors: Vec<String>,
    /// The UTC window jobs were spread across.
    pub window: DeliveryWindow,
}

/// SLA classification bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlaStatus {
    Met,
    AtRisk,
    Breached,
}

/// Point-in-time delivery SLA snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaMetrics {
    pub total_scheduled: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    /// `total_delivered / total_scheduled`; 0.0 when nothing was scheduled.
    pub delivery_rate: f64,
    pub sla_status: SlaStatus,
}

/// Admits delivery work to the queue and reports on its outcome.
pub struct DeliveryScheduler {
    config: DispatchConfig,
    broker: Arc<dyn JobBroker>,
    store: Arc<dyn ContentStore>,
    policy: Box<dyn ExtractionPolicy>,
}

impl DeliveryScheduler {
    /// Creates a scheduler with the default keyword extraction policy.
    pub fn new(
        config: DispatchConfig,
        broker: Arc<dyn JobBroker>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            config,
            broker,
            store,
            policy: Box::new(KeywordPolicy),
        }
    }

    /// Replaces the template parameter extraction policy.
    pub fn with_extraction_policy(mut self, policy: Box<dyn ExtractionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Schedules the daily delivery batch.
    ///
    /// `for_date` shifts the reference instant the delivery window is
    /// computed from; it does not filter content. A fetch failure aborts
    /// the run with a single error; per-item enqueue failures are counted
    /// and do not stop the remaining items. Re-running for the same day
    /// does not duplicate jobs that are still non-terminal.
    pub async fn schedule_daily_delivery(
        &self,
        for_date: Option<DateTime<Utc>>,
    ) -> ScheduleOutcome {
        let now = Utc::now();
        let reference = for_date.unwrap_or(now);
        let window = DeliveryWindow::next(
            reference,
            self.config.delivery_timezone,
            self.config.delivery_hour,
            self.config.delivery_minute,
            self.config.jitter_window,
        );
        let mut outcome = ScheduleOutcome {
            scheduled: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            window,
        };

        let local_date = reference
            .with_timezone(&self.config.delivery_timezone)
            .date_naive();
        let mut items = match self.store.fetch_due_content(local_date).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Daily scheduling aborted: content fetch failed");
                outcome.errors.push(format!("Content fetch failed: {e}"));
                return outcome;
            }
        };

        // Highest tier first so FIFO tie-break within a tier follows
        // content-store order.
        items.sort_by(|a, b| b.recipient.tier.cmp(&a.recipient.tier));

        info!(
            items = items.len(),
            window = %format_local(window.opens_at, self.config.delivery_timezone),
            "Scheduling daily delivery batch"
        );

        for item in items {
            match self.enqueue_item(&item, now, window).await {
                Ok(true) => outcome.scheduled += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    warn!(
                        advisor_id = %item.advisor_id,
                        content_id = %item.content_id,
                        error = %e,
                        "Failed to schedule delivery"
                    );
                    outcome.failed += 1;
                    outcome
                        .errors
                        .push(format!("Advisor {}: {e}", item.advisor_id));
                }
            }
        }

        let metrics = MetricsCollector::new();
        metrics.record_scheduled("new", outcome.scheduled);
        metrics.record_scheduled("skipped", outcome.skipped);
        metrics.record_scheduled("failed", outcome.failed);

        info!(
            scheduled = outcome.scheduled,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Daily scheduling run complete"
        );
        outcome
    }

    /// Enqueues one batch item. Returns `Ok(true)` for a new job and
    /// `Ok(false)` when dedupe suppressed it.
    async fn enqueue_item(
        &self,
        item: &DueContent,
        now: DateTime<Utc>,
        window: DeliveryWindow,
    ) -> Result<bool, SchedulerError> {
        let scheduled_for = window.opens_at
            + chrono::Duration::from_std(jitter_delay(self.config.jitter_window))
                .unwrap_or_else(|_| chrono::Duration::zero());
        let delay = (scheduled_for - now).to_std().unwrap_or(Duration::ZERO);

        let profile = ProfileFields {
            business_name: item.recipient.business_name.clone(),
            registration_id: item.recipient.registration_id.clone(),
        };
        let parameters = build_parameters(
            self.policy.as_ref(),
            &item.body,
            &profile,
            scheduled_for,
            self.config.delivery_timezone,
        );

        let job = DeliveryJob::new(
            &item.advisor_id,
            &item.content_id,
            &item.recipient.phone_number,
            item.recipient.tier,
        )
        .with_language(&item.recipient.language)
        .with_scheduled_for(scheduled_for)
        .with_parameters(parameters);

        let options = EnqueueOptions::default()
            .with_delay(delay)
            .with_priority(item.recipient.tier.queue_priority())
            .with_max_attempts(self.config.max_attempts)
            .with_dedupe_key(job.dedupe_key());

        let enqueued = self.broker.enqueue(job, options).await?;
        Ok(enqueued.is_new())
    }

    /// Sends one content unit immediately, bypassing the daily window.
    ///
    /// Enqueues ahead of every batch job and blocks until the job reaches
    /// a terminal state. A missing content id comes back as a `failed`
    /// result, not an error; so does a result-wait timeout.
    pub async fn send_immediate(
        &self,
        advisor_id: &str,
        content_id: &str,
        phone_number: &str,
    ) -> Result<DeliveryResult, SchedulerError> {
        let item = match self.store.fetch_content_and_profile(content_id).await {
            Ok(item) => item,
            Err(e @ StoreError::NotFound(_)) => {
                warn!(content_id, "Immediate send rejected: {e}");
                return Ok(DeliveryResult::failed(Uuid::nil(), e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let profile = ProfileFields {
            business_name: item.recipient.business_name.clone(),
            registration_id: item.recipient.registration_id.clone(),
        };
        let now = Utc::now();
        let parameters = build_parameters(
            self.policy.as_ref(),
            &item.body,
            &profile,
            now,
            self.config.delivery_timezone,
        );

        let job = DeliveryJob::new(
            advisor_id,
            content_id,
            phone_number,
            item.recipient.tier,
        )
        .with_language(&item.recipient.language)
        .with_parameters(parameters)
        .as_immediate();

        // No dedupe key: an immediate send must go out even if the daily
        // batch already queued this pair. Single attempt, since the caller
        // is waiting for the answer.
        let options = EnqueueOptions::default()
            .with_priority(IMMEDIATE_QUEUE_PRIORITY)
            .with_max_attempts(1);

        let enqueued = self.broker.enqueue(job, options).await?;
        let job_id = enqueued.job_id();

        info!(%job_id, advisor_id, content_id, "Awaiting immediate delivery");
        match self
            .broker
            .await_result(job_id, self.config.immediate_timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(e @ BrokerError::ResultTimeout(_)) => {
                Ok(DeliveryResult::failed(job_id, e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-only SLA snapshot.
    ///
    /// Every number derives from the broker's persistent counts, so the
    /// snapshot stays consistent across scheduler restarts and between
    /// scheduler processes sharing a queue. The scheduled total is every
    /// job the broker has admitted: still queued, delivered, or
    /// terminally failed.
    pub async fn get_sla_metrics(&self) -> Result<SlaMetrics, SchedulerError> {
        let counts = self.broker.counts().await?;
        let outstanding = (counts.waiting + counts.active + counts.delayed) as u64;
        let total_delivered = counts.completed as u64;
        let total_failed = counts.failed as u64;
        let total_scheduled = outstanding + total_delivered + total_failed;

        let delivery_rate = if total_scheduled == 0 {
            0.0
        } else {
            total_delivered as f64 / total_scheduled as f64
        };

        // With nothing scheduled there is nothing owed, so the SLA holds.
        let sla_status = if total_scheduled == 0 {
            SlaStatus::Met
        } else if delivery_rate >= self.config.sla_target {
            SlaStatus::Met
        } else if delivery_rate >= self.config.sla_target - self.config.sla_at_risk_margin {
            SlaStatus::AtRisk
        } else {
            SlaStatus::Breached
        };

        Ok(SlaMetrics {
            total_scheduled,
            total_delivered,
            total_failed,
            delivery_rate,
            sla_status,
        })
    }
}

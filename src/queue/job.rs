//! Delivery job definitions.
//!
//! This module defines the unit of scheduled work and its terminal outcome:
//!
//! - `DeliveryJob`: one piece of approved content bound for one recipient
//! - `DeliveryResult`: terminal outcome recorded by a worker
//! - `Tier` / `Priority`: subscription tier and the queue priority derived
//!   from it

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of send attempts before a job is terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Numeric queue priority used for immediate (operator-triggered) sends.
///
/// Lower values dequeue first; zero is ahead of every batch tier.
pub const IMMEDIATE_QUEUE_PRIORITY: u8 = 0;

/// Subscription tier of the sending advisor, ordered lowest to highest
/// service priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Standard,
    Pro,
    Enterprise,
}

impl Tier {
    /// Numeric queue priority for batch jobs of this tier.
    ///
    /// Strictly monotone: a higher tier always maps to a numerically lower
    /// value, so two jobs of different tiers are never priority-tied.
    pub fn queue_priority(self) -> u8 {
        match self {
            Tier::Enterprise => 1,
            Tier::Pro => 2,
            Tier::Standard => 3,
            Tier::Free => 4,
        }
    }

    /// Operator-facing priority label for this tier.
    pub fn priority_label(self) -> Priority {
        match self {
            Tier::Enterprise | Tier::Pro => Priority::High,
            Tier::Standard => Priority::Normal,
            Tier::Free => Priority::Low,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Standard => write!(f, "standard"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Operator-facing delivery priority label.
///
/// `Urgent` is reserved for immediate sends; batch jobs carry the label
/// derived from their tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// A unit of scheduled delivery work.
///
/// Jobs are serialized into the broker and processed by workers. Exactly one
/// job exists per (advisor, content) pair per scheduling run; the broker
/// enforces this through the job's dedupe key while the prior job is
/// non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Identifier of the sending advisor (opaque, from the profile store).
    pub advisor_id: String,
    /// Identifier of the approved content unit (opaque, from the content store).
    pub content_id: String,
    /// Normalized recipient address in the channel's required format.
    pub phone_number: String,
    /// Content language code (e.g. `en`, `hi`).
    pub language: String,
    /// Subscription tier of the advisor.
    pub tier: Tier,
    /// Operator-facing priority label.
    pub priority: Priority,
    /// Absolute UTC instant at which the job becomes eligible to run.
    pub scheduled_for: DateTime<Utc>,
    /// Template placeholder name -> substituted value.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl DeliveryJob {
    /// Creates a batch delivery job for the given tier.
    ///
    /// The priority label is derived from the tier; `scheduled_for` defaults
    /// to now and is normally overwritten by the scheduler.
    pub fn new(
        advisor_id: impl Into<String>,
        content_id: impl Into<String>,
        phone_number: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Self {
            advisor_id: advisor_id.into(),
            content_id: content_id.into(),
            phone_number: phone_number.into(),
            language: "en".to_string(),
            tier,
            priority: tier.priority_label(),
            scheduled_for: Utc::now(),
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the content language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Sets the eligibility instant.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    /// Sets the template parameters.
    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Marks the job as an immediate send (urgent label).
    pub fn as_immediate(mut self) -> Self {
        self.priority = Priority::Urgent;
        self.scheduled_for = Utc::now();
        self
    }

    /// Enqueue key enforcing one live job per (advisor, content) pair.
    pub fn dedupe_key(&self) -> String {
        format!("delivery-{}-{}", self.advisor_id, self.content_id)
    }
}

/// Terminal delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// The channel accepted the message.
    Sent,
    /// The send failed after exhausting its attempts.
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal outcome of a delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// ID of the job this result belongs to.
    pub job_id: Uuid,
    /// Terminal status.
    pub status: DeliveryStatus,
    /// Channel-assigned message id; present iff sent.
    pub channel_message_id: Option<String>,
    /// Failure description; present iff failed.
    pub error: Option<String>,
    /// When the terminal state was reached.
    pub timestamp: DateTime<Utc>,
}

impl DeliveryResult {
    /// Creates a successful result.
    pub fn sent(job_id: Uuid, channel_message_id: impl Into<String>) -> Self {
        Self {
            job_id,
            status: DeliveryStatus::Sent,
            channel_message_id: Some(channel_message_id.into()),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a failed result.
    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            job_id,
            status: DeliveryStatus::Failed,
            channel_message_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Returns whether the delivery succeeded.
    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Free < Tier::Standard);
        assert!(Tier::Standard < Tier::Pro);
        assert!(Tier::Pro < Tier::Enterprise);
    }

    #[test]
    fn test_queue_priority_monotone() {
        let tiers = [Tier::Free, Tier::Standard, Tier::Pro, Tier::Enterprise];
        for a in tiers {
            for b in tiers {
                if a < b {
                    assert!(
                        b.queue_priority() < a.queue_priority(),
                        "{b} should dequeue before {a}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_immediate_priority_ahead_of_all_tiers() {
        for tier in [Tier::Free, Tier::Standard, Tier::Pro, Tier::Enterprise] {
            assert!(IMMEDIATE_QUEUE_PRIORITY < tier.queue_priority());
        }
    }

    #[test]
    fn test_priority_labels() {
        assert_eq!(Tier::Enterprise.priority_label(), Priority::High);
        assert_eq!(Tier::Pro.priority_label(), Priority::High);
        assert_eq!(Tier::Standard.priority_label(), Priority::Normal);
        assert_eq!(Tier::Free.priority_label(), Priority::Low);
    }

    #[test]
    fn test_job_builder() {
        let job = DeliveryJob::new("adv-1", "content-9", "+919876543210", Tier::Pro)
            .with_language("hi");

        assert_eq!(job.advisor_id, "adv-1");
        assert_eq!(job.language, "hi");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.dedupe_key(), "delivery-adv-1-content-9");
    }

    #[test]
    fn test_immediate_job_is_urgent() {
        let job = DeliveryJob::new("adv-1", "c-1", "+911111111111", Tier::Free).as_immediate();
        assert_eq!(job.priority, Priority::Urgent);
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let mut job = DeliveryJob::new("adv-2", "c-2", "+912222222222", Tier::Standard);
        job.parameters
            .insert("market_summary".to_string(), "Sensex up 1.2%".to_string());

        let json = serde_json::to_string(&job).expect("job should serialize");
        let parsed: DeliveryJob = serde_json::from_str(&json).expect("job should parse");

        assert_eq!(parsed.advisor_id, job.advisor_id);
        assert_eq!(parsed.tier, Tier::Standard);
        assert_eq!(parsed.parameters["market_summary"], "Sensex up 1.2%");
    }

    #[test]
    fn test_result_constructors() {
        let id = Uuid::new_v4();
        let sent = DeliveryResult::sent(id, "wamid.123");
        assert!(sent.is_sent());
        assert_eq!(sent.channel_message_id.as_deref(), Some("wamid.123"));
        assert!(sent.error.is_none());

        let failed = DeliveryResult::failed(id, "channel rejected template");
        assert!(!failed.is_sent());
        assert!(failed.channel_message_id.is_none());
        assert_eq!(failed.error.as_deref(), Some("channel rejected template"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeliveryStatus::Sent.to_string(), "sent");
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
        assert_eq!(Priority::Urgent.to_string(), "urgent");
        assert_eq!(Tier::Enterprise.to_string(), "enterprise");
    }
}

//! External collaborator interfaces.
//!
//! The scheduler and worker never talk to a concrete content store or
//! messaging channel; they hold trait objects. Production deployments
//! implement these against their own backends. This module ships two
//! local implementations: a JSON-file content store for operator runs and
//! a logging channel client that records sends without network traffic.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::queue::Tier;

/// Errors from the content/profile store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested content does not exist.
    #[error("Content {0} not found")]
    NotFound(String),

    /// The store could not be reached or read.
    #[error("Content store unavailable: {0}")]
    Unavailable(String),

    /// The store returned data that could not be decoded.
    #[error("Malformed store record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors from the messaging channel client. Classification of permanent
/// versus retryable failures is the channel's concern; the worker treats
/// every error as a failed attempt.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel rejected the send.
    #[error("Channel rejected send: {0}")]
    Rejected(String),

    /// The channel could not be reached.
    #[error("Channel unreachable: {0}")]
    Unreachable(String),
}

/// Recipient contact and profile data joined onto due content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub phone_number: String,
    pub tier: Tier,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub registration_id: Option<String>,
}

fn default_language() -> String {
    "en".to_string()
}

/// One approved, unsent content unit joined with its recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DueContent {
    pub content_id: String,
    pub advisor_id: String,
    pub body: String,
    pub recipient: Recipient,
}

/// Read access to approved content and recipient profiles.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns all content due for delivery on `date`, joined with
    /// recipient contact and tier.
    async fn fetch_due_content(&self, date: NaiveDate) -> Result<Vec<DueContent>, StoreError>;

    /// Returns a single content unit with its recipient profile.
    async fn fetch_content_and_profile(&self, content_id: &str)
        -> Result<DueContent, StoreError>;
}

/// Receipt returned by the channel on a successful send.
#[derive(Debug, Clone)]
pub struct ChannelReceipt {
    pub channel_message_id: String,
}

/// Outbound messaging channel.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Sends one templated message. Template lookup, media handling, and
    /// HTTP retries live behind this call.
    async fn send(
        &self,
        phone_number: &str,
        template_name: &str,
        language: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ChannelReceipt, ChannelError>;
}

/// Content store backed by a JSON file: an array of [`DueContent`]
/// records. Every record is considered due regardless of date, which is
/// what operator runs against a prepared batch file want.
pub struct JsonContentStore {
    items: Vec<DueContent>,
}

impl JsonContentStore {
    /// Loads the store from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let items: Vec<DueContent> = serde_json::from_str(&raw)?;
        Ok(Self { items })
    }

    /// Builds a store from in-memory records.
    pub fn from_items(items: Vec<DueContent>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl ContentStore for JsonContentStore {
    async fn fetch_due_content(&self, _date: NaiveDate) -> Result<Vec<DueContent>, StoreError> {
        Ok(self.items.clone())
    }

    async fn fetch_content_and_profile(
        &self,
        content_id: &str,
    ) -> Result<DueContent, StoreError> {
        self.items
            .iter()
            .find(|item| item.content_id == content_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(content_id.to_string()))
    }
}

/// Channel client that logs each send and returns a synthetic message id.
/// Used by operator commands and tests; never touches the network.
#[derive(Default)]
pub struct LoggingChannelClient {
    sent: Mutex<Vec<String>>,
}

impl LoggingChannelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phone numbers sent to so far, in order.
    pub fn sent_to(&self) -> Vec<String> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ChannelClient for LoggingChannelClient {
    async fn send(
        &self,
        phone_number: &str,
        template_name: &str,
        language: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ChannelReceipt, ChannelError> {
        info!(
            phone_number,
            template_name,
            language,
            parameter_count = parameters.len(),
            "Channel send"
        );
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(phone_number.to_string());
        }
        Ok(ChannelReceipt {
            channel_message_id: format!("local-{}", Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_items() -> Vec<DueContent> {
        vec![DueContent {
            content_id: "c-1".to_string(),
            advisor_id: "a-1".to_string(),
            body: "Sensex up 300 points".to_string(),
            recipient: Recipient {
                phone_number: "+919876543210".to_string(),
                tier: Tier::Pro,
                language: "en".to_string(),
                business_name: Some("Sharma Wealth".to_string()),
                registration_id: None,
            },
        }]
    }

    #[tokio::test]
    async fn test_json_store_lookup() {
        let store = JsonContentStore::from_items(sample_items());
        let item = store.fetch_content_and_profile("c-1").await.unwrap();
        assert_eq!(item.advisor_id, "a-1");

        let err = store.fetch_content_and_profile("c-404").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_json_store_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let raw = serde_json::to_string(&sample_items()).unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let store = JsonContentStore::from_path(file.path()).unwrap();
        let due = store
            .fetch_due_content(chrono::Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient.tier, Tier::Pro);
    }

    #[tokio::test]
    async fn test_recipient_defaults_language() {
        let raw = r#"{"phone_number": "+911111111111", "tier": "free"}"#;
        let recipient: Recipient = serde_json::from_str(raw).unwrap();
        assert_eq!(recipient.language, "en");
        assert!(recipient.business_name.is_none());
    }

    #[tokio::test]
    async fn test_logging_channel_records_sends() {
        let client = LoggingChannelClient::new();
        let receipt = client
            .send("+919876543210", "daily_update", "en", &BTreeMap::new())
            .await
            .unwrap();
        assert!(receipt.channel_message_id.starts_with("local-"));
        assert_eq!(client.sent_to(), vec!["+919876543210".to_string()]);
    }
}

//! End-to-end delivery flow tests.
//!
//! Wires the scheduler, worker pool, and monitor together over the
//! in-memory broker and exercises the full path: admit, claim, send,
//! report, observe. No external services are required.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use daybreak::config::DispatchConfig;
use daybreak::monitor::QueueMonitor;
use daybreak::queue::{JobBroker, MemoryBroker, Tier};
use daybreak::scheduler::DeliveryScheduler;
use daybreak::store::{
    ChannelClient, ChannelError, ChannelReceipt, DueContent, JsonContentStore,
    LoggingChannelClient, Recipient,
};
use daybreak::worker::WorkerPool;

fn fast_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.claim_timeout = Duration::from_millis(50);
    config.metrics_interval = Duration::from_millis(50);
    config.health_interval = Duration::from_millis(50);
    config.immediate_timeout = Duration::from_secs(5);
    config
}

fn due_item(advisor: &str, content: &str, tier: Tier) -> DueContent {
    DueContent {
        content_id: content.to_string(),
        advisor_id: advisor.to_string(),
        body: "Nifty closed higher today.\nConsider rebalancing equity funds.".to_string(),
        recipient: Recipient {
            phone_number: format!("+91{advisor}"),
            tier,
            language: "en".to_string(),
            business_name: Some("Mehta Capital".to_string()),
            registration_id: None,
        },
    }
}

/// Fails the first `failures` sends, then succeeds.
struct FailThenSucceed {
    failures: AtomicUsize,
}

#[async_trait]
impl ChannelClient for FailThenSucceed {
    async fn send(
        &self,
        _phone_number: &str,
        _template_name: &str,
        _language: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<ChannelReceipt, ChannelError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Unreachable("gateway 503".to_string()));
        }
        Ok(ChannelReceipt {
            channel_message_id: "wamid.flow".to_string(),
        })
    }
}

#[tokio::test]
async fn test_immediate_send_end_to_end() {
    let config = fast_config();
    let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new("distribution"));
    let store = Arc::new(JsonContentStore::from_items(vec![due_item(
        "a1",
        "c1",
        Tier::Pro,
    )]));
    let channel = Arc::new(LoggingChannelClient::new());

    let mut pool = WorkerPool::new(config.clone(), broker.clone(), channel.clone());
    pool.start().unwrap();

    let mut monitor = QueueMonitor::new(config.clone());
    monitor.add_queue(broker.clone());
    monitor.start_monitoring();

    let scheduler = DeliveryScheduler::new(config, broker.clone(), store);
    let result = scheduler
        .send_immediate("a1", "c1", "+919876543210")
        .await
        .unwrap();

    assert!(result.is_sent());
    assert_eq!(channel.sent_to(), vec!["+919876543210".to_string()]);

    let sla = scheduler.get_sla_metrics().await.unwrap();
    assert_eq!(sla.total_scheduled, 1);
    assert_eq!(sla.total_delivered, 1);
    assert_eq!(sla.delivery_rate, 1.0);

    // The monitor observed the send through broker events.
    let mut observed = false;
    for _ in 0..100 {
        let seen = monitor
            .get_performance_metrics()
            .get("distribution")
            .map(|summary| summary.total_processed == 1 && summary.successful == 1)
            .unwrap_or(false);
        if seen {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed, "monitor never recorded the completed send");

    pool.shutdown().await.unwrap();
    monitor.stop_monitoring().await;
}

#[tokio::test]
async fn test_daily_batch_is_windowed_and_idempotent() {
    let config = fast_config();
    let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new("distribution"));
    let items: Vec<DueContent> = (0..10)
        .map(|i| due_item(&format!("a{i}"), &format!("c{i}"), Tier::Standard))
        .collect();
    let store = Arc::new(JsonContentStore::from_items(items));
    let scheduler = DeliveryScheduler::new(config, broker.clone(), store);

    let first = scheduler.schedule_daily_delivery(None).await;
    assert_eq!(first.scheduled, 10);
    assert!(first.errors.is_empty());

    // Jobs sit delayed until the jittered window instant; none are sent yet.
    let counts = broker.counts().await.unwrap();
    assert_eq!(counts.delayed + counts.waiting, 10);
    assert_eq!(counts.completed, 0);

    let second = scheduler.schedule_daily_delivery(None).await;
    assert_eq!(second.scheduled, 0);
    assert_eq!(second.skipped, 10);
}

#[tokio::test]
async fn test_terminal_failure_retried_through_monitor() {
    let mut config = fast_config();
    config.max_attempts = 1;

    let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new("distribution"));
    let store = Arc::new(JsonContentStore::from_items(vec![due_item(
        "a1",
        "c1",
        Tier::Enterprise,
    )]));
    // First send fails, the monitor-driven retry succeeds.
    let channel = Arc::new(FailThenSucceed {
        failures: AtomicUsize::new(1),
    });

    let mut pool = WorkerPool::new(config.clone(), broker.clone(), channel);
    pool.start().unwrap();

    let scheduler = DeliveryScheduler::new(config.clone(), broker.clone(), store);
    let result = scheduler
        .send_immediate("a1", "c1", "+919876543210")
        .await
        .unwrap();
    assert!(!result.is_sent());
    assert!(result.error.unwrap().contains("gateway 503"));

    let mut monitor = QueueMonitor::new(config);
    monitor.add_queue(broker.clone());

    let failed = monitor.get_failed_jobs("distribution", 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].failed_reason.contains("gateway 503"));

    let outcomes = monitor
        .retry_failed_jobs("distribution", None)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);

    let mut completed = false;
    for _ in 0..100 {
        if broker.counts().await.unwrap().completed == 1 {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed, "retried job never completed");

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_paused_queue_is_reported_unhealthy_then_recovers() {
    let config = fast_config();
    let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new("distribution"));
    let mut monitor = QueueMonitor::new(config);
    monitor.add_queue(broker.clone());

    monitor.pause_queue("distribution").await.unwrap();
    let health = monitor.health_check().await;
    assert_eq!(health.len(), 1);
    assert!(!health[0].healthy);
    assert!(health[0].paused);

    // A paused queue refuses claims.
    assert!(broker
        .claim(Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());

    monitor.resume_queue("distribution").await.unwrap();
    let health = monitor.health_check().await;
    assert!(health[0].healthy);
}

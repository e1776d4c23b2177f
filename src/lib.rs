//! daybreak: Daily content delivery scheduling and queue health monitoring.
//!
//! This library schedules per-advisor content deliveries into a priority
//! job queue within a jittered local-time window, runs the worker pool
//! that sends them over a messaging channel, and monitors queue health
//! with threshold-based alerting.

// Core modules
pub mod cli;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, DispatchConfig};
pub use monitor::{MonitorError, QueueMonitor};
pub use queue::{BrokerError, DeliveryJob, JobBroker, MemoryBroker, RedisBroker, Tier};
pub use scheduler::{DeliveryScheduler, SchedulerError};
pub use worker::{PoolError, WorkerPool};

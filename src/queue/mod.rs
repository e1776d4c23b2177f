//! Delivery job queue: job types, the broker contract, and its backends.
//!
//! The queue is the only coupling point between the scheduler, the worker
//! pool, and the monitor:
//!
//! ```text
//!   ┌────────────┐  enqueue   ┌─────────────┐   claim    ┌───────────┐
//!   │  Scheduler │ ─────────► │   Broker    │ ─────────► │  Workers  │
//!   └────────────┘            │ (redis/mem) │            └─────┬─────┘
//!                             └──────┬──────┘   complete/fail  │
//!                                    │ ◄────────────────────────┘
//!                             lifecycle events
//!                                    ▼
//!                             ┌────────────┐
//!                             │  Monitor   │
//!                             └────────────┘
//! ```
//!
//! The scheduler and monitor never communicate directly; they interact only
//! through the broker's state and events.

pub mod broker;
pub mod job;
pub mod memory;
pub mod redis;

pub use broker::{
    BrokerError, ClaimedJob, Enqueued, EnqueueOptions, FailDisposition, FailedJob, JobBroker,
    JobCounts, QueueEvent,
};
pub use job::{
    DeliveryJob, DeliveryResult, DeliveryStatus, Priority, Tier, DEFAULT_MAX_ATTEMPTS,
    IMMEDIATE_QUEUE_PRIORITY,
};
pub use memory::MemoryBroker;
pub use redis::RedisBroker;

//! Delivery scheduling: window math, parameter extraction, and admission.
//!
//! The scheduler is the producer side of the queue. Its responsibilities
//! end at admission: it computes the timezone-correct delivery window,
//! spreads jobs across the jitter window, maps subscription tier to queue
//! priority, and enqueues exactly once per (advisor, content) pair. Sends,
//! retries, and observation belong to the worker and monitor.

pub mod delivery;
pub mod params;
pub mod window;

pub use delivery::{DeliveryScheduler, ScheduleOutcome, SchedulerError, SlaMetrics, SlaStatus};
pub use params::{ExtractionPolicy, KeywordPolicy, ProfileFields};
pub use window::DeliveryWindow;

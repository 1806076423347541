//! Reliable, at-least-once work queue backed by Redis lists and pub/sub.
//!
//! Producers enqueue serializable payloads; any number of competing consumer
//! processes dequeue and process them with leases, retries with backoff, a
//! bounded dead-letter list, and cooperative maintenance performed by any
//! healthy participant under a throttled distributed lock.

pub mod config;
pub mod keys;
pub mod models;
pub mod queue;
pub mod redis_utils;

pub use crate::config::QueueConfig;
pub use crate::models::{DateTime, Duration, QueueEntry, QueueError, QueueResult, QueueStats};
pub use crate::queue::behavior::QueueBehavior;
pub use crate::queue::worker::HandlerError;
pub use crate::queue::{QueuePayload, WorkQueue};

//! Data structures used throughout the crate.

mod datetime;
mod duration;
mod entry;
mod error;

pub use self::datetime::DateTime;
pub use self::duration::Duration;
pub use self::entry::QueueEntry;
pub use self::error::{QueueError, QueueResult};

use serde::Serialize;

/// Point-in-time snapshot of a queue's state.
///
/// List lengths come from the store; cumulative counters are process-local.
/// The snapshot is not transactional across the individual values.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueStats {
    /// Number of items on the ready list, awaiting dequeue.
    pub queued: u64,

    /// Number of items on the in-flight list, leased to a consumer.
    pub working: u64,

    /// Number of items on the dead-letter list.
    pub deadlettered: u64,

    /// Total items enqueued by this process.
    pub enqueued: u64,

    /// Total items dequeued by this process.
    pub dequeued: u64,

    /// Total items completed by this process.
    pub completed: u64,

    /// Total items abandoned by this process.
    pub abandoned: u64,

    /// Total handler failures observed by this process's worker runloop.
    pub worker_errors: u64,

    /// Total in-flight items this process's maintenance passes timed out.
    pub timeouts: u64,
}

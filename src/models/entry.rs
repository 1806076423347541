//! Consumer-visible handle for one dequeued item.

use crate::models::{DateTime, QueueResult};
use crate::queue::{QueuePayload, WorkQueue};

/// One dequeued work item, delivered to consumers.
///
/// Holds the deserialised payload plus enough envelope data to settle the
/// item: `complete` acknowledges it, `abandon` routes it through the retry
/// schedule. Both go through the originating queue, so a `QueueEntry` stays
/// usable even after the in-flight lease has been recovered by maintenance.
pub struct QueueEntry<T> {
    id: String,
    payload: T,
    enqueued_at: DateTime,
    attempts: i64,
    queue: WorkQueue<T>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("enqueued_at", &self.enqueued_at)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl<T: QueuePayload> QueueEntry<T> {
    pub(crate) fn new(
        id: String,
        payload: T,
        enqueued_at: DateTime,
        attempts: i64,
        queue: WorkQueue<T>,
    ) -> Self {
        Self {
            id,
            payload,
            enqueued_at,
            attempts,
            queue,
        }
    }

    /// The item's unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The deserialised payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume this entry, returning the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// When the item was first placed on the ready list. Missing envelope
    /// data is reported as the Unix epoch.
    pub fn enqueued_at(&self) -> DateTime {
        self.enqueued_at
    }

    /// Which dequeue attempt this is, starting at 0 for a fresh item.
    pub fn attempts(&self) -> i64 {
        self.attempts
    }

    /// Mark this item as done, deleting it from the queue.
    pub async fn complete(self) -> QueueResult<()> {
        self.queue.complete(&self.id).await
    }

    /// Give this item up for retry (or the dead-letter list once retries are
    /// exhausted).
    pub async fn abandon(self) -> QueueResult<()> {
        self.queue.abandon(&self.id).await
    }
}

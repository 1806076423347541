//! Pluggable observation hooks run around queue operations.

use crate::models::QueueEntry;

/// Hook chain run around queue operations.
///
/// Behaviors observe a queue and may veto enqueues; all other hooks are
/// purely informational. Hooks run synchronously on the operation's task, so
/// implementations should return quickly.
pub trait QueueBehavior<T>: Send + Sync {
    /// Called before a payload is enqueued. Returning false vetoes the
    /// enqueue and the caller receives no id.
    fn on_enqueuing(&self, _payload: &T) -> bool {
        true
    }

    /// Called after an item has been enqueued and published.
    fn on_enqueued(&self, _id: &str) {}

    /// Called after an item has been dequeued, before it reaches the caller.
    fn on_dequeued(&self, _entry: &QueueEntry<T>) {}

    /// Called after an item has been completed.
    fn on_completed(&self, _id: &str) {}

    /// Called after an item has been abandoned, including timeout-driven
    /// abandons and dead-lettering.
    fn on_abandoned(&self, _id: &str) {}
}

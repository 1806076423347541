//! Contains definitions for the Redis keys and channels used by a queue instance.
//!
//! All keys for a queue named `foo` live under the `q:foo` prefix. The `:`
//! separator is a compatibility constraint with other implementations reading
//! the same store, so it must not change.

/// Suffix used for the ready list and the notification channel. A queue named "foo" stores
/// ids awaiting dequeue under "q:foo:in", and publishes new ids on a channel of the same name.
const READY_SUFFIX: &str = "in";

/// Suffix used for the in-flight list. Ids are moved here from the ready list when they're
/// leased by a consumer. Ids on this list are checked for work-item timeouts.
const IN_FLIGHT_SUFFIX: &str = "work";

/// Suffix used for the delayed list. Ids wait here between an abandon and their retry window.
const DELAYED_SUFFIX: &str = "wait";

/// Suffix used for the dead-letter list. Ids that exhaust their retries end up here,
/// bounded by the configured maximum.
const DEAD_SUFFIX: &str = "dead";

/// Suffix appended to the lock name used to serialise maintenance across participants.
const MAINTENANCE_LOCK_SUFFIX: &str = "-maintenance";

/// Precomputed Redis key set for one queue instance.
#[derive(Clone, Debug)]
pub struct KeySchema {
    /// Sanitized queue name all keys are derived from.
    pub name: String,

    /// Ready list: ids awaiting dequeue, newest at the head.
    pub ready: String,

    /// In-flight list: ids currently leased to a consumer.
    pub in_flight: String,

    /// Delayed list: ids awaiting their retry window.
    pub delayed: String,

    /// Dead-letter list: ids that exhausted their retries.
    pub dead: String,

    /// Pub/sub channel that wakes idle consumers. Shares its name with the ready list.
    pub channel: String,

    /// Name of the distributed lock serialising maintenance passes.
    pub maintenance_lock: String,

    prefix: String,
}

impl KeySchema {
    /// Build the key set for a queue with the given (unsanitized) name.
    pub fn new(name: &str) -> Self {
        let name = Self::sanitize(name);
        let prefix = format!("q:{}", name);
        Self {
            ready: format!("{}:{}", prefix, READY_SUFFIX),
            in_flight: format!("{}:{}", prefix, IN_FLIGHT_SUFFIX),
            delayed: format!("{}:{}", prefix, DELAYED_SUFFIX),
            dead: format!("{}:{}", prefix, DEAD_SUFFIX),
            channel: format!("{}:{}", prefix, READY_SUFFIX),
            maintenance_lock: format!("{}{}", name, MAINTENANCE_LOCK_SUFFIX),
            name,
            prefix,
        }
    }

    /// Strip whitespace and replace `:` (the key separator) with `-`.
    pub fn sanitize(name: &str) -> String {
        name.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == ':' { '-' } else { c })
            .collect()
    }

    /// Key holding an item's serialized payload.
    pub fn payload(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    /// Key holding an item's dequeue-attempt counter.
    pub fn attempts(&self, id: &str) -> String {
        format!("{}:{}:attempts", self.prefix, id)
    }

    /// Key holding the time an item was first placed on the ready list.
    pub fn enqueued(&self, id: &str) -> String {
        format!("{}:{}:enqueued", self.prefix, id)
    }

    /// Key holding the time an item was last moved to the in-flight list.
    pub fn dequeued(&self, id: &str) -> String {
        format!("{}:{}:dequeued", self.prefix, id)
    }

    /// Key holding the earliest time a delayed item may return to the ready list.
    pub fn wait(&self, id: &str) -> String {
        format!("{}:{}:wait", self.prefix, id)
    }

    /// All per-item keys: payload plus sidecar metadata.
    pub fn item_keys(&self, id: &str) -> Vec<String> {
        vec![
            self.payload(id),
            self.attempts(id),
            self.enqueued(id),
            self.dequeued(id),
            self.wait(id),
        ]
    }

    /// The four lists an id can reside on.
    pub fn lists(&self) -> [&str; 4] {
        [&self.ready, &self.in_flight, &self.delayed, &self.dead]
    }
}

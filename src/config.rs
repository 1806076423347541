//! Queue configuration parsing and derived retry/TTL schedules.

use std::cmp;
use std::default::Default;
use std::fs;
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::models::Duration;

const MILLIS_PER_HOUR: u64 = 60 * 60 * 1000;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;

/// Configuration for a single queue instance, typically built in code or read
/// from a `.toml` file.
///
/// All settings have defaults, so `QueueConfig::default()` yields a usable
/// production configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Base of all Redis keys for this queue. Sanitized before use (whitespace
    /// removed, `:` replaced with `-`). Defaults to the payload type name.
    pub queue_name: Option<String>,

    /// Maximum number of abandons before an item is dead-lettered.
    /// Total attempts = retries + 1.
    pub retries: u32,

    /// Base delay before an abandoned item becomes ready again.
    /// Set to 0 to re-ready abandoned items immediately.
    pub retry_delay: Duration,

    /// Per-attempt multiplier applied to `retry_delay`. Attempts beyond the
    /// end of the table use the final value.
    pub retry_multipliers: Vec<u32>,

    /// How long an item may stay leased on the in-flight list before
    /// maintenance abandons it on the consumer's behalf.
    pub work_item_timeout: Duration,

    /// TTL applied to an item's payload when it enters the dead-letter list.
    pub dead_letter_ttl: Duration,

    /// Dead-letter list is trimmed beyond this bound by maintenance.
    pub dead_letter_max_items: usize,

    /// If false, this instance never attempts maintenance passes. Some other
    /// participant sharing the queue must run them instead.
    pub run_maintenance_tasks: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            queue_name: None,
            retries: 2,
            retry_delay: Duration::from_secs(60),
            retry_multipliers: vec![1, 3, 5, 10],
            work_item_timeout: Duration::from_secs(600),
            dead_letter_ttl: Duration::from_secs(24 * 60 * 60),
            dead_letter_max_items: 100,
            run_maintenance_tasks: true,
        }
    }
}

impl QueueConfig {
    /// Read configuration from a file into a new QueueConfig struct.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        debug!("Reading configuration from {}", path.display());

        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) => return Err(err.to_string()),
        };

        let conf: QueueConfig = match toml::from_str(&data) {
            Ok(conf) => conf,
            Err(err) => return Err(err.to_string()),
        };

        Ok(conf)
    }

    /// Delay before the given retry attempt (1-based) becomes ready again.
    ///
    /// `retry_delay × multipliers[min(attempt, len) − 1]`, or zero when
    /// delayed retry is disabled.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::from_millis(0);
        }
        if self.retry_multipliers.is_empty() {
            return self.retry_delay;
        }
        let idx = cmp::min(cmp::max(attempt, 1) as usize, self.retry_multipliers.len()) - 1;
        Duration::from_millis(
            self.retry_delay
                .as_millis()
                .saturating_mul(u64::from(self.retry_multipliers[idx])),
        )
    }

    /// TTL applied to payloads and their sidecar metadata:
    /// 1.5× the worst-case total retry delay, with a 7 day floor.
    pub fn payload_ttl(&self) -> Duration {
        let mut total: u64 = 0;
        for attempt in 1..=self.retries + 1 {
            total = total.saturating_add(self.retry_delay(attempt).as_millis());
        }
        let padded = total.saturating_add(total / 2);
        Duration::from_millis(cmp::max(padded, 7 * MILLIS_PER_DAY))
    }

    /// TTL applied to the dequeue-time stamp: 1.5× the work-item timeout,
    /// with a 1 hour floor.
    pub fn dequeued_ttl(&self) -> Duration {
        let padded = self.work_item_timeout.as_millis() * 3 / 2;
        Duration::from_millis(cmp::max(padded, MILLIS_PER_HOUR))
    }

    /// How often a maintenance pass may run across all participants:
    /// the work-item timeout clamped to [1 s, 1 min].
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.work_item_timeout.as_millis().clamp(1_000, 60_000))
    }
}

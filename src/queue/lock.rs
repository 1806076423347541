//! Throttled distributed lock built on conditional SET.

use std::time;

use deadpool_redis::Pool;
use log::debug;
use redis::AsyncCommands;
use tokio::time::Instant;
use uuid::Uuid;

use super::px_nx;
use crate::models::{Duration, QueueError, QueueResult};

/// How long one acquisition attempt may wait before skipping the interval.
const ACQUIRE_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Fallback wait when the lock key has no readable TTL.
const RETRY_WAIT: time::Duration = time::Duration::from_millis(50);

/// Distributed lock that admits at most one holder per throttle interval.
///
/// The lock key is written with `SET NX PX interval` and left to expire, so
/// whichever participant wins an interval owns it for the whole interval.
/// Losers sleep on the key's remaining TTL, bounded by the acquire timeout.
pub(super) struct ThrottledLock {
    key: String,
    holder: String,
    interval: Duration,
}

impl ThrottledLock {
    pub(super) fn new(key: String, interval: Duration) -> Self {
        Self {
            key,
            holder: Uuid::new_v4().simple().to_string(),
            interval,
        }
    }

    /// Try to win the current throttle interval. Returns false if another
    /// participant holds it and the acquire timeout elapsed while waiting.
    pub(super) async fn try_acquire(&self, pool: &Pool) -> QueueResult<bool> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            let mut conn = pool.get().await.map_err(QueueError::from)?;
            let acquired: bool = conn
                .set_options(&self.key, self.holder.as_str(), px_nx(&self.interval))
                .await?;
            if acquired {
                debug!("[{}] acquired maintenance interval", self.key);
                return Ok(true);
            }

            let ttl: i64 = conn.pttl(&self.key).await?;
            drop(conn);
            let wait = if ttl > 0 {
                time::Duration::from_millis(ttl as u64)
            } else {
                RETRY_WAIT
            };

            let now = Instant::now();
            if now + wait >= deadline {
                // sleep out the remainder so callers in a tight loop don't
                // hammer the store between skipped intervals
                let remaining = deadline.saturating_duration_since(now);
                if !remaining.is_zero() {
                    tokio::time::sleep(remaining).await;
                }
                return Ok(false);
            }
            tokio::time::sleep(wait).await;
        }
    }
}

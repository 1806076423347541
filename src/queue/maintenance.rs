//! Cooperative maintenance: timeout recovery, delayed release, dead-letter trim.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time;

use log::{debug, info, warn};
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use super::lock::ThrottledLock;
use super::{px, QueueInner, QueuePayload};
use crate::models::{DateTime, QueueResult};
use crate::transaction_async;

/// Delay before retrying after a failed lock attempt.
const ERROR_BACKOFF: time::Duration = time::Duration::from_secs(1);

/// Spawn the background maintenance loop for a queue instance.
///
/// Passes run back-to-back with no sleep of their own; the throttled
/// distributed lock provides the effective cadence, so at most one
/// participant sweeps per interval while every healthy participant keeps
/// contending.
pub(super) fn spawn<T: QueuePayload>(inner: &Arc<QueueInner<T>>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let token = inner.disposed.clone();
    let lock = ThrottledLock::new(
        inner.keys.maintenance_lock.clone(),
        inner.config.maintenance_interval(),
    );
    tokio::spawn(async move {
        loop {
            if token.is_cancelled() {
                break;
            }
            let queue = match weak.upgrade() {
                Some(queue) => queue,
                None => break,
            };
            let acquired = tokio::select! {
                _ = token.cancelled() => break,
                acquired = lock.try_acquire(&queue.pool) => acquired,
            };
            match acquired {
                Ok(true) => {
                    if let Err(err) = queue.run_maintenance_pass().await {
                        warn!("[{}] maintenance pass failed: {}", queue.keys.ready, err);
                    }
                }
                Ok(false) => {} // another participant owns this interval
                Err(err) => {
                    warn!(
                        "[{}] maintenance lock attempt failed: {}",
                        queue.keys.ready, err
                    );
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    })
}

impl<T: QueuePayload> QueueInner<T> {
    /// Run one full maintenance pass: time out stuck in-flight items, release
    /// due delayed items, trim dead-letter overflow. A failure in one step is
    /// logged and does not stop later steps; the next pass retries.
    pub(super) async fn run_maintenance_pass(&self) -> QueueResult<()> {
        let keys = &self.keys;
        let mut conn = self.conn().await?;
        debug!("[{}] running maintenance pass", keys.ready);

        // newest leases sit at the head of the in-flight list, so scan in
        // reverse to observe timeouts in dequeue order
        let in_flight: Vec<String> = conn.lrange(&keys.in_flight, 0, -1).await?;
        for id in in_flight.iter().rev() {
            if let Err(err) = self.check_in_flight(&mut conn, id).await {
                warn!("[{}] [{}] timeout check failed: {}", keys.ready, id, err);
            }
        }

        let delayed: Vec<String> = conn.lrange(&keys.delayed, 0, -1).await?;
        for id in delayed.iter().rev() {
            if let Err(err) = self.check_delayed(&mut conn, id).await {
                warn!("[{}] [{}] delayed release failed: {}", keys.ready, id, err);
            }
        }

        if let Err(err) = self.trim_dead_letters(&mut conn).await {
            warn!("[{}] dead-letter trim failed: {}", keys.ready, err);
        }

        Ok(())
    }

    async fn check_in_flight(
        &self,
        conn: &mut deadpool_redis::Connection,
        id: &str,
    ) -> QueueResult<()> {
        let dequeued: Option<DateTime> = conn.get(self.keys.dequeued(id)).await?;
        match dequeued {
            None => {
                // no lease stamp: write one now and let the next pass judge it
                let _: () = conn
                    .set_options(
                        self.keys.dequeued(id),
                        DateTime::now(),
                        px(&self.config.dequeued_ttl()),
                    )
                    .await?;
            }
            Some(dequeued_at) => {
                let elapsed = DateTime::now().millis_since(&dequeued_at);
                if elapsed > self.config.work_item_timeout.as_millis() as i64 {
                    info!(
                        "[{}] [{}] work item timed out after {}ms, abandoning",
                        self.keys.ready, id, elapsed
                    );
                    self.abandon(id).await?;
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    async fn check_delayed(
        &self,
        conn: &mut deadpool_redis::Connection,
        id: &str,
    ) -> QueueResult<()> {
        let keys = &self.keys;
        let wait_until: Option<DateTime> = conn.get(keys.wait(id)).await?;
        if let Some(wait_until) = wait_until {
            if DateTime::now() < wait_until {
                return Ok(());
            }
        }

        let watch = [keys.delayed.as_str()];
        let released: bool = transaction_async!(conn, watch.as_slice(), {
            let delayed: Vec<String> = conn.lrange(&keys.delayed, 0, -1).await?;
            if !delayed.iter().any(|v| v == id) {
                Some(false)
            } else {
                let result: Option<()> = redis::pipe()
                    .atomic()
                    .lrem(&keys.delayed, 1, id)
                    .lpush(&keys.ready, id)
                    .del(keys.wait(id))
                    .query_async(conn)
                    .await?;
                result.map(|_| true)
            }
        });

        if released {
            let _: () = conn.publish(&keys.channel, id).await?;
            debug!("[{}] [{}] released from delay", keys.ready, id);
        }
        Ok(())
    }

    async fn trim_dead_letters(&self, conn: &mut deadpool_redis::Connection) -> QueueResult<()> {
        let keys = &self.keys;
        let overflow: Vec<String> = conn
            .lrange(&keys.dead, self.config.dead_letter_max_items as isize, -1)
            .await?;
        if overflow.is_empty() {
            return Ok(());
        }

        let mut pipeline = redis::pipe();
        let pipe = pipeline.atomic();
        for id in &overflow {
            pipe.del(keys.item_keys(id)).ignore();
            for list in keys.lists() {
                pipe.lrem(list, 0, id).ignore();
            }
        }
        pipe.query_async::<_, ()>(conn).await?;
        info!(
            "[{}] trimmed {} overflow dead-letter items",
            keys.dead,
            overflow.len()
        );
        Ok(())
    }
}

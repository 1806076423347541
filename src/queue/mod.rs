//! Core queue engine: enqueue, dequeue, complete, abandon, stats and lifecycle.
//!
//! A `WorkQueue` is a cheaply clonable handle onto one logical queue in
//! Redis. Any number of producer and consumer processes may share a queue;
//! correctness across them relies on store-atomic list moves, not on
//! process-local state.

pub mod behavior;
mod lock;
mod maintenance;
pub mod worker;

use std::any::type_name;
use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use deadpool_redis::Runtime;
use futures::StreamExt;
use log::{debug, info, warn};
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::keys::KeySchema;
use crate::models::{DateTime, Duration, QueueEntry, QueueError, QueueResult, QueueStats};
use crate::transaction_async;
use behavior::QueueBehavior;

/// Deadline used when `dequeue` is called without an explicit timeout.
const DEFAULT_DEQUEUE_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Upper bound on one idle wait inside dequeue. Bounds the damage of a
/// missed pub/sub notification.
const IDLE_POLL_INTERVAL: time::Duration = time::Duration::from_secs(1);

/// Payload types that can travel through a queue.
pub trait QueuePayload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueuePayload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Queue name used when the configuration doesn't specify one: the payload
/// type's unqualified name.
fn default_queue_name<T>() -> String {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

fn px(ttl: &Duration) -> SetOptions {
    SetOptions::default().with_expiration(SetExpiry::PX(ttl.as_millis() as usize))
}

fn px_nx(ttl: &Duration) -> SetOptions {
    SetOptions::default()
        .conditional_set(ExistenceCheck::NX)
        .with_expiration(SetExpiry::PX(ttl.as_millis() as usize))
}

/// Process-local cumulative counters, mutated by atomic increment on the hot
/// path and zeroed by `delete_queue`.
#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    worker_errors: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.enqueued.store(0, Ordering::Relaxed);
        self.dequeued.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.abandoned.store(0, Ordering::Relaxed);
        self.worker_errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
    }
}

/// Outcome of a single non-blocking dequeue attempt.
enum Poll<T> {
    /// An item was leased and is ready to hand to the caller.
    Item(QueueEntry<T>),

    /// An id was popped but its payload had expired; the id was dropped.
    Stale,

    /// The ready list was empty.
    Empty,
}

/// Where an abandoned item is routed.
#[derive(Clone, Copy)]
enum AbandonRoute {
    Dead,
    Delayed,
    Ready,
}

pub(crate) struct QueueInner<T> {
    pool: deadpool_redis::Pool,
    client: redis::Client,
    keys: KeySchema,
    config: QueueConfig,
    behaviors: Vec<Box<dyn QueueBehavior<T>>>,
    counters: Counters,
    new_item: Arc<Notify>,
    disposed: CancellationToken,
    subscriber: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<CancellationToken>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Drop for QueueInner<T> {
    fn drop(&mut self) {
        self.disposed.cancel();
        if let Ok(slot) = self.subscriber.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(slot) = self.maintenance.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(slot) = self.worker.get_mut() {
            if let Some(cancel) = slot.take() {
                cancel.cancel();
            }
        }
    }
}

/// Builder for a `WorkQueue`.
pub struct Builder<T> {
    redis_url: String,
    config: QueueConfig,
    behaviors: Vec<Box<dyn QueueBehavior<T>>>,
}

impl<T: QueuePayload> Default for Builder<T> {
    fn default() -> Self {
        Builder {
            redis_url: "redis://127.0.0.1".to_owned(),
            config: QueueConfig::default(),
            behaviors: Vec::new(),
        }
    }
}

impl<T: QueuePayload> Builder<T> {
    /// Redis URL to connect to. Defaults to "redis://127.0.0.1".
    pub fn redis_url<S: Into<String>>(mut self, url: S) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a behavior to the hook chain. Behaviors run in insertion order.
    pub fn behavior<B: QueueBehavior<T> + 'static>(mut self, behavior: B) -> Self {
        self.behaviors.push(Box::new(behavior));
        self
    }

    /// Build the queue handle. Must be called within a Tokio runtime: the
    /// maintenance task (if enabled) is spawned here.
    pub fn build(self) -> QueueResult<WorkQueue<T>> {
        let mut config = self.config;
        let name = match &config.queue_name {
            Some(name) => name.clone(),
            None => default_queue_name::<T>(),
        };
        config.queue_name = Some(name.clone());
        let keys = KeySchema::new(&name);

        let client = redis::Client::open(self.redis_url.as_str())?;
        let pool = deadpool_redis::Config::from_url(&self.redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| QueueError::Pool(err.to_string()))?;

        let inner = Arc::new(QueueInner {
            pool,
            client,
            keys,
            config,
            behaviors: self.behaviors,
            counters: Counters::default(),
            new_item: Arc::new(Notify::new()),
            disposed: CancellationToken::new(),
            subscriber: Mutex::new(None),
            worker: Mutex::new(None),
            maintenance: Mutex::new(None),
        });

        if inner.config.run_maintenance_tasks {
            let handle = maintenance::spawn(&inner);
            *inner.maintenance.lock().unwrap() = Some(handle);
        }

        info!("[{}] queue initialised", inner.keys.ready);
        Ok(WorkQueue { inner })
    }
}

/// Handle onto one logical work queue in Redis.
pub struct WorkQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueuePayload> WorkQueue<T> {
    pub fn builder() -> Builder<T> {
        Builder::default()
    }

    /// The sanitized queue name.
    pub fn name(&self) -> &str {
        &self.inner.keys.name
    }

    /// Add a payload to the queue.
    ///
    /// Returns the new item's id, or `None` if a behavior vetoed the enqueue.
    pub async fn enqueue(&self, payload: &T) -> QueueResult<Option<String>> {
        self.inner.enqueue(payload).await
    }

    /// Lease the next available item, waiting up to `timeout` (default 30s)
    /// for one to arrive.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> QueueResult<Option<QueueEntry<T>>> {
        self.dequeue_inner(timeout, None).await
    }

    /// Like `dequeue`, but also returns `None` as soon as `cancel` fires.
    pub async fn dequeue_with_cancellation(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<QueueEntry<T>>> {
        self.dequeue_inner(timeout, Some(cancel)).await
    }

    /// Mark an item as done, removing it and its metadata from the store.
    pub async fn complete(&self, id: &str) -> QueueResult<()> {
        self.inner.complete(id).await
    }

    /// Give an item up for retry, routing it to the delayed, ready or
    /// dead-letter list based on its attempt count and the retry schedule.
    pub async fn abandon(&self, id: &str) -> QueueResult<()> {
        self.inner.abandon(id).await
    }

    /// Snapshot of list lengths and this process's cumulative counters.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.inner.stats().await
    }

    /// Remove all four lists and every sidecar key of every id found on
    /// them, and zero the cumulative counters.
    pub async fn delete_queue(&self) -> QueueResult<()> {
        self.inner.delete_queue().await
    }

    /// Listing dead-letter items is intentionally not provided; the dead
    /// list is only size-trimmed by maintenance.
    pub async fn dead_letter_items(&self) -> QueueResult<Vec<QueueEntry<T>>> {
        Err(QueueError::Unsupported("dead-letter item listing"))
    }

    /// Run one maintenance pass directly, bypassing the throttled lock.
    ///
    /// The background loop uses the lock; this entry point exists for tests
    /// and operational tooling that need a deterministic sweep.
    pub async fn run_maintenance(&self) -> QueueResult<()> {
        self.inner.run_maintenance_pass().await
    }

    /// Stop the worker, cancel all waiters and tear down background tasks.
    pub fn dispose(&self) {
        self.inner.disposed.cancel();
        self.stop_working();
        if let Some(handle) = self.inner.maintenance.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.new_item.notify_waiters();
        debug!("[{}] queue disposed", self.inner.keys.ready);
    }

    async fn dequeue_inner(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> QueueResult<Option<QueueEntry<T>>> {
        self.inner.ensure_subscribed().await?;
        let timeout = timeout
            .map(|t| t.as_std())
            .unwrap_or(DEFAULT_DEQUEUE_TIMEOUT);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.inner.disposed.is_cancelled() || cancel.map_or(false, |c| c.is_cancelled()) {
                return Ok(None);
            }

            match self.try_dequeue().await? {
                Poll::Item(entry) => return Ok(Some(entry)),
                Poll::Stale => return Ok(None),
                Poll::Empty => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = cmp::min(deadline - now, IDLE_POLL_INTERVAL);
            tokio::select! {
                _ = self.inner.new_item.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.disposed.cancelled() => return Ok(None),
                _ = wait_cancelled(cancel) => return Ok(None),
            }
        }
    }

    /// One non-blocking dequeue attempt: atomically tail-pop the ready list
    /// and head-push onto the in-flight list, then assemble the entry.
    async fn try_dequeue(&self) -> QueueResult<Poll<T>> {
        let inner = &self.inner;
        let keys = &inner.keys;
        let mut conn = inner.conn().await?;

        let id: Option<String> = conn.rpoplpush(&keys.ready, &keys.in_flight).await?;
        let id = match id {
            Some(id) => id,
            None => return Ok(Poll::Empty),
        };

        let _: () = conn
            .set_options(
                keys.dequeued(&id),
                DateTime::now(),
                px(&inner.config.dequeued_ttl()),
            )
            .await?;

        let raw: Option<Vec<u8>> = conn.get(keys.payload(&id)).await?;
        let raw = match raw {
            Some(raw) => raw,
            None => {
                warn!(
                    "[{}] [{}] payload missing, dropping stale entry",
                    keys.ready, id
                );
                redis::pipe()
                    .atomic()
                    .lrem(&keys.in_flight, 1, &id)
                    .ignore()
                    .del(keys.item_keys(&id))
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                return Ok(Poll::Stale);
            }
        };

        let (enqueued_at, attempts): (Option<DateTime>, Option<i64>) = redis::pipe()
            .get(keys.enqueued(&id))
            .get(keys.attempts(&id))
            .query_async(&mut conn)
            .await?;

        let payload: T = serde_json::from_slice(&raw)?;
        let entry = QueueEntry::new(
            id,
            payload,
            enqueued_at.unwrap_or_else(DateTime::epoch),
            attempts.unwrap_or(-1) + 1,
            self.clone(),
        );

        inner.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        for behavior in &inner.behaviors {
            behavior.on_dequeued(&entry);
        }
        debug!(
            "[{}] [{}] dequeued (attempt {})",
            keys.ready,
            entry.id(),
            entry.attempts()
        );
        Ok(Poll::Item(entry))
    }
}

async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl<T: QueuePayload> QueueInner<T> {
    async fn conn(&self) -> QueueResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn enqueue(&self, payload: &T) -> QueueResult<Option<String>> {
        let id = Uuid::new_v4().simple().to_string();
        for behavior in &self.behaviors {
            if !behavior.on_enqueuing(payload) {
                debug!("[{}] enqueue vetoed by behavior", self.keys.ready);
                return Ok(None);
            }
        }

        let data = serde_json::to_vec(payload)?;
        let ttl = self.config.payload_ttl();
        let mut conn = self.conn().await?;

        let added: bool = conn
            .set_options(self.keys.payload(&id), data, px_nx(&ttl))
            .await?;
        if !added {
            return Err(QueueError::DuplicateItem(id));
        }

        redis::pipe()
            .atomic()
            .lpush(&self.keys.ready, &id)
            .ignore()
            .set_options(self.keys.enqueued(&id), DateTime::now(), px(&ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        // the push must land before the publish, so a woken consumer either
        // finds the id or harmlessly wakes again
        let _: () = conn.publish(&self.keys.channel, &id).await?;

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        for behavior in &self.behaviors {
            behavior.on_enqueued(&id);
        }
        info!("[{}] [{}] enqueued", self.keys.ready, id);
        Ok(Some(id))
    }

    async fn complete(&self, id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .lrem(&self.keys.in_flight, 1, id)
            .ignore()
            .del(self.keys.item_keys(id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        for behavior in &self.behaviors {
            behavior.on_completed(id);
        }
        info!("[{}] [{}] completed", self.keys.ready, id);
        Ok(())
    }

    async fn abandon(&self, id: &str) -> QueueResult<()> {
        let keys = &self.keys;
        let mut conn = self.conn().await?;

        let attempts_key = keys.attempts(id);
        let stored: Option<i64> = conn.get(&attempts_key).await?;
        let attempt = stored.unwrap_or(0) + 1;
        let delay = self.config.retry_delay(cmp::max(attempt, 1) as u32);
        let payload_ttl = self.config.payload_ttl();

        let route = if attempt > i64::from(self.config.retries) {
            AbandonRoute::Dead
        } else if !delay.is_zero() {
            AbandonRoute::Delayed
        } else {
            AbandonRoute::Ready
        };

        // the in-flight membership check under WATCH keeps a double abandon
        // (e.g. consumer and maintenance racing) from duplicating the id
        let watch = [keys.in_flight.as_str()];
        let moved: bool = transaction_async!(&mut conn, watch.as_slice(), {
            let in_flight: Vec<String> = conn.lrange(&keys.in_flight, 0, -1).await?;
            if !in_flight.iter().any(|v| v == id) {
                Some(false)
            } else {
                let mut pipeline = redis::pipe();
                let pipe = pipeline.atomic();
                pipe.lrem(&keys.in_flight, 1, id)
                    .incr(&attempts_key, 1)
                    .pexpire(&attempts_key, payload_ttl.as_millis() as i64);
                match route {
                    AbandonRoute::Dead => {
                        pipe.lpush(&keys.dead, id).pexpire(
                            keys.payload(id),
                            self.config.dead_letter_ttl.as_millis() as i64,
                        );
                    }
                    AbandonRoute::Delayed => {
                        let wait_until = DateTime::now().after(&delay);
                        pipe.lpush(&keys.delayed, id).set_options(
                            keys.wait(id),
                            wait_until,
                            px(&payload_ttl),
                        );
                    }
                    AbandonRoute::Ready => {
                        pipe.lpush(&keys.ready, id);
                    }
                }
                let result: Option<()> = pipe.query_async(&mut conn).await?;
                result.map(|_| true)
            }
        });

        if !moved {
            debug!("[{}] [{}] abandon skipped, not in flight", keys.ready, id);
            return Ok(());
        }

        if let AbandonRoute::Ready = route {
            let _: () = conn.publish(&keys.channel, id).await?;
        }

        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        for behavior in &self.behaviors {
            behavior.on_abandoned(id);
        }
        match route {
            AbandonRoute::Dead => info!(
                "[{}] [{}] dead-lettered after {} attempts",
                keys.ready, id, attempt
            ),
            AbandonRoute::Delayed => {
                info!("[{}] [{}] abandoned, retry in {}", keys.ready, id, delay)
            }
            AbandonRoute::Ready => info!("[{}] [{}] abandoned, ready for retry", keys.ready, id),
        }
        Ok(())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;
        let (queued, working, deadlettered): (u64, u64, u64) = redis::pipe()
            .llen(&self.keys.ready)
            .llen(&self.keys.in_flight)
            .llen(&self.keys.dead)
            .query_async(&mut conn)
            .await?;

        let counters = &self.counters;
        Ok(QueueStats {
            queued,
            working,
            deadlettered,
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            dequeued: counters.dequeued.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            worker_errors: counters.worker_errors.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
        })
    }

    async fn delete_queue(&self) -> QueueResult<()> {
        let keys = &self.keys;
        let mut conn = self.conn().await?;

        let watch = [
            keys.ready.as_str(),
            keys.in_flight.as_str(),
            keys.delayed.as_str(),
            keys.dead.as_str(),
        ];
        let deleted: usize = transaction_async!(&mut conn, watch.as_slice(), {
            let mut to_delete: Vec<String> =
                keys.lists().iter().map(|key| key.to_string()).collect();
            for list in keys.lists() {
                let ids: Vec<String> = conn.lrange(list, 0, -1).await?;
                for id in &ids {
                    to_delete.extend(keys.item_keys(id));
                }
            }
            let count = to_delete.len();
            let result: Option<()> = redis::pipe()
                .atomic()
                .del(to_delete)
                .query_async(&mut conn)
                .await?;
            result.map(|_| count)
        });

        self.counters.reset();
        info!("[{}] queue deleted ({} keys removed)", keys.ready, deleted);
        Ok(())
    }

    /// Spawn the pub/sub subscriber that turns channel messages into wake-ups
    /// for idle dequeues. Called lazily on first dequeue; torn down by
    /// `stop_working`/`dispose` and re-created on the next dequeue.
    async fn ensure_subscribed(&self) -> QueueResult<()> {
        if self.subscriber.lock().unwrap().is_some() {
            return Ok(());
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.keys.channel).await?;

        let notify = Arc::clone(&self.new_item);
        let token = self.disposed.clone();
        let channel = self.keys.channel.clone();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = stream.next() => match msg {
                        Some(_) => notify.notify_waiters(),
                        None => {
                            debug!("[{}] notification stream closed", channel);
                            break;
                        }
                    },
                }
            }
        });

        let mut slot = self.subscriber.lock().unwrap();
        if slot.is_some() {
            // a racing caller subscribed first
            handle.abort();
        } else {
            *slot = Some(handle);
        }
        Ok(())
    }

    fn unsubscribe(&self) {
        if let Some(handle) = self.subscriber.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_queue_name_uses_type() {
        struct OrderShipped;
        assert_eq!(default_queue_name::<OrderShipped>(), "OrderShipped");
        assert_eq!(default_queue_name::<u64>(), "u64");
    }
}

//! Worker runloop: pulls one item at a time and settles it from the handler outcome.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time;

use log::{debug, info, warn};

use super::{QueuePayload, WorkQueue};
use crate::models::{QueueEntry, QueueError, QueueResult};

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Delay before retrying after a dequeue error inside the runloop.
const ERROR_BACKOFF: time::Duration = time::Duration::from_secs(1);

impl<T: QueuePayload> WorkQueue<T> {
    /// Start the worker runloop: repeatedly dequeue and invoke `handler`.
    ///
    /// On handler success the entry is completed when `auto_complete` is set
    /// (a handler that already completed it makes this a no-op). On handler
    /// failure the entry is abandoned and the worker-error counter is
    /// incremented; abandon performs the state transition, not the worker.
    ///
    /// At most one runloop may run per queue instance; a second call fails
    /// with `QueueError::Conflict`. Must be called within a Tokio runtime.
    pub fn start_working<F, Fut>(&self, handler: F, auto_complete: bool) -> QueueResult<()>
    where
        F: Fn(QueueEntry<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let mut slot = self.inner.worker.lock().unwrap();
        if slot.is_some() {
            return Err(QueueError::conflict(
                "a worker is already running for this queue",
            ));
        }

        let cancel = self.inner.disposed.child_token();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.inner);
        let ready_key = self.inner.keys.ready.clone();

        tokio::spawn(async move {
            info!("[{}] worker started", ready_key);
            loop {
                if token.is_cancelled() {
                    break;
                }
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let queue = WorkQueue { inner };

                match queue.dequeue_with_cancellation(None, &token).await {
                    // empty poll, timeout or cancellation: loop re-checks the token
                    Ok(None) => continue,
                    Ok(Some(entry)) => {
                        let id = entry.id().to_owned();
                        match handler(entry).await {
                            Ok(()) => {
                                if auto_complete {
                                    if let Err(err) = queue.complete(&id).await {
                                        warn!(
                                            "[{}] [{}] auto-complete failed: {}",
                                            ready_key, id, err
                                        );
                                    }
                                }
                            }
                            Err(err) => {
                                warn!("[{}] [{}] handler failed: {}", ready_key, id, err);
                                queue
                                    .inner
                                    .counters
                                    .worker_errors
                                    .fetch_add(1, Ordering::Relaxed);
                                if let Err(err) = queue.abandon(&id).await {
                                    warn!(
                                        "[{}] [{}] abandon after handler failure failed: {}",
                                        ready_key, id, err
                                    );
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("[{}] dequeue failed in worker loop: {}", ready_key, err);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
            debug!("[{}] worker stopped", ready_key);
        });

        *slot = Some(cancel);
        Ok(())
    }

    /// Stop the worker runloop, if one is running: cancels the runloop's
    /// handle, tears down the notification subscriber and wakes idle
    /// dequeues. The in-flight handler, if any, runs to completion.
    pub fn stop_working(&self) {
        if let Some(cancel) = self.inner.worker.lock().unwrap().take() {
            cancel.cancel();
            info!("[{}] worker stopping", self.inner.keys.ready);
        }
        self.inner.unsubscribe();
        self.inner.new_item.notify_waiters();
    }
}

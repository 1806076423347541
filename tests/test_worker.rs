//! Integration tests for the worker runloop, notification wake and the
//! background maintenance loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use redqueue::{Duration, HandlerError, QueueConfig, QueueEntry, QueueError, WorkQueue};

mod support;
use support::TestContext;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct TestPayload {
    v: i32,
}

fn config(name: &str) -> QueueConfig {
    QueueConfig {
        queue_name: Some(name.to_owned()),
        run_maintenance_tasks: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn worker_processes_and_auto_completes() {
    let ctx = TestContext::new();
    let queue: WorkQueue<TestPayload> = ctx.queue(config("worker"));

    let seen = Arc::new(AtomicU64::new(0));
    let observed = Arc::clone(&seen);
    queue
        .start_working(
            move |entry: QueueEntry<TestPayload>| {
                let observed = Arc::clone(&observed);
                async move {
                    assert!(entry.payload().v >= 0);
                    observed.fetch_add(1, Ordering::Relaxed);
                    Ok::<(), HandlerError>(())
                }
            },
            true,
        )
        .unwrap();

    for v in 0..3 {
        queue.enqueue(&TestPayload { v }).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
    loop {
        let stats = queue.stats().await.unwrap();
        if stats.completed == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker did not complete all items: {:?}",
            stats
        );
        tokio::time::sleep(time::Duration::from_millis(20)).await;
    }

    assert_eq!(seen.load(Ordering::Relaxed), 3);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.working, 0);
    assert_eq!(stats.worker_errors, 0);

    queue.stop_working();
}

#[tokio::test]
async fn handler_failure_abandons_the_entry() {
    let ctx = TestContext::new();
    let queue: WorkQueue<TestPayload> = ctx.queue(QueueConfig {
        queue_name: Some("failing".to_owned()),
        retries: 0,
        run_maintenance_tasks: false,
        ..Default::default()
    });

    queue
        .start_working(
            |_entry: QueueEntry<TestPayload>| async { Err::<(), HandlerError>("boom".into()) },
            true,
        )
        .unwrap();

    let id = queue.enqueue(&TestPayload { v: 13 }).await.unwrap().unwrap();

    let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
    loop {
        let stats = queue.stats().await.unwrap();
        if stats.deadlettered == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "failed item never dead-lettered: {:?}",
            stats
        );
        tokio::time::sleep(time::Duration::from_millis(20)).await;
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.worker_errors, 1);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.completed, 0);

    let mut conn = ctx.connection().await;
    let dead: Vec<String> = conn.lrange("q:failing:dead", 0, -1).await.unwrap();
    assert_eq!(dead, vec![id]);

    queue.stop_working();
}

#[tokio::test]
async fn second_runloop_is_rejected() {
    let ctx = TestContext::new();
    let queue: WorkQueue<TestPayload> = ctx.queue(config("single"));

    queue
        .start_working(
            |_entry: QueueEntry<TestPayload>| async { Ok::<(), HandlerError>(()) },
            true,
        )
        .unwrap();

    let err = queue
        .start_working(
            |_entry: QueueEntry<TestPayload>| async { Ok::<(), HandlerError>(()) },
            true,
        )
        .unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    queue.stop_working();
}

#[tokio::test]
async fn stop_working_halts_the_runloop() {
    let ctx = TestContext::new();
    let queue: WorkQueue<TestPayload> = ctx.queue(config("stoppable"));

    queue
        .start_working(
            |_entry: QueueEntry<TestPayload>| async { Ok::<(), HandlerError>(()) },
            true,
        )
        .unwrap();

    queue.enqueue(&TestPayload { v: 1 }).await.unwrap();

    let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
    while queue.stats().await.unwrap().completed < 1 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(time::Duration::from_millis(20)).await;
    }

    queue.stop_working();
    tokio::time::sleep(time::Duration::from_millis(200)).await;

    // items enqueued after the stop stay on the ready list
    queue.enqueue(&TestPayload { v: 2 }).await.unwrap();
    tokio::time::sleep(time::Duration::from_millis(300)).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.queued, 1);
}

#[tokio::test]
async fn notification_wakes_idle_dequeue() {
    let ctx = TestContext::new();
    let producer: WorkQueue<TestPayload> = ctx.queue(config("wake"));
    let consumer: WorkQueue<TestPayload> = ctx.queue(config("wake"));

    let waiter = tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let entry = consumer
            .dequeue(Some(Duration::from_millis(500)))
            .await
            .unwrap();
        (entry.map(|e| e.id().to_owned()), started.elapsed())
    });

    tokio::time::sleep(time::Duration::from_millis(50)).await;
    let id = producer.enqueue(&TestPayload { v: 9 }).await.unwrap().unwrap();

    let (dequeued, elapsed) = waiter.await.unwrap();
    assert_eq!(dequeued.as_deref(), Some(id.as_str()));
    // returning well under the 500ms timeout proves the pub/sub wake, not the
    // timeout, ended the wait
    assert!(
        elapsed < time::Duration::from_millis(400),
        "woke too slowly: {:?}",
        elapsed
    );
}

#[tokio::test]
async fn background_maintenance_times_out_stuck_items() {
    let ctx = TestContext::new();
    let queue: WorkQueue<TestPayload> = ctx.queue(QueueConfig {
        queue_name: Some("auto".to_owned()),
        retries: 0,
        work_item_timeout: Duration::from_millis(100),
        run_maintenance_tasks: true,
        ..Default::default()
    });

    queue.enqueue(&TestPayload { v: 1 }).await.unwrap();
    let entry = queue
        .dequeue(Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    let id = entry.id().to_owned();
    drop(entry);

    // the background loop runs under a 1s throttle interval here, so give it
    // a few intervals to observe the expired lease
    let deadline = tokio::time::Instant::now() + time::Duration::from_secs(10);
    loop {
        let stats = queue.stats().await.unwrap();
        if stats.deadlettered == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "maintenance never timed out the item: {:?}",
            stats
        );
        tokio::time::sleep(time::Duration::from_millis(100)).await;
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.timeouts, 1);

    let mut conn = ctx.connection().await;
    let dead: Vec<String> = conn.lrange("q:auto:dead", 0, -1).await.unwrap();
    assert_eq!(dead, vec![id]);

    queue.dispose();
}

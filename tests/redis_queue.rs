//! Integration tests for the Redis task queue.
//!
//! The ignored tests need a running Redis.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_queue -- --ignored

use std::time::Duration;

use redis::AsyncCommands;
use serde_json::json;

use hint_forge::scheduler::{RedisTaskQueue, TaskKind, TaskMessage, TaskQueue};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// A queue name no other test run shares.
fn unique_queue_name(tag: &str) -> String {
    format!(
        "hint_forge_test_{}_{}_{}",
        tag,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    )
}

async fn consumer(queue_name: &str) -> RedisTaskQueue {
    RedisTaskQueue::connect(&redis_url(), queue_name, 3)
        .await
        .expect("connect")
        .with_recovery_priority(3)
        .start_heartbeat()
        .await
        .expect("heartbeat")
}

fn message(request_id: i64) -> TaskMessage {
    TaskMessage::new(TaskKind::GenerateHint, json!({ "request_id": request_id }))
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_queue -- --ignored
async fn test_live_consumer_keeps_its_tasks() {
    let name = unique_queue_name("live");
    let first = consumer(&name).await;
    let second = consumer(&name).await;
    assert_ne!(first.consumer_id(), second.consumer_id());

    first.publish(&message(1), 1).await.unwrap();
    let delivery = first
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("task");

    // the first consumer is alive, its task stays with it
    assert_eq!(second.recover_in_flight().await.unwrap(), 0);
    assert_eq!(first.recover_in_flight().await.unwrap(), 0);
    let stats = second.stats().await.unwrap();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.pending(), 0);

    first.ack(&delivery).await.unwrap();
    assert_eq!(second.stats().await.unwrap().total(), 0);

    second.clear().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_expired_consumer_tasks_are_requeued() {
    let name = unique_queue_name("expired");
    let dead = consumer(&name).await;
    let survivor = consumer(&name).await;

    dead.publish(&message(2), 1).await.unwrap();
    dead.publish(&message(3), 1).await.unwrap();
    dead.dequeue(Duration::from_secs(1)).await.unwrap().expect("task");
    dead.dequeue(Duration::from_secs(1)).await.unwrap().expect("task");

    // simulate the process dying: no more renewals, lease gone
    let lease_key = dead.lease_key().to_string();
    drop(dead);
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    conn.del::<_, ()>(&lease_key).await.unwrap();

    assert_eq!(survivor.recover_in_flight().await.unwrap(), 2);
    let stats = survivor.stats().await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.pending_by_priority[0], (3, 2));

    let requeued = survivor
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("requeued task");
    assert_eq!(requeued.priority, 3);

    survivor.clear().await.unwrap();
}

//! Priority task queue with reliable dequeue.
//!
//! This module provides the [`TaskQueue`] contract and a Redis
//! implementation that supports:
//!
//! - One list per priority level, highest level served first
//! - Atomic dequeue into the consumer's own processing list using RPOPLPUSH
//! - Explicit acknowledgement after the task's effect is durable
//! - Recovery of the tasks of consumers whose lease expired
//!
//! # Queue Structure
//!
//! - `{queue_name}:p{n}`: pending tasks at priority `n` (0..=max_priority)
//! - `{queue_name}:processing:{consumer}`: tasks delivered to one consumer
//!   but not yet acknowledged
//! - `{queue_name}:lease:{consumer}`: present while the consumer is alive;
//!   expires `lease` after the last renewal
//!
//! # Reliability
//!
//! Delivery is at-least-once. A task moves to its consumer's processing list
//! when it is dequeued and leaves it only on [`TaskQueue::ack`]. A consumer
//! renews its lease on every dequeue and acknowledgement and, once
//! [`RedisTaskQueue::start_heartbeat`] ran, on a timer. When a process dies
//! its lease runs out and [`TaskQueue::recover_in_flight`], called by any
//! other consumer, puts its tasks back. Lists of live consumers are never
//! touched.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::task::{Delivery, TaskMessage};

/// Longest single sleep between two empty polls of the priority lists.
const EMPTY_POLL_PAUSE: Duration = Duration::from_millis(200);

/// How long a consumer's tasks stay claimed after its last lease renewal.
pub const DEFAULT_CONSUMER_LEASE: Duration = Duration::from_secs(60);

const MIN_CONSUMER_LEASE: Duration = Duration::from_secs(1);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the queue backend.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize a task.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The priority is outside `0..=max_priority`.
    #[error("Priority {priority} exceeds maximum {max}")]
    InvalidPriority { priority: u8, max: u8 },
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Pending tasks per priority level, highest level first.
    pub pending_by_priority: Vec<(u8, usize)>,
    /// Delivered tasks awaiting acknowledgement.
    pub in_flight: usize,
}

impl QueueStats {
    /// Number of pending tasks across all priority levels.
    pub fn pending(&self) -> usize {
        self.pending_by_priority.iter().map(|(_, n)| n).sum()
    }

    /// Returns the total number of tasks, pending or in flight.
    pub fn total(&self) -> usize {
        self.pending() + self.in_flight
    }
}

/// A durable priority queue of task messages.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publishes a task at the given priority.
    async fn publish(&self, message: &TaskMessage, priority: u8) -> Result<(), QueueError>;

    /// Takes the next task, highest priority first.
    ///
    /// Returns `Ok(None)` if nothing arrived within `timeout`.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Removes a delivered task for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Returns unacknowledged tasks that no live consumer is working on to
    /// the pending lists and reports how many.
    async fn recover_in_flight(&self) -> Result<usize, QueueError>;

    /// Returns queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Identifier for a new consumer: host, process id and connect time.
pub fn default_consumer_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!(
        "{}-{}-{}",
        host,
        std::process::id(),
        Utc::now().timestamp_micros()
    )
}

fn processing_key(queue_name: &str, consumer_id: &str) -> String {
    format!("{}:processing:{}", queue_name, consumer_id)
}

fn lease_key(queue_name: &str, consumer_id: &str) -> String {
    format!("{}:lease:{}", queue_name, consumer_id)
}

/// Consumer owning a processing list key, `None` for any other key.
fn consumer_of<'a>(queue_name: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(queue_name)?
        .strip_prefix(":processing:")
        .filter(|consumer| !consumer.is_empty())
}

async fn set_lease(
    conn: &mut ConnectionManager,
    key: &str,
    lease: Duration,
) -> Result<(), QueueError> {
    let millis = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
    redis::cmd("SET")
        .arg(key)
        .arg(1)
        .arg("PX")
        .arg(millis)
        .query_async::<_, ()>(&mut *conn)
        .await?;
    Ok(())
}

/// Every processing list of the queue, of any consumer.
async fn processing_lists(
    conn: &mut ConnectionManager,
    queue_name: &str,
) -> Result<Vec<String>, QueueError> {
    let pattern = format!("{}:processing:*", queue_name);
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();

    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut *conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    // SCAN may report a key more than once
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}

/// Moves the tasks of every consumer whose lease has expired to `target`.
///
/// Each task moves with one RPOPLPUSH, so concurrent sweeps never requeue
/// a task twice.
async fn requeue_expired(
    conn: &mut ConnectionManager,
    queue_name: &str,
    own_consumer: &str,
    target: &str,
) -> Result<usize, QueueError> {
    let mut recovered = 0;

    for list in processing_lists(conn, queue_name).await? {
        let Some(consumer) = consumer_of(queue_name, &list) else {
            continue;
        };
        if consumer == own_consumer {
            continue;
        }
        let alive: bool = conn.exists(lease_key(queue_name, consumer)).await?;
        if alive {
            continue;
        }

        let mut moved = 0;
        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&list)
                .arg(target)
                .query_async(&mut *conn)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(consumer = consumer, moved = moved, "Requeued tasks of expired consumer");
        }
        recovered += moved;
    }

    Ok(recovered)
}

/// Redis-backed [`TaskQueue`].
///
/// Each handle is one consumer with its own processing list.
pub struct RedisTaskQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    consumer_id: String,
    processing_queue: String,
    lease_key: String,
    lease: Duration,
    max_priority: u8,
    /// Level recovered tasks are returned to.
    recovery_priority: u8,
    heartbeat: Option<JoinHandle<()>>,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a new task queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    /// * `max_priority` - Highest priority level
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        queue_name: &str,
        max_priority: u8,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name, max_priority))
    }

    /// Creates a queue from an existing ConnectionManager, as a new consumer.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str, max_priority: u8) -> Self {
        let consumer_id = default_consumer_id();
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: processing_key(queue_name, &consumer_id),
            lease_key: lease_key(queue_name, &consumer_id),
            consumer_id,
            lease: DEFAULT_CONSUMER_LEASE,
            max_priority,
            recovery_priority: 0,
            heartbeat: None,
        }
    }

    /// Sets the level that recovered in-flight tasks are returned to.
    pub fn with_recovery_priority(mut self, priority: u8) -> Self {
        self.recovery_priority = priority.min(self.max_priority);
        self
    }

    /// Sets how long this consumer's tasks stay claimed without a renewal.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(MIN_CONSUMER_LEASE);
        self
    }

    /// Takes the lease and keeps renewing it every third of its length
    /// until the handle is dropped. Once per lease length the heartbeat also
    /// requeues the tasks of expired consumers.
    ///
    /// Needed by handles whose tasks can run longer than the lease. Call it
    /// after the recovery priority is set.
    ///
    /// # Errors
    ///
    /// Returns the Redis error if the first renewal fails.
    pub async fn start_heartbeat(mut self) -> Result<Self, QueueError> {
        let mut conn = self.redis.clone();
        set_lease(&mut conn, &self.lease_key, self.lease).await?;

        let key = self.lease_key.clone();
        let lease = self.lease;
        let queue_name = self.queue_name.clone();
        let consumer = self.consumer_id.clone();
        let target = self.priority_key(self.recovery_priority);
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease / 3);
            ticker.tick().await;
            let mut beats: u64 = 0;
            loop {
                ticker.tick().await;
                beats += 1;
                if let Err(e) = set_lease(&mut conn, &key, lease).await {
                    warn!(lease_key = %key, error = %e, "Failed to renew consumer lease");
                    continue;
                }
                if beats % 3 == 0 {
                    let swept = requeue_expired(&mut conn, &queue_name, &consumer, &target).await;
                    if let Err(e) = swept {
                        warn!(error = %e, "Failed to requeue tasks of expired consumers");
                    }
                }
            }
        }));

        info!(consumer = %self.consumer_id, lease_secs = lease.as_secs(), "Consumer registered");
        Ok(self)
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Key whose presence marks this consumer as alive.
    pub fn lease_key(&self) -> &str {
        &self.lease_key
    }

    /// Key of the pending list for a priority level.
    pub fn priority_key(&self, priority: u8) -> String {
        format!("{}:p{}", self.queue_name, priority)
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn renew_lease(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        set_lease(conn, &self.lease_key, self.lease).await
    }

    /// Moves one task from the highest non-empty level into the processing list.
    async fn try_take(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.redis.clone();

        for priority in (0..=self.max_priority).rev() {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(self.priority_key(priority))
                .arg(&self.processing_queue)
                .query_async(&mut conn)
                .await?;

            if let Some(raw) = moved {
                return Ok(Some(Delivery::new(raw, priority)));
            }
        }

        Ok(None)
    }

    /// Clears every list of the queue.
    ///
    /// **Warning**: This permanently deletes all tasks. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let processing = processing_lists(&mut conn, &self.queue_name).await?;
        let mut pipe = redis::pipe();
        for priority in 0..=self.max_priority {
            pipe.del(self.priority_key(priority));
        }
        for key in &processing {
            pipe.del(key);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

impl Drop for RedisTaskQueue {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    /// Tasks are added to the left of their list (LPUSH) and taken from the
    /// right, so each level is FIFO.
    async fn publish(&self, message: &TaskMessage, priority: u8) -> Result<(), QueueError> {
        if priority > self.max_priority {
            return Err(QueueError::InvalidPriority {
                priority,
                max: self.max_priority,
            });
        }

        let serialized = message.to_json()?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.priority_key(priority), serialized)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        self.renew_lease(&mut self.redis.clone()).await?;

        loop {
            if let Some(delivery) = self.try_take().await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(EMPTY_POLL_PAUSE.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&self.processing_queue, 1, &delivery.raw)
            .await?;
        self.renew_lease(&mut conn).await
    }

    /// Requeues the tasks of every consumer whose lease has expired.
    ///
    /// This handle's own list and the lists of live consumers are left alone.
    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let target = self.priority_key(self.recovery_priority);
        requeue_expired(&mut conn, &self.queue_name, &self.consumer_id, &target).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let mut pending_by_priority = Vec::with_capacity(usize::from(self.max_priority) + 1);
        for priority in (0..=self.max_priority).rev() {
            let len: usize = conn.llen(self.priority_key(priority)).await?;
            pending_by_priority.push((priority, len));
        }
        let mut in_flight = 0;
        for list in processing_lists(&mut conn, &self.queue_name).await? {
            let len: usize = conn.llen(&list).await?;
            in_flight += len;
        }

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_by_priority,
            in_flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::InvalidPriority { priority: 9, max: 3 };
        assert_eq!(err.to_string(), "Priority 9 exceeds maximum 3");
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "hint_tasks".to_string(),
            pending_by_priority: vec![(3, 1), (2, 0), (1, 10), (0, 4)],
            in_flight: 5,
        };

        assert_eq!(stats.pending(), 15);
        assert_eq!(stats.total(), 20);
    }

    #[test]
    fn test_consumer_keys() {
        assert_eq!(
            processing_key("hint_tasks", "web-1-42"),
            "hint_tasks:processing:web-1-42"
        );
        assert_eq!(lease_key("hint_tasks", "web-1-42"), "hint_tasks:lease:web-1-42");

        assert_eq!(
            consumer_of("hint_tasks", "hint_tasks:processing:web-1-42"),
            Some("web-1-42")
        );
        assert_eq!(consumer_of("hint_tasks", "hint_tasks:processing:"), None);
        assert_eq!(consumer_of("hint_tasks", "hint_tasks:p3"), None);
        assert_eq!(consumer_of("hint_tasks", "other:processing:web-1-42"), None);
    }

    #[test]
    fn test_default_consumer_ids_differ_per_connect() {
        let first = default_consumer_id();
        std::thread::sleep(Duration::from_millis(2));
        let second = default_consumer_id();

        assert_ne!(first, second);
        assert!(first.contains(&std::process::id().to_string()));
    }
}

//! In-process [`TaskQueue`] used by tests and single-process runs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::queue::{QueueError, QueueStats, TaskQueue};
use super::task::{Delivery, TaskMessage};

#[derive(Debug, PartialEq, Eq)]
struct Pending {
    priority: u8,
    seq: u64,
    raw: String,
}

impl Ord for Pending {
    // Higher priority first, then older first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    pending: BinaryHeap<Pending>,
    /// Delivered payloads with their delivery count (duplicates are legal).
    in_flight: HashMap<String, (u8, usize)>,
    published: Vec<(TaskMessage, u8)>,
}

/// A priority queue held in memory.
///
/// Behaves like the Redis queue: priorities are served highest first and
/// FIFO within a level, delivered tasks stay in flight until acknowledged.
/// Every publish is also recorded for inspection.
#[derive(Debug)]
pub struct MemoryTaskQueue {
    name: String,
    max_priority: u8,
    state: Mutex<QueueState>,
    notify: Notify,
    available: AtomicBool,
}

impl MemoryTaskQueue {
    pub fn new(max_priority: u8) -> Self {
        Self {
            name: "memory".to_string(),
            max_priority,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Every task published so far with its priority, in publish order.
    pub async fn published(&self) -> Vec<(TaskMessage, u8)> {
        self.state.lock().await.published.clone()
    }

    /// Published tasks of one type.
    pub async fn published_of(&self, task_type: &str) -> Vec<(TaskMessage, u8)> {
        self.published()
            .await
            .into_iter()
            .filter(|(message, _)| message.task_type == task_type)
            .collect()
    }

    /// Simulates losing (or regaining) the backend: while unavailable every
    /// dequeue fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn take(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let next = state.pending.pop()?;
        state
            .in_flight
            .entry(next.raw.clone())
            .or_insert((next.priority, 0))
            .1 += 1;
        Some(Delivery::new(next.raw, next.priority))
    }

    fn push(state: &mut QueueState, raw: String, priority: u8) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(Pending { priority, seq, raw });
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn publish(&self, message: &TaskMessage, priority: u8) -> Result<(), QueueError> {
        if priority > self.max_priority {
            return Err(QueueError::InvalidPriority {
                priority,
                max: self.max_priority,
            });
        }

        let raw = message.to_json()?;
        {
            let mut state = self.state.lock().await;
            Self::push(&mut state, raw, priority);
            state.published.push((message.clone(), priority));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if !self.available.load(Ordering::SeqCst) {
                return Err(QueueError::ConnectionFailed(
                    "memory queue unavailable".to_string(),
                ));
            }

            let notified = self.notify.notified();
            if let Some(delivery) = self.take().await {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // a publish racing with take() leaves a permit behind
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.in_flight.get_mut(&delivery.raw) {
            entry.1 -= 1;
            if entry.1 == 0 {
                state.in_flight.remove(&delivery.raw);
            }
        }
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.state.lock().await;
            let stuck: Vec<(String, (u8, usize))> = state.in_flight.drain().collect();
            let mut recovered = 0;
            for (raw, (priority, count)) in stuck {
                for _ in 0..count {
                    Self::push(&mut state, raw.clone(), priority);
                    recovered += 1;
                }
            }
            recovered
        };
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let pending_by_priority = (0..=self.max_priority)
            .rev()
            .map(|priority| {
                let count = state
                    .pending
                    .iter()
                    .filter(|p| p.priority == priority)
                    .count();
                (priority, count)
            })
            .collect();

        Ok(QueueStats {
            queue_name: self.name.clone(),
            pending_by_priority,
            in_flight: state.in_flight.values().map(|(_, n)| n).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskKind;
    use serde_json::json;
    use std::sync::Arc;

    fn task(request_id: i64) -> TaskMessage {
        TaskMessage::new(TaskKind::RunStudentProgram, json!({"request_id": request_id}))
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryTaskQueue::new(3);
        queue.publish(&task(1), 1).await.unwrap();
        queue.publish(&task(2), 3).await.unwrap();
        queue.publish(&task(3), 1).await.unwrap();
        queue.publish(&task(4), 0).await.unwrap();

        let mut order = Vec::new();
        while let Some(delivery) = queue.dequeue(Duration::ZERO).await.unwrap() {
            order.push(delivery.message().unwrap().request_id().unwrap());
        }
        assert_eq!(order, vec![2, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_rejects_priority_above_max() {
        let queue = MemoryTaskQueue::new(2);
        let err = queue.publish(&task(1), 3).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPriority { priority: 3, max: 2 }));
    }

    #[tokio::test]
    async fn test_ack_and_recover() {
        let queue = MemoryTaskQueue::new(3);
        queue.publish(&task(1), 2).await.unwrap();
        queue.publish(&task(2), 2).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let _second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.ack(&first).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.pending(), 0);

        assert_eq!(queue.recover_in_flight().await.unwrap(), 1);
        let redelivered = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.message().unwrap().request_id(), Some(2));
        assert_eq!(redelivered.priority, 2);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_publish() {
        let queue = Arc::new(MemoryTaskQueue::new(3));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&task(8), 1).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message().unwrap().request_id(), Some(8));
    }

    #[tokio::test]
    async fn test_unavailable_queue_fails_dequeue() {
        let queue = MemoryTaskQueue::new(3);
        queue.set_available(false);
        assert!(queue.dequeue(Duration::ZERO).await.is_err());
        queue.set_available(true);
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());
    }
}

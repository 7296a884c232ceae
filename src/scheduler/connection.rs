//! Queue connection lifecycle.
//!
//! Transport-level reconnects are modeled as an explicit state machine,
//! separate from the per-task retry budget handled by the dispatcher:
//!
//! ```text
//!  Disconnected --Start--> Connecting{1} --ConnectSucceeded--> Connected
//!                           |      ^                             |
//!               ConnectFailed      | TransportLost    ConsumersStarted
//!                           v      |                             v
//!                 Connecting{n+1} or Failed  <----------------- Consuming
//! ```
//!
//! `GaveUp` returns any state to `Disconnected` (used on shutdown).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::queue::{QueueError, RedisTaskQueue, TaskQueue};

/// Where the worker pool stands with respect to the queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Attempt number `attempt` (1-based) is in progress.
    Connecting { attempt: u32 },
    Connected,
    /// Workers are pulling tasks.
    Consuming,
    /// The attempt budget is exhausted.
    Failed { attempts: u32 },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Consuming => write!(f, "consuming"),
            ConnectionState::Failed { attempts } => {
                write!(f, "failed after {} attempts", attempts)
            }
        }
    }
}

/// Inputs that move the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    ConnectSucceeded,
    ConnectFailed,
    ConsumersStarted,
    TransportLost,
    GaveUp,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event {event:?} is not valid in state {state}")]
pub struct InvalidTransition {
    pub state: ConnectionState,
    pub event: ConnectionEvent,
}

/// Backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before attempt `attempt` (1-based); the first attempt
    /// starts immediately and later ones double up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Applies `event` to `state`.
///
/// # Errors
///
/// Returns `InvalidTransition` for events that make no sense in `state`,
/// e.g. `ConsumersStarted` while still connecting.
pub fn transition(
    state: ConnectionState,
    event: ConnectionEvent,
    policy: &ReconnectPolicy,
) -> Result<ConnectionState, InvalidTransition> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let next = match (state, event) {
        (_, E::GaveUp) => S::Disconnected,
        (S::Disconnected, E::Start) | (S::Failed { .. }, E::Start) => S::Connecting { attempt: 1 },
        (S::Connecting { .. }, E::ConnectSucceeded) => S::Connected,
        (S::Connecting { attempt }, E::ConnectFailed) => {
            if policy.allows(attempt) {
                S::Connecting {
                    attempt: attempt + 1,
                }
            } else {
                S::Failed { attempts: attempt }
            }
        }
        (S::Connected, E::ConsumersStarted) => S::Consuming,
        (S::Connected, E::TransportLost) | (S::Consuming, E::TransportLost) => {
            S::Connecting { attempt: 1 }
        }
        (state, event) => return Err(InvalidTransition { state, event }),
    };

    Ok(next)
}

/// Opens a queue handle; called on every (re)connect.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>, QueueError>;
}

/// Connects to Redis as a new consumer holding a renewed lease.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    pub redis_url: String,
    pub queue_name: String,
    pub max_priority: u8,
    pub recovery_priority: u8,
    pub consumer_lease: Duration,
}

#[async_trait]
impl QueueConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>, QueueError> {
        let queue = RedisTaskQueue::connect(&self.redis_url, &self.queue_name, self.max_priority)
            .await?
            .with_recovery_priority(self.recovery_priority)
            .with_lease(self.consumer_lease)
            .start_heartbeat()
            .await?;
        Ok(Arc::new(queue))
    }
}

/// Hands out an already-open queue (in-memory queues, tests).
#[derive(Clone)]
pub struct SharedQueue(pub Arc<dyn TaskQueue>);

#[async_trait]
impl QueueConnector for SharedQueue {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>, QueueError> {
        Ok(Arc::clone(&self.0))
    }
}

//! Task distribution: priority queue, dispatcher and worker pool.
//!
//! - **TaskQueue**: durable priority queue of task messages (Redis or in-memory)
//! - **TaskDispatcher**: runs one task through its phase and applies the retry policy
//! - **WorkerPool**: supervised workers pulling from the queue, with reconnects
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ intake / CLI │
//!                      └──────┬───────┘
//!                             │ publish (type, tries=1, data)
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │◄─── republish (tries+1) at retry priority
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────── TaskDispatcher ───────────┘
//!                             │
//!                          phases
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hint_forge::scheduler::{RedisConnector, TaskDispatcher, WorkerPool, WorkerPoolConfig};
//!
//! let dispatcher = Arc::new(TaskDispatcher::new(ctx, config.max_tries));
//! let connector = Arc::new(RedisConnector {
//!     redis_url: config.redis_url.clone(),
//!     queue_name: config.queue_name.clone(),
//!     max_priority: config.max_priority,
//!     recovery_priority: config.priorities.retry,
//!     consumer_lease: config.consumer_lease,
//! });
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::from_config(&config), connector, dispatcher);
//! pool.start().await?;
//! tokio::signal::ctrl_c().await?;
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: tasks move into the consumer's processing list as they are taken
//! - **Crash recovery**: tasks of consumers whose lease expired are requeued on
//!   connect and by the heartbeat of live consumers
//! - **Bounded retries**: the attempt counter travels with the message
//! - **Graceful shutdown**: workers finish their current task before stopping

pub mod connection;
pub mod dispatcher;
pub mod memory;
pub mod queue;
pub mod task;
pub mod worker_pool;

pub use connection::{
    transition, ConnectionEvent, ConnectionState, InvalidTransition, QueueConnector,
    ReconnectPolicy, RedisConnector, SharedQueue,
};
pub use dispatcher::{DispatchOutcome, TaskDispatcher};
pub use memory::MemoryTaskQueue;
pub use queue::{QueueError, QueueStats, RedisTaskQueue, TaskQueue};
pub use task::{
    Delivery, EnhancedProgramPayload, ReflectionPayload, RequestPayload, TaskKind, TaskMessage,
};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};

//! Worker pool that pulls tasks from the queue and hands them to the dispatcher.
//!
//! A supervisor task owns the queue connection and drives the
//! [`ConnectionState`] machine: it connects (with backoff), recovers tasks
//! left in flight by consumers that are gone, spawns the workers and watches
//! them.
//! A worker that keeps failing to talk to the queue exits with an error,
//! which the supervisor treats as a lost transport: it stops the remaining
//! workers and reconnects.
//!
//! # Features
//!
//! - Configurable number of workers (one task in flight per worker)
//! - Graceful shutdown with broadcast channel
//! - Reconnect with capped exponential backoff
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{
    transition, ConnectionEvent, ConnectionState, QueueConnector, ReconnectPolicy,
};
use super::dispatcher::{DispatchOutcome, TaskDispatcher};
use super::queue::{QueueError, TaskQueue};
use super::task::Delivery;
use crate::config::HintConfig;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a dequeue waits for a task before checking for shutdown.
    pub poll_interval: Duration,
    /// Consecutive queue failures after which a worker gives up on the connection.
    pub max_consecutive_errors: u32,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            max_consecutive_errors: 5,
            shutdown_timeout: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn from_config(config: &HintConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            poll_interval: config.poll_interval,
            max_consecutive_errors: config.max_consecutive_errors,
            shutdown_timeout: config.shutdown_timeout,
            reconnect: config.reconnect_policy(),
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently handling a task.
    pub active_workers: usize,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_terminal: u64,
    pub tasks_already_applied: u64,
    /// Average time spent per dispatched task.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks settled.
    pub fn total_processed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_retried + self.tasks_terminal + self.tasks_already_applied
    }

    /// Returns the share of tasks that succeeded on their attempt, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    succeeded: AtomicU64,
    retried: AtomicU64,
    terminal: AtomicU64,
    already_applied: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            terminal: AtomicU64::new(0),
            already_applied: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: DispatchOutcome, duration: Duration) {
        let counter = match outcome {
            DispatchOutcome::Succeeded => &self.succeeded,
            DispatchOutcome::Retried { .. } => &self.retried,
            DispatchOutcome::Terminal => &self.terminal,
            DispatchOutcome::AlreadyApplied => &self.already_applied,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let mut stats = PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_succeeded: self.succeeded.load(Ordering::SeqCst),
            tasks_retried: self.retried.load(Ordering::SeqCst),
            tasks_terminal: self.terminal.load(Ordering::SeqCst),
            tasks_already_applied: self.already_applied.load(Ordering::SeqCst),
            average_task_duration: Duration::ZERO,
        };

        let total = stats.total_processed();
        if total > 0 {
            let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
            stats.average_task_duration = Duration::from_millis(total_duration_ms / total);
        }

        stats
    }
}

/// Worker pool that manages multiple workers processing tasks from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    connector: Arc<dyn QueueConnector>,
    dispatcher: Arc<TaskDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    supervisor: Option<JoinHandle<()>>,
    state_rx: watch::Receiver<ConnectionState>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `connector` - Opens the queue on every (re)connect
    /// * `dispatcher` - Executes and settles delivered tasks
    pub fn new(
        config: WorkerPoolConfig,
        connector: Arc<dyn QueueConnector>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (_, state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            connector,
            dispatcher,
            shutdown_tx,
            supervisor: None,
            state_rx,
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts the supervisor, which connects and then spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        self.state_rx = state_rx;

        let supervisor = Supervisor {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown_rx: self.shutdown_tx.subscribe(),
            state_tx,
            stats: Arc::clone(&self.stats),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the task they hold before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let supervisor = self.supervisor.take();
        let wait = async {
            if let Some(handle) = supervisor {
                if let Err(e) = handle.await {
                    error!(error = %e, "Supervisor task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, wait).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Current state of the queue connection.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every connection state change.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// The workers of one connection.
struct WorkerGeneration {
    stop_tx: broadcast::Sender<()>,
    handles: FuturesUnordered<JoinHandle<Result<(), QueueError>>>,
}

impl WorkerGeneration {
    /// Signals every worker to stop and waits for them.
    async fn stop(mut self) {
        let _ = self.stop_tx.send(());
        while let Some(joined) = self.handles.next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

enum Supervision {
    Shutdown,
    TransportLost(QueueError),
}

/// Owns the connection lifecycle of a running pool.
struct Supervisor {
    config: WorkerPoolConfig,
    connector: Arc<dyn QueueConnector>,
    dispatcher: Arc<TaskDispatcher>,
    shutdown_rx: broadcast::Receiver<()>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<SharedPoolStats>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut state = ConnectionState::Disconnected;
        self.apply(&mut state, ConnectionEvent::Start);

        while let ConnectionState::Connecting { attempt } = state {
            if self.wait_or_shutdown(self.config.reconnect.delay_for(attempt)).await {
                self.apply(&mut state, ConnectionEvent::GaveUp);
                return;
            }

            let queue = match self.connector.connect().await {
                Ok(queue) => queue,
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Queue connection failed");
                    self.apply(&mut state, ConnectionEvent::ConnectFailed);
                    continue;
                }
            };
            self.apply(&mut state, ConnectionEvent::ConnectSucceeded);

            match queue.recover_in_flight().await {
                Ok(0) => {}
                Ok(recovered) => info!(recovered = recovered, "Recovered in-flight tasks"),
                Err(e) => warn!(error = %e, "Failed to recover in-flight tasks"),
            }

            let generation = self.spawn_workers(&queue);
            self.apply(&mut state, ConnectionEvent::ConsumersStarted);

            match self.supervise(generation).await {
                Supervision::Shutdown => {
                    self.apply(&mut state, ConnectionEvent::GaveUp);
                    return;
                }
                Supervision::TransportLost(e) => {
                    warn!(error = %e, "Queue transport lost, reconnecting");
                    self.apply(&mut state, ConnectionEvent::TransportLost);
                }
            }
        }

        if let ConnectionState::Failed { attempts } = state {
            error!(attempts = attempts, "Giving up on queue connection");
        }
    }

    fn apply(&self, state: &mut ConnectionState, event: ConnectionEvent) {
        match transition(*state, event, &self.config.reconnect) {
            Ok(next) => {
                debug!(from = %state, to = %next, event = ?event, "Connection state change");
                *state = next;
                self.state_tx.send_replace(next);
            }
            Err(e) => warn!(error = %e, "Ignoring connection event"),
        }
    }

    /// Sleeps for `delay`; returns true if shutdown was requested meanwhile.
    async fn wait_or_shutdown(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !matches!(
                self.shutdown_rx.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }

    fn spawn_workers(&self, queue: &Arc<dyn TaskQueue>) -> WorkerGeneration {
        let (stop_tx, _) = broadcast::channel(1);

        let handles = (0..self.config.num_workers)
            .map(|i| {
                let worker = Worker::new(
                    format!("worker-{}", i),
                    Arc::clone(queue),
                    Arc::clone(&self.dispatcher),
                    stop_tx.subscribe(),
                    &self.config,
                    Arc::clone(&self.stats),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        WorkerGeneration { stop_tx, handles }
    }

    async fn supervise(&mut self, mut generation: WorkerGeneration) -> Supervision {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    generation.stop().await;
                    return Supervision::Shutdown;
                }
                joined = generation.handles.next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        generation.stop().await;
                        return Supervision::TransportLost(e);
                    }
                    Some(Err(e)) => error!(error = %e, "Worker task panicked"),
                    None => {
                        return Supervision::TransportLost(QueueError::ConnectionFailed(
                            "all workers exited".to_string(),
                        ));
                    }
                },
            }
        }
    }
}

/// A single worker that processes tasks from the queue, one at a time.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<TaskDispatcher>,
    /// Receiver for the stop signal of this worker's generation.
    stop_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    max_consecutive_errors: u32,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    fn new(
        id: String,
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<TaskDispatcher>,
        stop_rx: broadcast::Receiver<()>,
        config: &WorkerPoolConfig,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            queue,
            dispatcher,
            stop_rx,
            poll_interval: config.poll_interval,
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Main worker loop.
    ///
    /// Pulls and dispatches tasks until stopped. Returns the last queue error
    /// once `max_consecutive_errors` queue operations in a row have failed.
    async fn run(mut self) -> Result<(), QueueError> {
        info!(worker_id = %self.id, "Worker started");
        let mut consecutive_errors = 0u32;

        loop {
            match self.stop_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let result = match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                    Ok(())
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        consecutive_errors = consecutive_errors,
                        "Queue operation failed"
                    );
                    if consecutive_errors >= self.max_consecutive_errors {
                        return Err(e);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    async fn process(&self, delivery: Delivery) -> Result<(), QueueError> {
        let start = Instant::now();
        self.stats.increment_active();
        self.metrics.inc_active_workers();

        let result = self.dispatcher.dispatch(self.queue.as_ref(), &delivery).await;

        self.metrics.dec_active_workers();
        self.stats.decrement_active();

        let outcome = result?;
        self.stats.record(outcome, start.elapsed());
        debug!(
            worker_id = %self.id,
            outcome = outcome.as_str(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Task settled"
        );

        Ok(())
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

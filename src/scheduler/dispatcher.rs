//! Task dispatcher: runs one delivered task and settles it.
//!
//! ```text
//! received -> executing -> succeeded        (ack)
//!                       -> already applied  (ack, duplicate key)
//!                       -> retried          (republish tries+1 at retry priority, ack, pause)
//!                       -> terminal         (failure hint, inline delivery, ack)
//! ```
//!
//! The retry budget travels with the message (`tries`), so it survives
//! worker restarts and is shared by every worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{error, info, warn};

use super::queue::{QueueError, TaskQueue};
use super::task::{Delivery, TaskMessage};
use crate::error::ErrorReport;
use crate::metrics::MetricsCollector;
use crate::models::NewHint;
use crate::phases::{self, deliver_hint, PhaseContext};
use crate::storage::StoreError;

/// Task type used in logs and metrics when a payload does not parse at all.
const MALFORMED_TASK_TYPE: &str = "malformed";

/// How a delivered task was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    /// Republished with the given attempt number.
    Retried { tries: u32 },
    /// The task's effect already existed.
    AlreadyApplied,
    /// Retry budget exhausted or failure not retryable; a failure hint was recorded.
    Terminal,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Succeeded => "succeeded",
            DispatchOutcome::Retried { .. } => "retried",
            DispatchOutcome::AlreadyApplied => "already_applied",
            DispatchOutcome::Terminal => "terminal",
        }
    }
}

/// Runs tasks through their phase and applies the retry policy.
pub struct TaskDispatcher {
    ctx: Arc<PhaseContext>,
    max_tries: u32,
    retry_pause: Duration,
    metrics: MetricsCollector,
}

impl TaskDispatcher {
    pub fn new(ctx: Arc<PhaseContext>, max_tries: u32) -> Self {
        Self {
            ctx,
            max_tries,
            retry_pause: Duration::from_secs(1),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the pause taken after republishing a failed task.
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Executes `delivery` and acknowledges it.
    ///
    /// Phase failures never surface here: they are settled as a retry or a
    /// terminal failure.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if republishing or acknowledging fails; the
    /// delivery then stays in flight and is recovered on reconnect.
    pub async fn dispatch(
        &self,
        queue: &dyn TaskQueue,
        delivery: &Delivery,
    ) -> Result<DispatchOutcome, QueueError> {
        let start = Instant::now();

        let (task_type, outcome) = match delivery.message() {
            Ok(message) => {
                let outcome = self.execute(queue, &message).await?;
                (message.task_type, outcome)
            }
            Err(err) => {
                let request_id = serde_json::from_str::<Value>(&delivery.raw)
                    .ok()
                    .and_then(|raw| raw.pointer("/data/request_id").and_then(Value::as_i64));
                let report = ErrorReport::new("invalid_payload", &err);
                error!(
                    raw = %delivery.raw,
                    error = %report,
                    "Dropping malformed task"
                );
                self.fail_terminally(request_id, &report).await;
                (MALFORMED_TASK_TYPE.to_string(), DispatchOutcome::Terminal)
            }
        };

        queue.ack(delivery).await?;
        self.metrics
            .record_task(&task_type, outcome.as_str(), start.elapsed());

        if matches!(outcome, DispatchOutcome::Retried { .. }) {
            tokio::time::sleep(self.retry_pause).await;
        }

        Ok(outcome)
    }

    async fn execute(
        &self,
        queue: &dyn TaskQueue,
        message: &TaskMessage,
    ) -> Result<DispatchOutcome, QueueError> {
        info!(
            task_type = %message.task_type,
            tries = message.tries,
            request_id = ?message.request_id(),
            "Executing task"
        );

        let err = match phases::execute(&self.ctx, queue, message).await {
            Ok(()) => return Ok(DispatchOutcome::Succeeded),
            Err(err) => err,
        };

        if err.is_duplicate_key() {
            warn!(
                task_type = %message.task_type,
                error = %err,
                "Task already applied, dropping"
            );
            return Ok(DispatchOutcome::AlreadyApplied);
        }

        if err.is_retryable() && message.tries < self.max_tries {
            let retry = message.retry();
            warn!(
                task_type = %message.task_type,
                tries = message.tries,
                max_tries = self.max_tries,
                error = %err,
                "Task failed, republishing"
            );
            queue.publish(&retry, self.ctx.priorities.retry).await?;
            self.metrics.record_retry(&message.task_type);
            return Ok(DispatchOutcome::Retried { tries: retry.tries });
        }

        let report = ErrorReport::from_phase_error(&err);
        error!(
            task_type = %message.task_type,
            tries = message.tries,
            max_tries = self.max_tries,
            error = %report,
            "Task failed terminally"
        );

        let request_id = self.resolve_request_id(message).await;
        self.fail_terminally(request_id, &report).await;

        Ok(DispatchOutcome::Terminal)
    }

    /// Request addressed by a task, looking through `enhanced_program_id`
    /// payloads to the owning request.
    async fn resolve_request_id(&self, message: &TaskMessage) -> Option<i64> {
        if let Some(request_id) = message.request_id() {
            return Some(request_id);
        }

        let program_id = message
            .data
            .get("enhanced_program_id")
            .and_then(Value::as_i64)?;
        match self.ctx.store.load_enhanced_program(program_id).await {
            Ok(program) => Some(program.request_id),
            Err(err) => {
                warn!(
                    enhanced_program_id = program_id,
                    error = %err,
                    "Could not resolve request of failed task"
                );
                None
            }
        }
    }

    /// Records a failure hint and delivers it. Errors are logged, never raised.
    async fn fail_terminally(&self, request_id: Option<i64>, report: &ErrorReport) {
        let Some(request_id) = request_id else {
            error!("Failed task names no request, nothing to notify");
            return;
        };

        match self
            .ctx
            .store
            .add_hint(request_id, NewHint::failure(report.render()))
            .await
        {
            Ok(_) => {}
            Err(StoreError::DuplicateKey(_)) => {
                info!(request_id = request_id, "Request already has a hint, keeping it");
            }
            Err(err) => {
                error!(
                    request_id = request_id,
                    error = %err,
                    "Failed to record failure hint"
                );
                return;
            }
        }

        if let Err(err) = deliver_hint::run(&self.ctx, request_id).await {
            error!(
                request_id = request_id,
                error = %err,
                "Failed to deliver failure hint"
            );
        }
    }
}

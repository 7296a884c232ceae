//! Phase executors of the hint pipeline.
//!
//! Each task type maps to one phase. A phase loads what it needs from the
//! store, calls its collaborators, records the result and publishes the
//! follow-up tasks. Phases never wait on each other: cross-phase waiting is
//! expressed as "publish a task and return", and the readiness transition
//! reported by the store decides when hint generation is triggered.
//!
//! ```text
//! submit ──> run_student_program ────────┐
//!        └─> generate_enhanced_programs  │
//!               └─> run_enhanced_program ├─> (ready) generate_hint ─> deliver_hint
//! reflect ─> add_reflection ─────────────┘
//! ```

pub mod add_reflection;
pub mod deliver_hint;
pub mod generate_enhanced_programs;
pub mod generate_hint;
pub mod run_enhanced_program;
pub mod run_student_program;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::collaborators::{HintDelivery, ProblemQuery, ProgramExecutor};
use crate::config::{AiConfig, TaskPriorities};
use crate::error::PhaseError;
use crate::llm::LlmProvider;
use crate::metrics::MetricsCollector;
use crate::scheduler::queue::{QueueError, TaskQueue};
use crate::scheduler::task::{
    EnhancedProgramPayload, ReflectionPayload, RequestPayload, TaskKind, TaskMessage,
};
use crate::storage::HintStore;

/// Dependencies shared by every phase, constructed once at startup.
#[derive(Clone)]
pub struct PhaseContext {
    pub store: Arc<dyn HintStore>,
    pub executor: Arc<dyn ProgramExecutor>,
    pub problems: Arc<dyn ProblemQuery>,
    pub llm: Arc<dyn LlmProvider>,
    pub delivery: Arc<dyn HintDelivery>,
    pub ai: AiConfig,
    pub priorities: TaskPriorities,
}

impl PhaseContext {
    pub fn new(
        store: Arc<dyn HintStore>,
        executor: Arc<dyn ProgramExecutor>,
        problems: Arc<dyn ProblemQuery>,
        llm: Arc<dyn LlmProvider>,
        delivery: Arc<dyn HintDelivery>,
    ) -> Self {
        Self {
            store,
            executor,
            problems,
            llm,
            delivery,
            ai: AiConfig::default(),
            priorities: TaskPriorities::default(),
        }
    }

    pub fn with_ai_config(mut self, ai: AiConfig) -> Self {
        self.ai = ai;
        self
    }

    pub fn with_priorities(mut self, priorities: TaskPriorities) -> Self {
        self.priorities = priorities;
        self
    }

    /// A publisher for fresh tasks on `queue`.
    pub fn publisher<'a>(&'a self, queue: &'a dyn TaskQueue) -> TaskPublisher<'a> {
        TaskPublisher::new(queue, self.store.as_ref(), &self.priorities)
    }
}

/// Publishes fresh tasks (`tries = 1`) at the priority configured for their kind.
pub struct TaskPublisher<'a> {
    queue: &'a dyn TaskQueue,
    store: &'a dyn HintStore,
    priorities: &'a TaskPriorities,
}

impl<'a> TaskPublisher<'a> {
    pub fn new(
        queue: &'a dyn TaskQueue,
        store: &'a dyn HintStore,
        priorities: &'a TaskPriorities,
    ) -> Self {
        Self {
            queue,
            store,
            priorities,
        }
    }

    pub async fn publish(&self, kind: TaskKind, data: Value) -> Result<(), QueueError> {
        let message = TaskMessage::new(kind, data);
        self.queue
            .publish(&message, self.priorities.for_kind(kind))
            .await
    }

    /// Publishes a task whose payload is just the request id.
    pub async fn publish_for_request(
        &self,
        kind: TaskKind,
        request_id: i64,
    ) -> Result<(), QueueError> {
        self.publish(kind, json!({ "request_id": request_id }))
            .await
    }

    /// Triggers hint generation after the store reported the request ready.
    ///
    /// The request is marked only once the publish succeeded. Until then the
    /// store keeps reporting the request as due, so a redelivery of the task
    /// that completed it publishes again.
    pub async fn readiness_reached(&self, request_id: i64) -> Result<(), PhaseError> {
        info!(request_id = request_id, "Request ready, publishing generate_hint");
        MetricsCollector::new().record_readiness_transition();
        self.publish_for_request(TaskKind::GenerateHint, request_id)
            .await?;
        self.store.mark_hint_requested(request_id).await?;
        Ok(())
    }
}

/// Runs the phase named by `message`.
///
/// # Errors
///
/// Returns `UnknownTaskType` or `InvalidPayload` for malformed messages, and
/// whatever the phase itself fails with otherwise.
pub async fn execute(
    ctx: &PhaseContext,
    queue: &dyn TaskQueue,
    message: &TaskMessage,
) -> Result<(), PhaseError> {
    let kind = message.kind()?;
    let publisher = ctx.publisher(queue);

    match kind {
        TaskKind::RunStudentProgram => {
            let payload: RequestPayload = message.payload()?;
            run_student_program::run(ctx, &publisher, payload.request_id).await
        }
        TaskKind::GenerateEnhancedPrograms => {
            let payload: RequestPayload = message.payload()?;
            generate_enhanced_programs::run(ctx, &publisher, payload.request_id).await
        }
        TaskKind::RunEnhancedProgram => {
            let payload: EnhancedProgramPayload = message.payload()?;
            run_enhanced_program::run(ctx, &publisher, payload.enhanced_program_id).await
        }
        TaskKind::AddReflection => {
            let payload: ReflectionPayload = message.payload()?;
            add_reflection::run(ctx, &publisher, payload).await
        }
        TaskKind::GenerateHint => {
            let payload: RequestPayload = message.payload()?;
            generate_hint::run(ctx, &publisher, payload.request_id).await
        }
        TaskKind::DeliverHint => {
            let payload: RequestPayload = message.payload()?;
            deliver_hint::run(ctx, payload.request_id).await
        }
    }
}

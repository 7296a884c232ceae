//! Request intake: entry points used by the caller-facing layer.
//!
//! Submitting a request stores it and starts the two independent branches
//! of the pipeline (running the student program and generating enhanced
//! programs). The reflection arrives separately, whenever the student
//! answers the reflection question.

use serde_json::json;
use tracing::info;

use crate::error::PhaseError;
use crate::models::{NewRequest, Request};
use crate::phases::PhaseContext;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::task::TaskKind;

/// Creates a request and publishes its first two tasks.
///
/// # Errors
///
/// Fails with a duplicate key if the request id is already taken; nothing
/// is published in that case.
pub async fn submit_request(
    ctx: &PhaseContext,
    queue: &dyn TaskQueue,
    request: NewRequest,
) -> Result<Request, PhaseError> {
    let request = ctx.store.add_request(request).await?;
    info!(
        request_id = request.request_id,
        problem_id = %request.problem_id,
        hint_type = %request.hint_type,
        "Request submitted"
    );

    let publisher = ctx.publisher(queue);
    publisher
        .publish_for_request(TaskKind::RunStudentProgram, request.request_id)
        .await?;
    publisher
        .publish_for_request(TaskKind::GenerateEnhancedPrograms, request.request_id)
        .await?;

    Ok(request)
}

/// Publishes the student's reflection for `request_id`.
pub async fn submit_reflection(
    ctx: &PhaseContext,
    queue: &dyn TaskQueue,
    request_id: i64,
    question: impl Into<String>,
    answer: impl Into<String>,
) -> Result<(), PhaseError> {
    ctx.publisher(queue)
        .publish(
            TaskKind::AddReflection,
            json!({
                "request_id": request_id,
                "reflection_question": question.into(),
                "reflection_answer": answer.into(),
            }),
        )
        .await?;

    info!(request_id = request_id, "Reflection submitted");
    Ok(())
}

//! Runs the student's own program and records its output and runtime.
//!
//! A fully correct program short-circuits plan and debug hints: the request
//! gets the canned "already correct" hint and goes straight to delivery.
//! For optimize hints a correct program continues through the pipeline with
//! its output replaced by a fixed marker.

use tracing::{debug, info, instrument};

use super::{PhaseContext, TaskPublisher};
use crate::error::PhaseError;
use crate::models::{NewHint, CORRECT_OUTPUT_MARKER};
use crate::scheduler::task::TaskKind;
use crate::storage::StoreError;

#[instrument(skip(ctx, publisher))]
pub async fn run(
    ctx: &PhaseContext,
    publisher: &TaskPublisher<'_>,
    request_id: i64,
) -> Result<(), PhaseError> {
    let request = ctx.store.load_request(request_id).await?;
    info!(
        problem_id = %request.problem_id,
        hint_type = %request.hint_type,
        "Running student program"
    );

    let run = ctx
        .executor
        .run_program(&request.problem_id, &request.student_program)
        .await?;

    if run.correct && request.hint_type.exits_early_when_correct() {
        info!("Student program already correct, skipping hint generation");
        match ctx.store.add_hint(request_id, NewHint::already_correct()).await {
            Ok(_) => {}
            // written by an earlier delivery of this task
            Err(StoreError::DuplicateKey(_)) => debug!("Hint already recorded"),
            Err(err) => return Err(err.into()),
        }
        publisher
            .publish_for_request(TaskKind::DeliverHint, request_id)
            .await?;
        return Ok(());
    }

    let output = if run.correct {
        CORRECT_OUTPUT_MARKER.to_string()
    } else {
        run.output
    };

    let (_, ready) = ctx
        .store
        .update_request_with_test_results(request_id, output, run.elapsed_seconds)
        .await?;

    if ready {
        publisher.readiness_reached(request_id).await?;
    }

    Ok(())
}

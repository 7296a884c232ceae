//! Executes one enhanced program and records its verdict.

use tracing::{info, instrument};

use super::{PhaseContext, TaskPublisher};
use crate::error::PhaseError;

#[instrument(skip(ctx, publisher))]
pub async fn run(
    ctx: &PhaseContext,
    publisher: &TaskPublisher<'_>,
    enhanced_program_id: i64,
) -> Result<(), PhaseError> {
    let program = ctx.store.load_enhanced_program(enhanced_program_id).await?;
    let request = ctx.store.load_request(program.request_id).await?;

    let run = ctx
        .executor
        .run_program(&request.problem_id, &program.enhanced_program)
        .await?;
    info!(
        request_id = program.request_id,
        correct = run.correct,
        elapsed_seconds = run.elapsed_seconds,
        "Enhanced program executed"
    );

    let (_, ready) = ctx
        .store
        .update_enhanced_program(enhanced_program_id, run)
        .await?;

    if ready {
        publisher.readiness_reached(program.request_id).await?;
    }

    Ok(())
}

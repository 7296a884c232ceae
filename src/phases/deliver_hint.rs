//! Posts the finished hint and its trace to the caller-facing backend.

use tracing::{info, instrument};

use super::PhaseContext;
use crate::collaborators::HintResult;
use crate::error::PhaseError;
use crate::storage::StoreError;

/// Delivers the request's hint. Pure read on the store side.
///
/// Also run inline by the dispatcher after a terminal failure.
#[instrument(skip(ctx))]
pub async fn run(ctx: &PhaseContext, request_id: i64) -> Result<(), PhaseError> {
    let trace = ctx.store.load_trace(request_id).await?;
    let hint = trace
        .hint
        .clone()
        .ok_or_else(|| StoreError::NotFound(format!("hint for request {}", request_id)))?;

    let result = HintResult {
        request_id,
        hint: hint.hint,
        job_finished_successfully: hint.job_finished_successfully,
        generation_error_message: hint.generation_error_message,
        other_hint_data: trace,
    };

    ctx.delivery.post_result(&result).await?;
    info!(
        success = result.job_finished_successfully,
        "Hint delivered"
    );

    Ok(())
}

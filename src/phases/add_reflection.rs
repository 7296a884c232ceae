//! Records the student's reflection.
//!
//! A second reflection for the same request fails with a duplicate key,
//! which the dispatcher treats as already applied. The exception is a
//! redelivery whose first attempt completed the request but failed to
//! publish `generate_hint`: that one publishes it and succeeds.

use tracing::{info, instrument};

use super::{PhaseContext, TaskPublisher};
use crate::error::PhaseError;
use crate::scheduler::task::ReflectionPayload;
use crate::storage::StoreError;

#[instrument(skip(ctx, publisher, payload), fields(request_id = payload.request_id))]
pub async fn run(
    ctx: &PhaseContext,
    publisher: &TaskPublisher<'_>,
    payload: ReflectionPayload,
) -> Result<(), PhaseError> {
    let request_id = payload.request_id;
    info!("Adding reflection");

    let added = ctx
        .store
        .add_reflection(
            request_id,
            payload.reflection_question,
            payload.reflection_answer,
        )
        .await;

    let ready = match added {
        Ok((_, ready)) => ready,
        Err(StoreError::DuplicateKey(key)) => {
            if !ctx.store.hint_request_pending(request_id).await? {
                return Err(StoreError::DuplicateKey(key).into());
            }
            info!("Reflection already recorded, generate_hint still owed");
            true
        }
        Err(err) => return Err(err.into()),
    };

    if ready {
        publisher.readiness_reached(request_id).await?;
    }

    Ok(())
}

//! Asks the LLM for repaired or optimized variants of the student program
//! and schedules each variant for execution.
//!
//! A request gets one enhancement phase from this task. When the task is
//! delivered again after the phase was recorded, the LLM is not queried;
//! only the variants still lacking a verdict are scheduled again.

use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{PhaseContext, TaskPublisher};
use crate::error::PhaseError;
use crate::llm::GenerationRequest;
use crate::metrics::MetricsCollector;
use crate::models::NewEnhancementPhase;
use crate::prompts::{build_enhancement_prompt, parse_enhanced_program};
use crate::scheduler::task::TaskKind;

#[instrument(skip(ctx, publisher))]
pub async fn run(
    ctx: &PhaseContext,
    publisher: &TaskPublisher<'_>,
    request_id: i64,
) -> Result<(), PhaseError> {
    if let Some(phase) = ctx.store.load_latest_enhancement_phase(request_id).await? {
        let unscored: Vec<i64> = ctx
            .store
            .load_enhanced_programs(phase.id)
            .await?
            .into_iter()
            .filter(|program| !program.is_scored())
            .map(|program| program.id)
            .collect();
        info!(
            phase_id = phase.id,
            unscored = unscored.len(),
            "Enhancement phase already recorded, rescheduling unscored programs"
        );
        return schedule_runs(publisher, &unscored).await;
    }

    let request = ctx.store.load_request(request_id).await?;
    let details = ctx.problems.task_details(&request.problem_id).await?;
    let modification = request.hint_type.modification();

    let prompt = build_enhancement_prompt(
        modification,
        &request.student_program,
        &details.description,
        details.template_code.as_deref(),
    );

    let model = &ctx.ai.program_generation_model;
    info!(
        model = %model.name,
        n_programs = model.n_programs,
        modification = ?modification,
        "Generating enhanced programs"
    );

    let generation = GenerationRequest::new(&model.name, prompt.to_messages())
        .with_temperature(model.temperature)
        .with_n(model.n_programs)
        .with_json_response();
    let response = ctx.llm.generate(generation).await?;
    MetricsCollector::new().record_llm_latency(&model.name, response.latency_seconds);

    let contents = response.contents();
    let expected = model.n_programs as usize;
    if contents.len() != expected {
        return Err(PhaseError::VariantCountMismatch {
            expected,
            actual: contents.len(),
        });
    }

    let programs = contents
        .iter()
        .map(|content| parse_enhanced_program(content, modification))
        .collect::<Result<Vec<_>, _>>()?;

    let phase = NewEnhancementPhase {
        prompt: prompt.render(),
        model_id: model.name.clone(),
        model_temperature: model.temperature,
        whole_llm_response: Value::from(contents).to_string(),
        llm_waiting_seconds: response.latency_seconds,
    };
    let (phase, rows) = ctx
        .store
        .add_enhancement_phase(request_id, phase, programs)
        .await?;

    info!(
        phase_id = phase.id,
        programs = rows.len(),
        "Enhancement phase recorded"
    );

    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    schedule_runs(publisher, &ids).await
}

async fn schedule_runs(
    publisher: &TaskPublisher<'_>,
    program_ids: &[i64],
) -> Result<(), PhaseError> {
    for id in program_ids {
        publisher
            .publish(
                TaskKind::RunEnhancedProgram,
                json!({ "enhanced_program_id": id }),
            )
            .await?;
    }
    Ok(())
}

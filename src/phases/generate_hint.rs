//! Generates the pedagogical hint once a request is ready.
//!
//! Steps:
//! 1. Pick the reference program among the correct enhanced programs
//! 2. Record the enhancement phase outcome
//! 3. Build the hint prompt and query the LLM
//! 4. Store the hint generation phase and the hint together
//! 5. Schedule delivery

use tracing::{info, instrument};

use super::{PhaseContext, TaskPublisher};
use crate::error::PhaseError;
use crate::llm::GenerationRequest;
use crate::metrics::MetricsCollector;
use crate::models::{EnhancedProgram, NewHint, NewHintGenerationPhase};
use crate::prompts::{build_hint_prompt, parse_hint_response, HintPromptInput};
use crate::scheduler::task::TaskKind;
use crate::selection::select_reference_program;
use crate::storage::StoreError;

#[instrument(skip(ctx, publisher))]
pub async fn run(
    ctx: &PhaseContext,
    publisher: &TaskPublisher<'_>,
    request_id: i64,
) -> Result<(), PhaseError> {
    if ctx.store.load_hint(request_id).await?.is_some() {
        // An earlier delivery generated it but did not get to publish delivery.
        info!("Hint already exists, scheduling delivery");
        publisher
            .publish_for_request(TaskKind::DeliverHint, request_id)
            .await?;
        return Ok(());
    }

    let request = ctx.store.load_request(request_id).await?;
    let phase = ctx.store.load_latest_enhancement_phase(request_id).await?;

    let correct: Vec<EnhancedProgram> = match &phase {
        Some(phase) => ctx
            .store
            .load_enhanced_programs(phase.id)
            .await?
            .into_iter()
            .filter(|program| program.is_correct == Some(true))
            .collect(),
        None => Vec::new(),
    };

    let reference = select_reference_program(request.hint_type, &request.student_program, &correct)
        .map(|program| program.enhanced_program.clone());

    if let Some(phase) = &phase {
        let n_correct = i32::try_from(correct.len())
            .map_err(|_| StoreError::Corrupt("too many correct enhanced programs".to_string()))?;
        ctx.store
            .update_enhancement_phase_outcome(phase.id, n_correct, reference.clone())
            .await?;
    }

    let details = ctx.problems.task_details(&request.problem_id).await?;
    let reflection = ctx.store.load_reflection(request_id).await?;

    let prompt = build_hint_prompt(&HintPromptInput {
        hint_type: request.hint_type,
        task_description: &details.description,
        template_code: details.template_code.as_deref(),
        program: &request.student_program,
        program_output: request.student_program_output.as_deref().unwrap_or_default(),
        reference_program: reference.as_deref(),
        reflection: reflection
            .as_ref()
            .map(|reflection| reflection.reflection_answer.as_str()),
    });

    let model = &ctx.ai.hint_generation_model;
    info!(
        model = %model.name,
        n_correct = correct.len(),
        has_reference = reference.is_some(),
        "Generating hint"
    );

    let generation = GenerationRequest::new(&model.name, prompt.to_messages())
        .with_temperature(model.temperature)
        .with_json_response();
    let response = ctx.llm.generate(generation).await?;
    MetricsCollector::new().record_llm_latency(&model.name, response.latency_seconds);

    let content = response
        .first_content()
        .ok_or_else(|| PhaseError::ResponseParse("hint: response has no choices".to_string()))?;
    let parsed = parse_hint_response(content)?;

    let phase = NewHintGenerationPhase {
        prompt: prompt.render(),
        model_id: model.name.clone(),
        model_temperature: model.temperature,
        whole_llm_response: content.to_string(),
        llm_waiting_seconds: response.latency_seconds,
    };
    ctx.store
        .add_hint_generation(
            request_id,
            phase,
            NewHint::success(parsed.hint, parsed.explanation),
        )
        .await?;

    publisher
        .publish_for_request(TaskKind::DeliverHint, request_id)
        .await?;

    Ok(())
}

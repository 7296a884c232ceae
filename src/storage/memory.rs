//! In-process implementation of [`HintStore`].
//!
//! Used by tests and single-process runs. Row data sits behind one state
//! mutex; the per-request exclusive section is a [`RequestLocks`] map, held
//! across the whole read-modify-evaluate sequence like the advisory lock of
//! the Postgres store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::locks::RequestLocks;
use super::store::{HintStore, StoreError};
use crate::models::{
    EnhancedProgram, EnhancementPhase, Hint, HintGenerationPhase, NewEnhancementPhase, NewHint,
    NewHintGenerationPhase, NewRequest, ProgramRun, Reflection, Request, TraceData,
};
use crate::readiness::{self, hint_request_due_logged, PhaseProgress, ReadinessSnapshot};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    requests: HashMap<i64, Request>,
    reflections: HashMap<i64, Reflection>,
    /// Insertion order; the last phase of a request is its latest.
    phases: Vec<EnhancementPhase>,
    /// Insertion order.
    programs: Vec<EnhancedProgram>,
    hint_phases: Vec<HintGenerationPhase>,
    hints: HashMap<i64, Hint>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn request(&self, request_id: i64) -> Result<&Request, StoreError> {
        self.requests
            .get(&request_id)
            .ok_or_else(|| StoreError::NotFound(format!("request {}", request_id)))
    }

    fn latest_phase(&self, request_id: i64) -> Option<&EnhancementPhase> {
        self.phases.iter().rev().find(|p| p.request_id == request_id)
    }

    fn programs_of(&self, phase_id: i64) -> impl Iterator<Item = &EnhancedProgram> {
        self.programs.iter().filter(move |p| p.phase_id == phase_id)
    }

    fn snapshot(&self, request_id: i64) -> ReadinessSnapshot {
        let Some(request) = self.requests.get(&request_id) else {
            return ReadinessSnapshot::default();
        };

        let latest_phase = self.latest_phase(request_id).map(|phase| {
            let (created, scored) = self
                .programs_of(phase.id)
                .fold((0, 0), |(created, scored), p| {
                    (created + 1, scored + i64::from(p.is_scored()))
                });
            PhaseProgress {
                model_n: i64::from(phase.model_n),
                created,
                scored,
            }
        });

        ReadinessSnapshot {
            request_exists: true,
            has_test_results: request.has_test_results(),
            has_reflection: self.reflections.contains_key(&request_id),
            latest_phase,
            hint_requested: request.hint_requested_at.is_some(),
            has_hint: self.hints.contains_key(&request_id),
        }
    }
}

/// [`HintStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    sections: RequestLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hint generation phases recorded for a request.
    pub async fn hint_generation_count(&self, request_id: i64) -> usize {
        let state = self.state.lock().await;
        state
            .hint_phases
            .iter()
            .filter(|p| p.request_id == request_id)
            .count()
    }
}

#[async_trait]
impl HintStore for MemoryStore {
    async fn add_request(&self, new: NewRequest) -> Result<Request, StoreError> {
        let mut state = self.state.lock().await;
        if state.requests.contains_key(&new.request_id) {
            return Err(StoreError::DuplicateKey(format!(
                "request {}",
                new.request_id
            )));
        }

        let now = Utc::now();
        let request = Request {
            request_id: new.request_id,
            problem_id: new.problem_id,
            student_program: new.student_program,
            student_notebook: new.student_notebook,
            hint_type: new.hint_type,
            student_program_output: None,
            run_time: None,
            hint_requested_at: None,
            created_at: now,
            updated_at: now,
        };
        state.requests.insert(request.request_id, request.clone());
        Ok(request)
    }

    async fn load_request(&self, request_id: i64) -> Result<Request, StoreError> {
        let state = self.state.lock().await;
        state.request(request_id).cloned()
    }

    async fn update_request_with_test_results(
        &self,
        request_id: i64,
        output: String,
        run_time: f64,
    ) -> Result<(Request, bool), StoreError> {
        let _section = self.sections.acquire(request_id).await;
        let mut state = self.state.lock().await;

        let request = state.request(request_id)?;
        if request.has_test_results() {
            let due = hint_request_due_logged(request_id, &state.snapshot(request_id));
            return Ok((request.clone(), due));
        }

        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| StoreError::NotFound(format!("request {}", request_id)))?;
        request.student_program_output = Some(output);
        request.run_time = Some(run_time);
        request.updated_at = Utc::now();
        let request = request.clone();

        let ready = hint_request_due_logged(request_id, &state.snapshot(request_id));
        Ok((request, ready))
    }

    async fn add_reflection(
        &self,
        request_id: i64,
        question: String,
        answer: String,
    ) -> Result<(Reflection, bool), StoreError> {
        let _section = self.sections.acquire(request_id).await;
        let mut state = self.state.lock().await;

        state.request(request_id)?;
        if state.reflections.contains_key(&request_id) {
            return Err(StoreError::DuplicateKey(format!(
                "reflection for request {}",
                request_id
            )));
        }

        let reflection = Reflection {
            id: state.next_id(),
            request_id,
            reflection_question: question,
            reflection_answer: answer,
            created_at: Utc::now(),
        };
        state.reflections.insert(request_id, reflection.clone());

        let ready = hint_request_due_logged(request_id, &state.snapshot(request_id));
        Ok((reflection, ready))
    }

    async fn load_reflection(&self, request_id: i64) -> Result<Option<Reflection>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.reflections.get(&request_id).cloned())
    }

    async fn add_enhancement_phase(
        &self,
        request_id: i64,
        phase: NewEnhancementPhase,
        programs: Vec<String>,
    ) -> Result<(EnhancementPhase, Vec<EnhancedProgram>), StoreError> {
        let _section = self.sections.acquire(request_id).await;
        let mut state = self.state.lock().await;
        state.request(request_id)?;

        let now = Utc::now();
        let model_n = i32::try_from(programs.len())
            .map_err(|_| StoreError::Corrupt("too many enhanced programs".to_string()))?;
        let phase = EnhancementPhase {
            id: state.next_id(),
            request_id,
            prompt: phase.prompt,
            model_id: phase.model_id,
            model_temperature: phase.model_temperature,
            model_n,
            whole_llm_response: phase.whole_llm_response,
            llm_waiting_seconds: phase.llm_waiting_seconds,
            n_correct_enhancements: None,
            best_enhanced_program: None,
            created_at: now,
            updated_at: now,
        };

        let mut created = Vec::with_capacity(programs.len());
        for program in programs {
            created.push(EnhancedProgram {
                id: state.next_id(),
                phase_id: phase.id,
                request_id,
                enhanced_program: program,
                is_correct: None,
                program_output: None,
                run_time: None,
                created_at: now,
                updated_at: now,
            });
        }

        state.phases.push(phase.clone());
        state.programs.extend(created.iter().cloned());
        Ok((phase, created))
    }

    async fn load_latest_enhancement_phase(
        &self,
        request_id: i64,
    ) -> Result<Option<EnhancementPhase>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.latest_phase(request_id).cloned())
    }

    async fn update_enhancement_phase_outcome(
        &self,
        phase_id: i64,
        n_correct_enhancements: i32,
        best_enhanced_program: Option<String>,
    ) -> Result<EnhancementPhase, StoreError> {
        let mut state = self.state.lock().await;
        let phase = state
            .phases
            .iter_mut()
            .find(|p| p.id == phase_id)
            .ok_or_else(|| StoreError::NotFound(format!("enhancement phase {}", phase_id)))?;

        if phase.n_correct_enhancements.is_none() {
            phase.n_correct_enhancements = Some(n_correct_enhancements);
            phase.best_enhanced_program = best_enhanced_program;
            phase.updated_at = Utc::now();
        }
        Ok(phase.clone())
    }

    async fn load_enhanced_program(&self, id: i64) -> Result<EnhancedProgram, StoreError> {
        let state = self.state.lock().await;
        state
            .programs
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("enhanced program {}", id)))
    }

    async fn load_enhanced_programs(
        &self,
        phase_id: i64,
    ) -> Result<Vec<EnhancedProgram>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.programs_of(phase_id).cloned().collect())
    }

    async fn update_enhanced_program(
        &self,
        id: i64,
        run: ProgramRun,
    ) -> Result<(EnhancedProgram, bool), StoreError> {
        let request_id = self.load_enhanced_program(id).await?.request_id;

        let _section = self.sections.acquire(request_id).await;
        let mut state = self.state.lock().await;

        let program = state
            .programs
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("enhanced program {}", id)))?;
        if program.is_scored() {
            let program = program.clone();
            let due = hint_request_due_logged(request_id, &state.snapshot(request_id));
            return Ok((program, due));
        }

        program.is_correct = Some(run.correct);
        program.program_output = Some(run.output);
        program.run_time = Some(run.elapsed_seconds);
        program.updated_at = Utc::now();
        let program = program.clone();

        let ready = hint_request_due_logged(request_id, &state.snapshot(request_id));
        Ok((program, ready))
    }

    async fn add_hint_generation(
        &self,
        request_id: i64,
        phase: NewHintGenerationPhase,
        hint: NewHint,
    ) -> Result<(HintGenerationPhase, Hint), StoreError> {
        let mut state = self.state.lock().await;
        state.request(request_id)?;
        if state.hints.contains_key(&request_id) {
            return Err(StoreError::DuplicateKey(format!(
                "hint for request {}",
                request_id
            )));
        }

        let now = Utc::now();
        let phase = HintGenerationPhase {
            id: state.next_id(),
            request_id,
            prompt: phase.prompt,
            model_id: phase.model_id,
            model_temperature: phase.model_temperature,
            whole_llm_response: phase.whole_llm_response,
            llm_waiting_seconds: phase.llm_waiting_seconds,
            created_at: now,
        };
        let hint = Hint {
            id: state.next_id(),
            request_id,
            hint: hint.hint,
            explanation: hint.explanation,
            job_finished_successfully: hint.job_finished_successfully,
            generation_error_message: hint.generation_error_message,
            created_at: now,
        };

        state.hint_phases.push(phase.clone());
        state.hints.insert(request_id, hint.clone());
        Ok((phase, hint))
    }

    async fn add_hint(&self, request_id: i64, hint: NewHint) -> Result<Hint, StoreError> {
        let mut state = self.state.lock().await;
        state.request(request_id)?;
        if state.hints.contains_key(&request_id) {
            return Err(StoreError::DuplicateKey(format!(
                "hint for request {}",
                request_id
            )));
        }

        let hint = Hint {
            id: state.next_id(),
            request_id,
            hint: hint.hint,
            explanation: hint.explanation,
            job_finished_successfully: hint.job_finished_successfully,
            generation_error_message: hint.generation_error_message,
            created_at: Utc::now(),
        };
        state.hints.insert(request_id, hint.clone());
        Ok(hint)
    }

    async fn load_hint(&self, request_id: i64) -> Result<Option<Hint>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.hints.get(&request_id).cloned())
    }

    async fn load_trace(&self, request_id: i64) -> Result<TraceData, StoreError> {
        let state = self.state.lock().await;
        let mut trace = TraceData::for_request(state.request(request_id)?.clone());

        trace.reflection = state.reflections.get(&request_id).cloned();
        if let Some(phase) = state.latest_phase(request_id) {
            trace.enhanced_programs = state.programs_of(phase.id).cloned().collect();
            trace.program_enhancement_phase = Some(phase.clone());
        }
        trace.hint_generation_phase = state
            .hint_phases
            .iter()
            .rev()
            .find(|p| p.request_id == request_id)
            .cloned();
        trace.hint = state.hints.get(&request_id).cloned();

        Ok(trace)
    }

    async fn mark_hint_requested(&self, request_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| StoreError::NotFound(format!("request {}", request_id)))?;
        if request.hint_requested_at.is_none() {
            let now = Utc::now();
            request.hint_requested_at = Some(now);
            request.updated_at = now;
        }
        Ok(())
    }

    async fn hint_request_pending(&self, request_id: i64) -> Result<bool, StoreError> {
        let _section = self.sections.acquire(request_id).await;
        let state = self.state.lock().await;
        Ok(readiness::hint_request_due(&state.snapshot(request_id)))
    }

    async fn is_ready(&self, request_id: i64) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(readiness::evaluate(&state.snapshot(request_id)).is_ready())
    }
}

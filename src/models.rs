//! Records tracked for every hint request.
//!
//! A `Request` owns at most one `Reflection`, one or more `EnhancementPhase`
//! rows (the latest one is authoritative), the `EnhancedProgram` rows of each
//! phase, the `HintGenerationPhase` and the final `Hint`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of hint the student asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintType {
    /// Help planning a solution.
    Plan,
    /// Help locating a bug.
    Debug,
    /// Help making a correct program faster or cleaner.
    Optimize,
}

impl HintType {
    /// Returns the string stored in the database and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HintType::Plan => "plan",
            HintType::Debug => "debug",
            HintType::Optimize => "optimize",
        }
    }

    /// How enhanced programs are generated for this hint type.
    pub fn modification(&self) -> Modification {
        match self {
            HintType::Plan | HintType::Debug => Modification::Repair,
            HintType::Optimize => Modification::Optimize,
        }
    }

    /// Whether an already-correct student program ends the pipeline early.
    pub fn exits_early_when_correct(&self) -> bool {
        matches!(self, HintType::Plan | HintType::Debug)
    }
}

impl fmt::Display for HintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HintType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(HintType::Plan),
            "debug" => Ok(HintType::Debug),
            "optimize" => Ok(HintType::Optimize),
            other => Err(format!(
                "unknown hint type '{}': expected plan, debug or optimize",
                other
            )),
        }
    }
}

/// Kind of rewrite requested from the LLM when generating enhanced programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    /// Fix the student's program with minimal changes.
    Repair,
    /// Optimize an (often already correct) program.
    Optimize,
}

impl Modification {
    /// JSON field the LLM is asked to put the rewritten program in.
    pub fn response_key(&self) -> &'static str {
        match self {
            Modification::Repair => "fixed_program",
            Modification::Optimize => "optimized_program",
        }
    }
}

/// A student hint request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Identifier assigned by the upstream caller.
    pub request_id: i64,
    pub problem_id: String,
    pub student_program: String,
    pub student_notebook: Option<serde_json::Value>,
    pub hint_type: HintType,
    /// Output of the student's program; set together with `run_time`.
    pub student_program_output: Option<String>,
    /// Runtime in seconds; set together with `student_program_output`.
    pub run_time: Option<f64>,
    /// When `generate_hint` was published for this request.
    #[serde(default)]
    pub hint_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Returns true once the student's program has been executed.
    pub fn has_test_results(&self) -> bool {
        self.student_program_output.is_some() && self.run_time.is_some()
    }
}

/// Input for creating a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub request_id: i64,
    pub problem_id: String,
    pub hint_type: HintType,
    pub student_program: String,
    #[serde(default)]
    pub student_notebook: Option<serde_json::Value>,
}

impl NewRequest {
    pub fn new(
        request_id: i64,
        problem_id: impl Into<String>,
        hint_type: HintType,
        student_program: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            problem_id: problem_id.into(),
            hint_type,
            student_program: student_program.into(),
            student_notebook: None,
        }
    }

    /// Attaches the structured notebook the program was extracted from.
    pub fn with_notebook(mut self, notebook: serde_json::Value) -> Self {
        self.student_notebook = Some(notebook);
        self
    }
}

/// The student's answer to the reflection question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub id: i64,
    pub request_id: i64,
    pub reflection_question: String,
    pub reflection_answer: String,
    pub created_at: DateTime<Utc>,
}

/// LLM call that produced the enhanced programs of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementPhase {
    pub id: i64,
    pub request_id: i64,
    pub prompt: String,
    pub model_id: String,
    pub model_temperature: f64,
    /// Number of enhanced programs created with this phase.
    pub model_n: i32,
    pub whole_llm_response: String,
    pub llm_waiting_seconds: f64,
    /// Filled by hint generation once every variant has been scored.
    pub n_correct_enhancements: Option<i32>,
    /// Filled by hint generation; `None` when no variant was correct.
    pub best_enhanced_program: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an enhancement phase.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEnhancementPhase {
    pub prompt: String,
    pub model_id: String,
    pub model_temperature: f64,
    pub whole_llm_response: String,
    pub llm_waiting_seconds: f64,
}

/// One LLM-generated variant of the student's program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedProgram {
    pub id: i64,
    pub phase_id: i64,
    pub request_id: i64,
    pub enhanced_program: String,
    /// `None` until the variant has been executed.
    pub is_correct: Option<bool>,
    pub program_output: Option<String>,
    pub run_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnhancedProgram {
    /// Returns true once the variant has a correctness verdict.
    pub fn is_scored(&self) -> bool {
        self.is_correct.is_some()
    }
}

/// Result of running a program against the problem's test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRun {
    pub correct: bool,
    pub output: String,
    pub elapsed_seconds: f64,
}

/// LLM call that produced the final hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintGenerationPhase {
    pub id: i64,
    pub request_id: i64,
    pub prompt: String,
    pub model_id: String,
    pub model_temperature: f64,
    pub whole_llm_response: String,
    pub llm_waiting_seconds: f64,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a hint generation phase.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHintGenerationPhase {
    pub prompt: String,
    pub model_id: String,
    pub model_temperature: f64,
    pub whole_llm_response: String,
    pub llm_waiting_seconds: f64,
}

/// The terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub id: i64,
    pub request_id: i64,
    pub hint: String,
    pub explanation: String,
    pub job_finished_successfully: bool,
    pub generation_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Hint text returned when the student's program already passes every test.
pub const ALREADY_CORRECT_HINT: &str = "Your code seems already correct.";

/// Hint text returned when the retry budget has been exhausted.
pub const FAILURE_HINT: &str = "Sorry, we cannot generate a hint. Please try again later.";

/// Output recorded for a correct program when an optimization hint is requested.
pub const CORRECT_OUTPUT_MARKER: &str = "Student program's output is correct.";

/// Input for creating a hint.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHint {
    pub hint: String,
    pub explanation: String,
    pub job_finished_successfully: bool,
    pub generation_error_message: Option<String>,
}

impl NewHint {
    /// A successfully generated hint.
    pub fn success(hint: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            hint: hint.into(),
            explanation: explanation.into(),
            job_finished_successfully: true,
            generation_error_message: None,
        }
    }

    /// The canned hint for a program that already passes every test.
    pub fn already_correct() -> Self {
        Self::success(ALREADY_CORRECT_HINT, "")
    }

    /// The canned apology recorded after a terminal failure.
    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            hint: FAILURE_HINT.to_string(),
            explanation: String::new(),
            job_finished_successfully: false,
            generation_error_message: Some(error_message.into()),
        }
    }
}

/// Current version of the [`TraceData`] layout.
pub const TRACE_DATA_VERSION: u32 = 1;

/// Everything recorded while generating a hint, posted alongside the hint.
///
/// The layout is explicit and versioned; adding a field means bumping
/// [`TRACE_DATA_VERSION`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub version: u32,
    pub request: Request,
    pub reflection: Option<Reflection>,
    pub program_enhancement_phase: Option<EnhancementPhase>,
    pub enhanced_programs: Vec<EnhancedProgram>,
    pub hint_generation_phase: Option<HintGenerationPhase>,
    pub hint: Option<Hint>,
}

impl TraceData {
    /// Starts a trace for a request with no phase data yet.
    pub fn for_request(request: Request) -> Self {
        Self {
            version: TRACE_DATA_VERSION,
            request,
            reflection: None,
            program_enhancement_phase: None,
            enhanced_programs: Vec::new(),
            hint_generation_phase: None,
            hint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_type_parse_and_display() {
        assert_eq!("plan".parse::<HintType>(), Ok(HintType::Plan));
        assert_eq!(" Debug ".parse::<HintType>(), Ok(HintType::Debug));
        assert_eq!("optimize".parse::<HintType>(), Ok(HintType::Optimize));
        assert!("refactor".parse::<HintType>().is_err());

        assert_eq!(HintType::Optimize.to_string(), "optimize");
    }

    #[test]
    fn test_hint_type_modification() {
        assert_eq!(HintType::Plan.modification(), Modification::Repair);
        assert_eq!(HintType::Debug.modification(), Modification::Repair);
        assert_eq!(HintType::Optimize.modification(), Modification::Optimize);

        assert_eq!(Modification::Repair.response_key(), "fixed_program");
        assert_eq!(Modification::Optimize.response_key(), "optimized_program");
    }

    #[test]
    fn test_early_exit_only_for_plan_and_debug() {
        assert!(HintType::Plan.exits_early_when_correct());
        assert!(HintType::Debug.exits_early_when_correct());
        assert!(!HintType::Optimize.exits_early_when_correct());
    }

    #[test]
    fn test_hint_type_serde_is_lowercase() {
        let json = serde_json::to_string(&HintType::Debug).expect("serialize");
        assert_eq!(json, "\"debug\"");
    }

    #[test]
    fn test_new_hint_constructors() {
        let hint = NewHint::already_correct();
        assert_eq!(hint.hint, ALREADY_CORRECT_HINT);
        assert!(hint.job_finished_successfully);
        assert!(hint.generation_error_message.is_none());

        let failure = NewHint::failure("boom");
        assert_eq!(failure.hint, FAILURE_HINT);
        assert!(!failure.job_finished_successfully);
        assert_eq!(failure.generation_error_message.as_deref(), Some("boom"));
    }
}

//! Prompt for generating repaired or optimized variants of a student program.
//!
//! The model is asked for a JSON object holding one program under
//! `fixed_program` (repair) or `optimized_program` (optimize); several
//! completions are requested at once with `n`.

use serde_json::Value;

use crate::error::PhaseError;
use crate::llm::Message;
use crate::models::Modification;

/// Prompts for the program enhancement stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancementPrompt {
    pub system: String,
    pub user: String,
}

impl EnhancementPrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// The prompt as chat messages.
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    /// Text stored with the enhancement phase.
    pub fn render(&self) -> String {
        format!("System: {}\n\nUser: {}", self.system, self.user)
    }
}

const REPAIR_SYSTEM_PROMPT: &str = "You are a helpful teaching assistant. You are helping students learn to solve programming problems in a Python course. Below you are provided a student's current program for a Python programming problem. Your goal is to help the student by fixing their program.";

const OPTIMIZE_SYSTEM_PROMPT: &str = "You are a helpful teaching assistant. You are helping students learn to solve programming problems in a Python course. Below you are provided a student's current program for a Python programming problem. Your goal is to help the student by optimizing their program.";

const REPAIR_COMMAND_TAIL: &str = "Can you help the student fix the program? Make sure that you make minimal changes needed to fix the program.\n\nOutput only the fixed program in JSON format with the field name \"fixed_program\".";

const OPTIMIZE_COMMAND_TAIL: &str = "Can you help the student optimize the program to enhance speed, readability, and memory usage?\n\nOutput only the optimized program in JSON format with the field name \"optimized_program\".";

/// Builds the enhancement prompt.
///
/// # Arguments
///
/// * `modification` - Whether variants should repair or optimize the program
/// * `program` - The student's program
/// * `task_description` - Problem statement
/// * `template_code` - Starter code, omitted from the prompt when absent or empty
pub fn build_enhancement_prompt(
    modification: Modification,
    program: &str,
    task_description: &str,
    template_code: Option<&str>,
) -> EnhancementPrompt {
    let (system, command_tail) = match modification {
        Modification::Repair => (REPAIR_SYSTEM_PROMPT, REPAIR_COMMAND_TAIL),
        Modification::Optimize => (OPTIMIZE_SYSTEM_PROMPT, OPTIMIZE_COMMAND_TAIL),
    };

    let sections = [
        format!("Problem description:\n{}\n\n", task_description),
        super::template_section(template_code),
        format!("Student's program:\n```\n{}\n```\n\n", program),
        command_tail.to_string(),
    ];

    EnhancementPrompt::new(system, sections.join("\n"))
}

/// Extracts the program from one completion.
///
/// Empty content or a missing key yields an empty program; content that is
/// not a JSON object is an error.
pub fn parse_enhanced_program(
    content: &str,
    modification: Modification,
) -> Result<String, PhaseError> {
    if content.trim().is_empty() {
        return Ok(String::new());
    }

    let json: Value = serde_json::from_str(content)
        .map_err(|e| PhaseError::ResponseParse(format!("enhanced program: {}", e)))?;
    let Some(object) = json.as_object() else {
        return Err(PhaseError::ResponseParse(
            "enhanced program: expected a JSON object".to_string(),
        ));
    };

    Ok(object
        .get(modification.response_key())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

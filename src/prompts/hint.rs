//! Prompt for the final pedagogical hint and parsing of its answer.
//!
//! The model answers with `{"explanation": ..., "hint": ...}`. The
//! student's reflection is mentioned only when it is substantial, and the
//! current output of the program only for debugging hints.

use serde_json::Value;

use crate::error::PhaseError;
use crate::llm::Message;
use crate::models::HintType;

/// Reflections with fewer whitespace-separated words carry no signal.
pub const MIN_REFLECTION_WORDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintPrompt {
    pub system: String,
    pub user: String,
}

impl HintPrompt {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    pub fn render(&self) -> String {
        format!("System: {}\n\nUser: {}", self.system, self.user)
    }
}

/// Everything the hint prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct HintPromptInput<'a> {
    pub hint_type: HintType,
    pub task_description: &'a str,
    pub template_code: Option<&'a str>,
    pub program: &'a str,
    /// Output of the student's program (shown for debug hints only).
    pub program_output: &'a str,
    /// Selected enhanced program, if any candidate was correct.
    pub reference_program: Option<&'a str>,
    pub reflection: Option<&'a str>,
}

const SYSTEM_PROMPT: &str = "You are a helpful teaching assistant. You are helping students learn to solve programming problems in a Python course. Below you are provided a student's current program for a Python programming problem.{mention_reflection} Your goal is to help the student by providing a pedagogical hint. Write a hint that can be directly presented to the student, and be socratic and friendly.";

const PLAN_COMMAND_TAIL: &str = "(1) Detailed Explanation: Can you discuss a step by step plan to solve this problem while accounting for the student's progress based on the student's program?{in_explanation}\n\n(2) Pedagogical Hint: Can you provide a hint about a plan to solve this problem while accounting for the student's progress based on the student's program? The hint should focus on helping the student with a plan, instead of helping in debugging. Do not give away the solution or write any code in the hint. Write a hint that can be directly presented to the student, and be socratic and friendly. Keep your hint concise.{in_hint}\n\nOutput only the explanation for (1) and the hint for (2) in JSON format with the field names \"explanation\" and \"hint\", respectively.";

const DEBUG_COMMAND_TAIL: &str = "(1) Detailed Explanation: Can you explain the bug(s) in the student's program and the required fixes in a step by step manner?{in_explanation}\n\n(2) Pedagogical Hint: Can you provide a hint about one bug in the student's program? Do not give away the solution or write any code in the hint. Write a hint that can be directly presented to the student, and be socratic and friendly. Keep your hint concise, ideally to a sentence or two at most. When there are multiple bugs, you should provide your hint based on an important bug or overarching issue.{in_hint}\n\nOutput only the explanation for (1) and the hint for (2) in JSON format with the field names \"explanation\" and \"hint\", respectively.";

const OPTIMIZE_COMMAND_TAIL: &str = "(1) Detailed Explanation: Can you explain any issues in the student's program in terms of speed, readability, and memory usage along with possible ways to optimize in a step by step manner?{in_explanation}\n\n(2) Pedagogical Hint: Can you provide a hint about optimizing the student's program in terms of speed, readability, and memory usage? The hint should focus on helping the student with optimizing the student's program, instead of helping in debugging. Do not give away the solution or write any code in the hint. Write a hint that can be directly presented to the student, and be socratic and friendly. Keep your hint concise.{in_hint}\n\nOutput only the explanation for (1) and the hint for (2) in JSON format with the field names \"explanation\" and \"hint\", respectively.";

const REFLECTION_IN_SYSTEM: &str =
    " Additionally, the student has shared their reflection about possible issues.";
const REFLECTION_IN_EXPLANATION: &str =
    " In your explanation, you should consider the student's reflection if you think it is relevant.";
const REFLECTION_IN_HINT: &str =
    " In your hint, you should consider the student's reflection if you think it is relevant.";
const REFLECTION_IN_DEBUGGING_HINT: &str = " In your hint, you should consider the student's reflection if you think it is relevant; in particular, when a student mentions a specific bug or issue, prioritize your hint based on that issue.";

/// Whether a reflection answer is worth showing to the model.
pub fn reflection_is_substantial(reflection: Option<&str>) -> bool {
    reflection.is_some_and(|text| text.split_whitespace().count() >= MIN_REFLECTION_WORDS)
}

fn reference_section(hint_type: HintType, program: &str) -> String {
    let heading = match hint_type {
        HintType::Plan => "A solution program for reference:",
        HintType::Debug => "A solution program obtained by fixing the student's program:",
        HintType::Optimize => "A solution program obtained by optimizing the student's program:",
    };
    format!("{}\n```\n{}\n```\n\n", heading, program)
}

fn command_tail(hint_type: HintType, substantial: bool) -> String {
    let template = match hint_type {
        HintType::Plan => PLAN_COMMAND_TAIL,
        HintType::Debug => DEBUG_COMMAND_TAIL,
        HintType::Optimize => OPTIMIZE_COMMAND_TAIL,
    };

    let (in_explanation, in_hint) = match (substantial, hint_type) {
        (false, _) => ("", ""),
        (true, HintType::Debug) => (REFLECTION_IN_EXPLANATION, REFLECTION_IN_DEBUGGING_HINT),
        (true, _) => (REFLECTION_IN_EXPLANATION, REFLECTION_IN_HINT),
    };

    template
        .replace("{in_explanation}", in_explanation)
        .replace("{in_hint}", in_hint)
}

/// Builds the hint prompt.
pub fn build_hint_prompt(input: &HintPromptInput<'_>) -> HintPrompt {
    let substantial = reflection_is_substantial(input.reflection);

    let system = SYSTEM_PROMPT.replace(
        "{mention_reflection}",
        if substantial { REFLECTION_IN_SYSTEM } else { "" },
    );

    let reflection = match input.reflection {
        Some(text) if substantial => {
            format!("Student's reflection about possible issues:\n{}\n\n", text)
        }
        _ => String::new(),
    };

    let output = if input.hint_type == HintType::Debug {
        format!(
            "Current output of the student program:\n{}\n\n",
            input.program_output
        )
    } else {
        String::new()
    };

    let reference = input
        .reference_program
        .filter(|program| !program.is_empty())
        .map(|program| reference_section(input.hint_type, program))
        .unwrap_or_default();

    let sections = [
        format!("Problem description:\n{}\n\n", input.task_description),
        super::template_section(input.template_code),
        format!("Student's program:\n```\n{}\n```\n\n", input.program),
        reflection,
        output,
        reference,
        command_tail(input.hint_type, substantial),
    ];

    HintPrompt {
        system,
        user: sections.join("\n"),
    }
}

/// A parsed hint answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHint {
    pub explanation: String,
    pub hint: String,
}

fn strip_marker<'a>(text: &'a str, marker: &str) -> &'a str {
    text.strip_prefix(marker)
        .map(str::trim_start)
        .unwrap_or(text)
}

/// Parses the model's JSON answer.
///
/// `explanation` defaults to empty; `hint` is required. Leading `(1)` and
/// `(2)` markers copied from the prompt are removed.
pub fn parse_hint_response(content: &str) -> Result<ParsedHint, PhaseError> {
    let json: Value = serde_json::from_str(content)
        .map_err(|e| PhaseError::ResponseParse(format!("hint: {}", e)))?;

    let explanation = json
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let hint = json
        .get("hint")
        .and_then(Value::as_str)
        .ok_or_else(|| PhaseError::ResponseParse("hint: missing \"hint\" field".to_string()))?;

    Ok(ParsedHint {
        explanation: strip_marker(explanation, "(1)").to_string(),
        hint: strip_marker(hint, "(2)").to_string(),
    })
}

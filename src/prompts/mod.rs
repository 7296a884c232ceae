//! LLM prompts for the hint pipeline.
//!
//! - [`enhancement`] - Prompts asking for repaired or optimized program variants
//! - [`hint`] - Prompts asking for the final pedagogical hint, and its parser
//!
//! # Usage
//!
//! ```ignore
//! use hint_forge::models::Modification;
//! use hint_forge::prompts::{build_enhancement_prompt, parse_enhanced_program};
//!
//! let prompt = build_enhancement_prompt(Modification::Repair, program, description, None);
//! let response = llm.generate(request_from(prompt.to_messages())).await?;
//! let variant = parse_enhanced_program(response.first_content().unwrap_or(""), Modification::Repair)?;
//! ```

pub mod enhancement;
pub mod hint;

pub use enhancement::{build_enhancement_prompt, parse_enhanced_program, EnhancementPrompt};
pub use hint::{
    build_hint_prompt, parse_hint_response, reflection_is_substantial, HintPrompt,
    HintPromptInput, ParsedHint,
};

/// Starter-code section shared by both prompts; empty when there is no template.
fn template_section(template_code: Option<&str>) -> String {
    match template_code {
        Some(code) if !code.is_empty() => {
            format!("Starter template code:\n```\n{}\n```\n\n", code)
        }
        _ => String::new(),
    }
}

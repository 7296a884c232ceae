//! hint-forge: queue-driven pipeline that turns student programs into
//! pedagogical LLM hints.
//!
//! A request is processed by independent phases exchanging tasks through a
//! priority queue. The store decides, under a per-request lock, when every
//! input has arrived, so exactly one hint generation is triggered per request.

// Core modules
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod intake;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod phases;
pub mod prompts;
pub mod readiness;
pub mod scheduler;
pub mod selection;
pub mod storage;

// Re-export commonly used types
pub use config::{AiConfig, HintConfig, TaskPriorities};
pub use error::{CollaboratorError, ErrorReport, LlmError, PhaseError};
pub use phases::PhaseContext;

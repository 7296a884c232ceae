//! Error types shared across the hint pipeline.
//!
//! Subsystem errors live next to their subsystem (`StoreError`, `QueueError`,
//! `ConfigError`); this module holds the collaborator errors and the
//! phase-level [`PhaseError`] that the dispatcher classifies:
//! - duplicate key: the effect already exists, nothing to redo
//! - not found, unknown task type, invalid payload: never retried
//! - transport, rate limit, timeout and data-integrity mismatches: retried
//!
//! [`ErrorReport`] is the structured form of a failure (kind, message and
//! cause chain). It is rendered to text only when a failure hint is written.

use std::fmt;

use thiserror::Error;

use crate::scheduler::queue::QueueError;
use crate::storage::StoreError;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Returns true for failures worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::Timeout(_) | LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            LlmError::MissingApiBase | LlmError::ParseError(_) => false,
        }
    }
}

/// Errors raised by the execution, problem query and delivery services.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The service could not be reached or the connection dropped.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The referenced entity does not exist on the service.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service reported a failure.
    #[error("Backend error ({status}): {detail}")]
    Backend { status: u16, detail: String },

    /// The service did not finish in time.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CollaboratorError::Protocol(err.to_string())
        } else {
            CollaboratorError::Transport(err.to_string())
        }
    }
}

/// Failure of a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The task's `data` does not match what the phase expects.
    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    /// The LLM returned a different number of variants than requested.
    #[error("Expected {expected} enhanced programs, got {actual}")]
    VariantCountMismatch { expected: usize, actual: usize },

    /// An LLM response could not be parsed into the expected JSON shape.
    #[error("Could not parse LLM response: {0}")]
    ResponseParse(String),
}

impl PhaseError {
    /// Stable snake_case name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            PhaseError::Store(StoreError::DuplicateKey(_)) => "duplicate_key",
            PhaseError::Store(StoreError::NotFound(_)) => "not_found",
            PhaseError::Store(_) => "store",
            PhaseError::Queue(_) => "queue",
            PhaseError::Llm(_) => "llm",
            PhaseError::Collaborator(CollaboratorError::NotFound(_)) => "not_found",
            PhaseError::Collaborator(_) => "collaborator",
            PhaseError::InvalidPayload(_) => "invalid_payload",
            PhaseError::UnknownTaskType(_) => "unknown_task_type",
            PhaseError::VariantCountMismatch { .. } => "variant_count_mismatch",
            PhaseError::ResponseParse(_) => "response_parse",
        }
    }

    /// Returns true if the effect of the task already exists.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, PhaseError::Store(StoreError::DuplicateKey(_)))
    }

    /// Returns true if republishing the task may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PhaseError::Store(err) => err.is_transient(),
            PhaseError::Queue(_) => true,
            PhaseError::Llm(err) => !matches!(err, LlmError::MissingApiBase),
            PhaseError::Collaborator(CollaboratorError::NotFound(_)) => false,
            PhaseError::Collaborator(_) => true,
            PhaseError::InvalidPayload(_) | PhaseError::UnknownTaskType(_) => false,
            PhaseError::VariantCountMismatch { .. } | PhaseError::ResponseParse(_) => true,
        }
    }
}

/// Structured description of a failure: its class, its message and the
/// messages of every underlying cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    pub causes: Vec<String>,
}

impl ErrorReport {
    /// Builds a report by walking the `source()` chain of `error`.
    ///
    /// A cause whose text is already contained in the previous entry is
    /// skipped, since wrapper errors usually embed their source's message.
    pub fn new(kind: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let message = error.to_string();
        let mut causes: Vec<String> = Vec::new();
        let mut current = error.source();

        while let Some(cause) = current {
            let text = cause.to_string();
            let previous = causes.last().unwrap_or(&message);
            if !previous.contains(&text) {
                causes.push(text);
            }
            current = cause.source();
        }

        Self {
            kind: kind.into(),
            message,
            causes,
        }
    }

    /// Builds a report for a phase failure, classified by [`PhaseError::kind`].
    pub fn from_phase_error(error: &PhaseError) -> Self {
        Self::new(error.kind(), error)
    }

    /// A report with no underlying error value.
    pub fn message(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Renders the report as human-readable text.
    pub fn render(&self) -> String {
        let mut text = format!("{}: {}", self.kind, self.message);
        for cause in &self.causes {
            text.push_str("\ncaused by: ");
            text.push_str(cause);
        }
        text
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("socket closed")]
    struct SocketClosed;

    #[derive(Debug, Error)]
    #[error("sandbox unreachable")]
    struct Unreachable(#[source] SocketClosed);

    #[test]
    fn test_llm_error_transient() {
        assert!(LlmError::RateLimited("slow down".to_string()).is_transient());
        assert!(LlmError::Timeout("30s".to_string()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!LlmError::ParseError("eof".to_string()).is_transient());
    }

    #[test]
    fn test_phase_error_classification() {
        let duplicate = PhaseError::Store(StoreError::DuplicateKey("hint 7".to_string()));
        assert_eq!(duplicate.kind(), "duplicate_key");
        assert!(duplicate.is_duplicate_key());
        assert!(!duplicate.is_retryable());

        let missing = PhaseError::Store(StoreError::NotFound("request 7".to_string()));
        assert_eq!(missing.kind(), "not_found");
        assert!(!missing.is_retryable());

        let problem = PhaseError::Collaborator(CollaboratorError::NotFound("p1".to_string()));
        assert_eq!(problem.kind(), "not_found");
        assert!(!problem.is_retryable());

        let transport = PhaseError::Collaborator(CollaboratorError::Transport("reset".to_string()));
        assert!(transport.is_retryable());

        let mismatch = PhaseError::VariantCountMismatch {
            expected: 5,
            actual: 4,
        };
        assert_eq!(mismatch.kind(), "variant_count_mismatch");
        assert!(mismatch.is_retryable());

        let unknown = PhaseError::UnknownTaskType("return_hint".to_string());
        assert!(!unknown.is_retryable());
        assert!(unknown.to_string().contains("return_hint"));
    }

    #[test]
    fn test_error_report_walks_causes() {
        let err = Unreachable(SocketClosed);
        let report = ErrorReport::new("collaborator", &err);

        assert_eq!(report.kind, "collaborator");
        assert_eq!(report.message, "sandbox unreachable");
        assert_eq!(report.causes, vec!["socket closed".to_string()]);
        assert_eq!(
            report.render(),
            "collaborator: sandbox unreachable\ncaused by: socket closed"
        );
    }

    #[test]
    fn test_error_report_skips_repeated_cause() {
        let err = PhaseError::Llm(LlmError::RateLimited("quota".to_string()));
        let report = ErrorReport::from_phase_error(&err);

        assert_eq!(report.kind, "llm");
        assert!(report.message.contains("quota"));
        assert!(report.causes.is_empty());
    }

    #[test]
    fn test_error_report_without_source() {
        let report = ErrorReport::message("invalid_payload", "missing request_id");
        assert_eq!(report.render(), "invalid_payload: missing request_id");
    }
}

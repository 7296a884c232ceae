//! Task messages exchanged through the queue.
//!
//! A task is the JSON object `{"type": <phase>, "tries": <n>, "data": {...}}`.
//! The `type` stays a plain string on the wire so that a message naming an
//! unknown phase still deserializes and can be failed terminally by the
//! dispatcher instead of being lost.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PhaseError;

/// The six pipeline phases a task can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    RunStudentProgram,
    GenerateEnhancedPrograms,
    RunEnhancedProgram,
    AddReflection,
    GenerateHint,
    DeliverHint,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::RunStudentProgram,
        TaskKind::GenerateEnhancedPrograms,
        TaskKind::RunEnhancedProgram,
        TaskKind::AddReflection,
        TaskKind::GenerateHint,
        TaskKind::DeliverHint,
    ];

    /// Wire name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RunStudentProgram => "run_student_program",
            TaskKind::GenerateEnhancedPrograms => "generate_enhanced_programs",
            TaskKind::RunEnhancedProgram => "run_enhanced_program",
            TaskKind::AddReflection => "add_reflection",
            TaskKind::GenerateHint => "generate_hint",
            TaskKind::DeliverHint => "deliver_hint",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PhaseError::UnknownTaskType(s.to_string()))
    }
}

/// A task as carried by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(rename = "type")]
    pub task_type: String,
    /// Delivery attempt number, starting at 1 for a fresh task.
    pub tries: u32,
    pub data: Value,
}

impl TaskMessage {
    /// Creates a fresh task (`tries = 1`).
    pub fn new(kind: TaskKind, data: Value) -> Self {
        Self {
            task_type: kind.as_str().to_string(),
            tries: 1,
            data,
        }
    }

    /// Resolves the phase this task triggers.
    pub fn kind(&self) -> Result<TaskKind, PhaseError> {
        self.task_type.parse()
    }

    /// The same task with the attempt counter incremented.
    pub fn retry(&self) -> Self {
        Self {
            task_type: self.task_type.clone(),
            tries: self.tries + 1,
            data: self.data.clone(),
        }
    }

    /// Deserializes `data` into the phase's payload type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PhaseError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            PhaseError::InvalidPayload(format!("{} task: {}", self.task_type, e))
        })
    }

    /// The `request_id` field of `data`, when the payload carries one.
    pub fn request_id(&self) -> Option<i64> {
        self.data.get("request_id").and_then(Value::as_i64)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload of tasks addressed to a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub request_id: i64,
}

/// Payload of `run_enhanced_program`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedProgramPayload {
    pub enhanced_program_id: i64,
}

/// Payload of `add_reflection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionPayload {
    pub request_id: i64,
    pub reflection_question: String,
    pub reflection_answer: String,
}

/// A dequeued message, kept verbatim so it can be acknowledged exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The payload exactly as stored in the queue.
    pub raw: String,
    /// Priority level it was delivered from.
    pub priority: u8,
}

impl Delivery {
    pub fn new(raw: impl Into<String>, priority: u8) -> Self {
        Self {
            raw: raw.into(),
            priority,
        }
    }

    /// Parses the raw payload as a task message.
    pub fn message(&self) -> Result<TaskMessage, serde_json::Error> {
        serde_json::from_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_kind_names() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert_eq!(TaskKind::DeliverHint.to_string(), "deliver_hint");
    }

    #[test]
    fn test_unknown_task_type() {
        let err = "compile_program".parse::<TaskKind>().unwrap_err();
        assert!(matches!(err, PhaseError::UnknownTaskType(ref t) if t == "compile_program"));
    }

    #[test]
    fn test_wire_format() {
        let message = TaskMessage::new(TaskKind::GenerateHint, json!({"request_id": 7}));
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "generate_hint", "tries": 1, "data": {"request_id": 7}})
        );
    }

    #[test]
    fn test_unknown_type_still_deserializes() {
        let delivery = Delivery::new(r#"{"type":"bogus","tries":2,"data":{"request_id":3}}"#, 1);
        let message = delivery.message().unwrap();
        assert!(message.kind().is_err());
        assert_eq!(message.request_id(), Some(3));
        assert_eq!(message.tries, 2);
    }

    #[test]
    fn test_retry_increments_tries_only() {
        let message = TaskMessage::new(TaskKind::RunEnhancedProgram, json!({"enhanced_program_id": 9}));
        let retried = message.retry().retry();
        assert_eq!(retried.tries, 3);
        assert_eq!(retried.task_type, message.task_type);
        assert_eq!(retried.data, message.data);
    }

    #[test]
    fn test_payload_parsing() {
        let message = TaskMessage::new(
            TaskKind::AddReflection,
            json!({
                "request_id": 5,
                "reflection_question": "What went wrong?",
                "reflection_answer": "the loop bound"
            }),
        );
        let payload: ReflectionPayload = message.payload().unwrap();
        assert_eq!(payload.request_id, 5);
        assert_eq!(payload.reflection_answer, "the loop bound");

        let err = message.payload::<EnhancedProgramPayload>().unwrap_err();
        assert!(matches!(err, PhaseError::InvalidPayload(_)));
    }
}

//! External services the pipeline depends on.
//!
//! - **ProgramExecutor**: runs a program against a problem's test cases
//! - **ProblemQuery**: fetches a problem's description and starter template
//! - **HintDelivery**: posts the finished hint back to the caller-facing backend
//!
//! Each has an HTTP implementation; tests substitute their own.

pub mod delivery;
pub mod execution;
pub mod problems;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CollaboratorError;
use crate::models::{ProgramRun, TraceData};

pub use delivery::HttpHintDelivery;
pub use execution::HttpProgramExecutor;
pub use problems::HttpProblemQuery;

/// Runs programs in the execution sandbox.
#[async_trait]
pub trait ProgramExecutor: Send + Sync {
    /// Runs `program` on the test cases of `problem_id` and waits for the verdict.
    async fn run_program(&self, problem_id: &str, program: &str)
        -> Result<ProgramRun, CollaboratorError>;
}

/// Description of a programming problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDetails {
    pub description: String,
    /// Starter code handed to students, if the problem has any.
    pub template_code: Option<String>,
}

#[async_trait]
pub trait ProblemQuery: Send + Sync {
    async fn task_details(&self, problem_id: &str) -> Result<TaskDetails, CollaboratorError>;
}

/// Body posted to the caller-facing backend once a request is finished.
#[derive(Debug, Clone, Serialize)]
pub struct HintResult {
    pub request_id: i64,
    pub hint: String,
    pub job_finished_successfully: bool,
    pub generation_error_message: Option<String>,
    pub other_hint_data: TraceData,
}

#[async_trait]
pub trait HintDelivery: Send + Sync {
    async fn post_result(&self, result: &HintResult) -> Result<(), CollaboratorError>;
}

/// Turns a non-success HTTP answer into a backend error, keeping the
/// `detail` or `error` field of a JSON body when there is one.
pub(crate) async fn backend_error(response: reqwest::Response) -> CollaboratorError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    let detail = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|json| {
            json.get("detail")
                .or_else(|| json.get("error"))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        })
        .unwrap_or(body);

    CollaboratorError::Backend { status, detail }
}

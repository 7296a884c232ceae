//! HTTP client for the execution sandbox.
//!
//! Execution is asynchronous on the server side: a submission returns an
//! `execution_id`, and the result endpoint is polled until it reports
//! `job_finished`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{backend_error, ProgramExecutor};
use crate::config::HintConfig;
use crate::error::CollaboratorError;
use crate::models::ProgramRun;

#[derive(Debug, Deserialize)]
struct Submission {
    execution_id: Value,
}

/// [`ProgramExecutor`] backed by the problem handler's execution API.
pub struct HttpProgramExecutor {
    client: Client,
    execute_url: String,
    result_url: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl HttpProgramExecutor {
    pub fn new(
        execute_url: impl Into<String>,
        result_url: impl Into<String>,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            execute_url: execute_url.into(),
            result_url: result_url.into(),
            poll_interval,
            max_wait,
        }
    }

    pub fn from_config(config: &HintConfig) -> Self {
        Self::new(
            config.execution_url.clone(),
            config.execution_result_url.clone(),
            config.execution_poll_interval,
            config.execution_max_wait,
        )
    }

    async fn submit(&self, problem_id: &str, program: &str) -> Result<Value, CollaboratorError> {
        let response = self
            .client
            .post(&self.execute_url)
            .json(&json!({
                "problem_id": problem_id,
                "student_program": program,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response).await);
        }

        let submission: Submission = response.json().await?;
        Ok(submission.execution_id)
    }

    async fn poll(&self, execution_id: &Value) -> Result<Value, CollaboratorError> {
        let id = match execution_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let response = self
            .client
            .get(&self.result_url)
            .query(&[("execution_id", id)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response).await);
        }

        Ok(response.json().await?)
    }
}

/// Interprets one poll answer: `None` while the job is still running.
fn parse_execution_result(data: &Value) -> Result<Option<ProgramRun>, CollaboratorError> {
    if !data
        .get("job_finished")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(None);
    }

    // `"error": null` is sent by services that always serialize the field
    if let Some(error) = data.get("error").filter(|error| !error.is_null()) {
        return Err(CollaboratorError::Protocol(format!(
            "Execution error: {}",
            error
        )));
    }

    let (Some(correctness), Some(output), Some(elapsed)) = (
        data.get("correctness"),
        data.get("buggy_output"),
        data.get("elapsed_time"),
    ) else {
        return Err(CollaboratorError::Protocol(format!(
            "Missing expected fields in response: {}",
            data
        )));
    };

    Ok(Some(ProgramRun {
        correct: correctness.as_bool().unwrap_or(false),
        output: match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        elapsed_seconds: elapsed.as_f64().unwrap_or(0.0),
    }))
}

#[async_trait]
impl ProgramExecutor for HttpProgramExecutor {
    async fn run_program(
        &self,
        problem_id: &str,
        program: &str,
    ) -> Result<ProgramRun, CollaboratorError> {
        let started = Instant::now();
        let execution_id = self.submit(problem_id, program).await?;

        loop {
            let data = self.poll(&execution_id).await?;
            if let Some(run) = parse_execution_result(&data)? {
                tracing::info!(
                    problem_id = problem_id,
                    correct = run.correct,
                    elapsed_secs = run.elapsed_seconds,
                    "Remote execution finished"
                );
                return Ok(run);
            }

            if started.elapsed() >= self.max_wait {
                return Err(CollaboratorError::Timeout(self.max_wait));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

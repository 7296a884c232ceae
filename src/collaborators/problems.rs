//! HTTP client for the problem query endpoint.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{backend_error, ProblemQuery, TaskDetails};
use crate::error::CollaboratorError;

/// [`ProblemQuery`] backed by the orchestration backend's problem endpoint.
pub struct HttpProblemQuery {
    client: Client,
    url: String,
}

impl HttpProblemQuery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

fn parse_task_details(problem_id: &str, data: &Value) -> Result<TaskDetails, CollaboratorError> {
    let Some(description) = data.get("task_description").and_then(Value::as_str) else {
        let detail = data.get("task_description_error").unwrap_or(data);
        return Err(CollaboratorError::Protocol(format!(
            "Task description missing for {}: {}",
            problem_id, detail
        )));
    };

    Ok(TaskDetails {
        description: description.to_string(),
        template_code: data
            .get("template_code")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl ProblemQuery for HttpProblemQuery {
    async fn task_details(&self, problem_id: &str) -> Result<TaskDetails, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("problem_id", problem_id)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CollaboratorError::NotFound(format!(
                "problem {}",
                problem_id
            )));
        }
        if !response.status().is_success() {
            return Err(backend_error(response).await);
        }

        let data: Value = response.json().await?;
        parse_task_details(problem_id, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_with_template() {
        let details = parse_task_details(
            "sum_two_numbers",
            &json!({"task_description": "Add a and b.", "template_code": "def add(a, b):\n    pass"}),
        )
        .unwrap();

        assert_eq!(details.description, "Add a and b.");
        assert_eq!(details.template_code.as_deref(), Some("def add(a, b):\n    pass"));
    }

    #[test]
    fn test_non_string_template_is_none() {
        let details =
            parse_task_details("p", &json!({"task_description": "d", "template_code": 42})).unwrap();
        assert_eq!(details.template_code, None);
    }

    #[test]
    fn test_missing_description() {
        let err = parse_task_details("p", &json!({"task_description_error": "no such file"}))
            .unwrap_err();
        assert!(err.to_string().contains("no such file"));
    }
}

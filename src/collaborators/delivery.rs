//! HTTP client that hands finished hints back to the caller-facing backend.

use async_trait::async_trait;
use reqwest::Client;

use super::{backend_error, HintDelivery, HintResult};
use crate::error::CollaboratorError;

pub struct HttpHintDelivery {
    client: Client,
    url: String,
}

impl HttpHintDelivery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl HintDelivery for HttpHintDelivery {
    async fn post_result(&self, result: &HintResult) -> Result<(), CollaboratorError> {
        let response = self.client.post(&self.url).json(result).send().await?;

        if !response.status().is_success() {
            let err = backend_error(response).await;
            tracing::error!(
                request_id = result.request_id,
                error = %err,
                "Failed to deliver hint"
            );
            return Err(err);
        }

        Ok(())
    }
}

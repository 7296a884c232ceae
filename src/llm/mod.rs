//! LLM integration for hint-forge.
//!
//! The phases talk to the model through the [`LlmProvider`] trait; the
//! production implementation is [`LiteLlmClient`], an OpenAI-compatible
//! chat completions client with internal retries.
//!
//! ```ignore
//! use hint_forge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_config(&config)?;
//! let request = GenerationRequest::new("gpt-5", vec![Message::user("Fix this program")])
//!     .with_n(5)
//!     .with_json_response();
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message,
    ResponseFormat, Usage,
};

//! Text generation providers.
//!
//! [`GenerationProvider`] is the seam between the synthesizer and whatever
//! model serves it. [`OpenAiCompatProvider`] speaks the OpenAI-compatible
//! chat completions API; [`MockGenerationProvider`] serves queued responses
//! for tests and offline development.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::TokenUsage;

/// One completed generation: the raw model text plus token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub usage: TokenUsage,
}

impl GenerationOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// A model endpoint that turns a system/user prompt pair into text.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Run one generation. Implementations map their transport failures
    /// onto [`ProviderError`]; retry policy lives in the gateway, not here.
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GenerationOutput, ProviderError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP provider
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Chat completions over any OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatProvider {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GenerationOutput, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.1,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout { timeout_ms: 0 }
                } else {
                    ProviderError::Unavailable {
                        message: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth {
                provider: self.model.clone(),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ProviderError::Unavailable {
                message: format!("status {status}"),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response.json().await.map_err(|err| ProviderError::Malformed {
            message: err.to_string(),
        })?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed {
                message: "response contained no choices".to_string(),
            })?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        debug!(model = %self.model, chars = text.len(), "generation complete");
        Ok(GenerationOutput { text, usage })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Serves queued responses in FIFO order; errors when the queue runs dry.
///
/// Records every prompt pair it receives so tests can assert on prompt
/// construction.
pub struct MockGenerationProvider {
    responses: Mutex<Vec<Result<GenerationOutput, ProviderError>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl MockGenerationProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a text response for one of the next `generate` calls.
    pub fn queue_text(&self, text: &str) {
        self.queue(Ok(GenerationOutput::text(text)));
    }

    pub fn queue_error(&self, error: ProviderError) {
        self.queue(Err(error));
    }

    pub fn queue(&self, response: Result<GenerationOutput, ProviderError>) {
        self.responses.lock().unwrap().push(response);
    }

    /// Every (system, user) prompt pair seen so far.
    pub fn recorded_prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for MockGenerationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationProvider for MockGenerationProvider {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GenerationOutput, ProviderError> {
        self.prompts
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_prompt.to_string()));

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(ProviderError::Unavailable {
                message: "mock response queue is empty".to_string(),
            });
        }
        responses.remove(0)
    }

    fn name(&self) -> &str {
        "mock-model"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_serves_responses_in_order() {
        let provider = MockGenerationProvider::new();
        provider.queue_text("first");
        provider.queue_text("second");

        let a = provider.generate("sys", "one").await.unwrap();
        let b = provider.generate("sys", "two").await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.recorded_prompts()[1].1, "two");
    }

    #[tokio::test]
    async fn mock_errors_when_queue_is_empty() {
        let provider = MockGenerationProvider::new();
        let err = provider.generate("sys", "query").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn mock_replays_queued_errors() {
        let provider = MockGenerationProvider::new();
        provider.queue_error(ProviderError::Malformed {
            message: "bad".into(),
        });
        let err = provider.generate("sys", "query").await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }
}

/// Reasoning capability used by the arbiter and the verification gate.
///
/// Both callers only need "send a system prompt and one user message, get text back".
/// Model selection is configuration: each caller gets its own `ChatReasoner` bound to a
/// model name, so the verifier never shares a model with the SQL generator.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CommonError;
use crate::openai::{ChatCompletionRequest, Message, OpenAiClient};
use crate::usage::UsageTracker;

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_content: &str) -> Result<String, CommonError>;

    /// Model identifier, reported in logs and verdict metadata.
    fn model(&self) -> &str;
}

/// `Reasoner` backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatReasoner {
    client: Arc<OpenAiClient>,
    model: String,
    temperature: f32,
    request_timeout: Option<Duration>,
    usage: Option<UsageTracker>,
}

impl ChatReasoner {
    pub fn new(client: Arc<OpenAiClient>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            client,
            model: model.into(),
            temperature,
            request_timeout: None,
            usage: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_usage(mut self, usage: UsageTracker) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[async_trait]
impl Reasoner for ChatReasoner {
    async fn complete(&self, system_prompt: &str, user_content: &str) -> Result<String, CommonError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::system(system_prompt), Message::user(user_content)],
            temperature: Some(self.temperature),
            max_tokens: None,
        };

        let response = self
            .client
            .chat_completions(&request, self.request_timeout)
            .await
            .map_err(|e| CommonError::Reasoning(format!("{} call failed: {e}", self.model)))?;

        if let Some(usage) = &self.usage {
            usage.record(&self.model, response.usage.as_ref()).await;
        }

        let text = response
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| CommonError::Reasoning(format!("{} returned no content", self.model)))?;
        debug!(model = %self.model, chars = text.len(), "reasoning completion received");
        Ok(text)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

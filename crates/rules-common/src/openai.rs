/// OpenAI-compatible `/chat/completions` client for the arbiter and verifier models.
///
/// Transient failures (transport errors, 429, 5xx) are retried with capped exponential
/// backoff. Callers put their own hard deadline around each call.
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenAiClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-request timeout used when the caller does not pass one.
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    /// Error bodies longer than this are cut before being reported.
    pub max_error_body_bytes: usize,
}

impl OpenAiClientConfig {
    /// Read `OPENAI_*` variables. Absent or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let number = |name: &str, default: u64| {
            text(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            base_url: text("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: text("OPENAI_API_KEY"),
            default_timeout: Duration::from_secs(number("OPENAI_TIMEOUT_SECS", 30)),
            retry: RetryPolicy {
                max_retries: number("OPENAI_MAX_RETRIES", 3) as u32,
                initial_backoff: Duration::from_millis(number("OPENAI_RETRY_INITIAL_MS", 200)),
                max_backoff: Duration::from_millis(number("OPENAI_RETRY_MAX_MS", 5_000)),
            },
            max_error_body_bytes: number("OPENAI_MAX_ERROR_BODY_BYTES", 8 * 1024) as usize,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenAiClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream status {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl OpenAiClientError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Decode(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiClientConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiClientConfig) -> Result<Self, OpenAiClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("business-rules/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OpenAiClientConfig {
        &self.config
    }

    pub async fn chat_completions(
        &self,
        request: &ChatCompletionRequest,
        timeout: Option<Duration>,
    ) -> Result<ChatCompletionResponse, OpenAiClientError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let policy = &self.config.retry;

        let mut retry = 0;
        loop {
            match self.send_once(&url, request, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && retry < policy.max_retries => {
                    let delay = policy.delay(retry);
                    warn!(
                        model = %request.model,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "chat completion failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<ChatCompletionResponse, OpenAiClientError> {
        let mut builder = self.http.post(url).timeout(timeout).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            debug!(model = %request.model, bytes = body.len(), "chat completion received");
            return Ok(serde_json::from_slice(&body)?);
        }
        Err(OpenAiClientError::Status {
            status,
            message: error_message(&body, self.config.max_error_body_bytes),
        })
    }
}

/// The upstream `error.message` when the body carries one, else the raw body, cut short.
fn error_message(body: &[u8], max_bytes: usize) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: Detail,
    }
    #[derive(Deserialize)]
    struct Detail {
        message: Option<String>,
    }

    if let Some(message) = serde_json::from_slice::<Envelope>(body)
        .ok()
        .and_then(|e| e.error.message)
    {
        return message;
    }
    let cut = &body[..body.len().min(max_bytes)];
    String::from_utf8_lossy(cut).into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: Option<ChatCompletionUsage>,
}

impl ChatCompletionResponse {
    /// Text of the first choice, if the upstream returned any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first()?.message.content.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChoice {
    pub message: ChatCompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionMessage {
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn retry_delay_doubles_then_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(1_000),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(1_000));
        assert_eq!(policy.delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        let status = |status| OpenAiClientError::Status {
            status,
            message: String::new(),
        };
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status(StatusCode::UNAUTHORIZED).is_transient());
        assert!(!status(StatusCode::BAD_REQUEST).is_transient());
    }

    #[test]
    fn error_message_prefers_the_upstream_message() {
        let body = br#"{"error":{"message":"model not found","code":404}}"#;
        assert_eq!(error_message(body, 1024), "model not found");
        assert_eq!(error_message(b"<html>bad gateway</html>", 6), "<html>");
    }

    #[test]
    fn config_defaults_and_overrides() {
        let vars = HashMap::from([
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/".to_string()),
            ("OPENAI_MAX_RETRIES", "nope".to_string()),
            ("OPENAI_API_KEY", " ".to_string()),
        ]);
        let config = OpenAiClientConfig::from_lookup(|name| vars.get(name).cloned());
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.api_key, None);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn first_content_reads_the_first_choice() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"PASS"},"finish_reason":"stop"}],
                "usage":{"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(response.first_content(), Some("PASS"));
        assert_eq!(response.usage.and_then(|u| u.total_tokens), Some(12));

        let empty: ChatCompletionResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.first_content(), None);
    }
}

//! Completion backend: trait plus an OpenAI-compatible HTTP client.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BackendConfig;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty response")]
    Empty,
    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// One outbound completion call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Persona instruction, if a persona is active.
    pub system: Option<String>,
    /// Accumulated conversation, empty for a fresh session.
    pub context: String,
    pub prompt: String,
    /// Previous answer/thread id for this chat, 0 when none.
    pub thread_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// New thread id, when the backend supports threaded continuation.
    pub thread_id: Option<u64>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError>;

    /// Returns PNG bytes.
    async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, BackendError>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'static str,
    response_format: &'static str,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

/// OpenAI-compatible `/chat/completions` and `/images/generations` client.
pub struct OpenAiBackend {
    config: BackendConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<String, BackendError> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.config.timeout.as_secs())
                } else {
                    BackendError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        debug!("Backend {} -> {}", path, status);

        if !status.is_success() {
            return Err(BackendError::Api(format!("{status}: {text}")));
        }
        Ok(text)
    }
}

/// Split the stored context into the message list sent upstream.
fn build_messages(request: &CompletionRequest) -> Vec<ApiMessage<'_>> {
    let mut messages = Vec::with_capacity(3);
    if let Some(ref system) = request.system {
        messages.push(ApiMessage { role: "system", content: system });
    }
    if !request.context.is_empty() {
        messages.push(ApiMessage { role: "assistant", content: &request.context });
    }
    messages.push(ApiMessage { role: "user", content: &request.prompt });
    messages
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: build_messages(&request),
            max_tokens: self.config.max_tokens,
        };
        let text = self.post("/chat/completions", &body).await?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))?;

        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(BackendError::Empty)?;

        // The chat completions API has no server-side threads.
        Ok(Completion { text: answer, thread_id: None })
    }

    async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, BackendError> {
        info!("🎨 Generating image: {}", prompt);
        let body = ImageRequest {
            model: &self.config.image_model,
            prompt,
            n: 1,
            size: "1024x1024",
            response_format: "b64_json",
        };
        let text = self.post("/images/generations", &body).await?;
        let parsed: ImageResponse =
            serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))?;

        let encoded = parsed
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or(BackendError::Empty)?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BackendError::Parse(format!("failed to decode base64: {e}")))?;

        info!("🎨 Image generated: {} bytes", data.len());
        Ok(data)
    }
}

//! Model Provider Client
//!
//! Chat-completion client used by the provider-backed flow synthesizer. Any server
//! speaking the OpenAI `/chat/completions` protocol works (OpenAI, Azure OpenAI,
//! Ollama, local inference servers).

use crate::config::ProviderConfig;
use crate::error::CollaboratorError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Completion options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>, // 0.0-2.0
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: None,
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Chat-completion client trait
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Generate a completion from a list of messages
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, CollaboratorError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

// OpenAI-compatible API request/response structures
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

// Helper function to map HTTP errors to CollaboratorError
fn map_http_error(error: reqwest::Error) -> CollaboratorError {
    if let Some(status) = error.status() {
        map_status(status.as_u16(), &error.to_string())
    } else if error.is_timeout() {
        CollaboratorError::Transport(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        CollaboratorError::Transport(format!("Connection error: {}", error))
    } else {
        CollaboratorError::Transport(format!("HTTP error: {}", error))
    }
}

fn map_status(status: u16, detail: &str) -> CollaboratorError {
    match status {
        401 | 403 => CollaboratorError::Auth(format!("Authentication failed: {}", detail)),
        429 => CollaboratorError::Transport(format!("Rate limit exceeded: {}", detail)),
        404 => CollaboratorError::Transport(format!("Model not found: {}", detail)),
        _ => CollaboratorError::Transport(format!(
            "Request failed with status {}: {}",
            status, detail
        )),
    }
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn build_provider_http_client(request_timeout: Duration) -> Result<Client, CollaboratorError> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .map_err(|e| CollaboratorError::Transport(format!("Failed to create HTTP client: {}", e)))
}

/// OpenAI-compatible chat-completion client
pub struct OpenAICompatibleClient {
    client: Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAICompatibleClient {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = build_provider_http_client(request_timeout)?;
        let base_url = base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            model,
            api_key,
            base_url,
        })
    }

    /// Build from configuration, reading the API key from the configured
    /// environment variable. A missing key is allowed for local servers.
    pub fn from_config(
        config: &ProviderConfig,
        request_timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        Self::new(
            config.model.clone(),
            api_key,
            Some(config.base_url.clone()),
            request_timeout,
        )
    }
}

#[async_trait]
impl ChatClient for OpenAICompatibleClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, CollaboratorError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages
                .into_iter()
                .map(|msg| OpenAIMessage {
                    role: msg.role.as_str().to_string(),
                    content: msg.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status.as_u16(), &error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Malformed(format!("Failed to parse response: {}", e)))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CollaboratorError::Malformed("No choices in response".to_string()))?;

        debug!(
            model = %completion.model,
            finish_reason = ?choice.finish_reason,
            "Completion received"
        );

        Ok(CompletionResponse {
            content: choice.message.content,
            model: completion.model,
            usage: completion.usage.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }

    fn provider_name(&self) -> &str {
        "openai-compatible"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

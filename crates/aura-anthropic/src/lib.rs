//! Anthropic Claude completion provider.
//!
//! Implements the core [`CompletionModel`] trait over the Messages API.
//! Provider-level failures map into the core error taxonomy: 429 and
//! overload become `rate_limited`/`upstream_unavailable` (retryable, with
//! the `retry-after` hint attached), auth failures and refusals become
//! `non_retryable`, malformed requests become `invalid_input`.

use aura::{CompletionModel, CompletionRequest, CompletionResponse, Error, Result, Usage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Claude model names.
pub mod models {
    pub const CLAUDE_SONNET: &str = "claude-3-5-sonnet-latest";
    pub const CLAUDE_HAIKU: &str = "claude-3-5-haiku-latest";
}

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<WireContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Anthropic Messages API client implementing [`CompletionModel`].
#[derive(Clone)]
pub struct AnthropicCompletionModel {
    api_key: String,
    model: String,
    max_tokens: u32,
    api_url: String,
    api_version: String,
    http_client: reqwest::Client,
}

// Custom Debug to keep the API key out of logs.
impl std::fmt::Debug for AnthropicCompletionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicCompletionModel")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("api_url", &self.api_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl AnthropicCompletionModel {
    /// Build a client, loading the API key from `ANTHROPIC_API_KEY` when
    /// set.
    pub fn try_new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: std::env::var(API_KEY_ENV).unwrap_or_default(),
            model: models::CLAUDE_SONNET.to_string(),
            max_tokens: 1024,
            api_url: DEFAULT_API_URL.to_string(),
            api_version: "2023-06-01".to_string(),
            http_client,
        })
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point at a proxy or test server instead of the public endpoint.
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn map_http_error(status: reqwest::StatusCode, retry_after: Option<&str>, body: &str) -> Error {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let error_type = parsed
            .as_ref()
            .map(|e| e.error.error_type.as_str())
            .unwrap_or("unknown_error");
        let message = parsed
            .as_ref()
            .map(|e| e.error.message.as_str())
            .unwrap_or(body)
            .trim();
        let message = if message.is_empty() {
            "Unknown error"
        } else {
            message
        };

        let retry_after_hint = retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        match (status, error_type) {
            (reqwest::StatusCode::TOO_MANY_REQUESTS, _) | (_, "rate_limit_error") => {
                Error::rate_limited(message, retry_after_hint)
            }
            (reqwest::StatusCode::UNAUTHORIZED, _)
            | (reqwest::StatusCode::FORBIDDEN, _)
            | (_, "authentication_error")
            | (_, "permission_error") => Error::non_retryable(format!("authentication: {message}")),
            (reqwest::StatusCode::BAD_REQUEST, _)
            | (reqwest::StatusCode::NOT_FOUND, _)
            | (reqwest::StatusCode::PAYLOAD_TOO_LARGE, _)
            | (_, "invalid_request_error")
            | (_, "not_found_error")
            | (_, "request_too_large") => Error::invalid_input(message),
            (_, "overloaded_error") => Error::unavailable(message),
            _ if status.is_server_error() => Error::unavailable(message),
            _ => Error::non_retryable(format!("Anthropic API error ({status}): {message}")),
        }
    }
}

#[async_trait::async_trait]
impl CompletionModel for AnthropicCompletionModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if self.api_key.is_empty() {
            return Err(Error::non_retryable(
                "API key is required. Set it with with_api_key() or the ANTHROPIC_API_KEY environment variable",
            ));
        }

        let wire_request = MessagesRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            messages: vec![WireMessage {
                role: "user",
                content: request.prompt.clone(),
            }],
            temperature: request.temperature,
            stop_sequences: request.stop.clone(),
        };

        let response = self
            .http_client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("HTTP request timed out: {e}"))
                } else if e.is_connect() {
                    Error::unavailable(format!("connection failed: {e}"))
                } else {
                    Error::transient(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, retry_after.as_deref(), &body));
        }

        let wire_response: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("failed to parse response: {e}")))?;

        let text = wire_response
            .content
            .iter()
            .filter_map(|block| match block {
                WireContentBlock::Text { text } => Some(text.as_str()),
                WireContentBlock::Unknown => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            text,
            model: wire_response.model,
            usage: Some(Usage {
                input_tokens: wire_response.usage.input_tokens,
                output_tokens: wire_response.usage.output_tokens,
            }),
            finish_reason: wire_response.stop_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "anthropic"
    }
}

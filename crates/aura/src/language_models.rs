// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Completion-model abstraction.
//!
//! Providers implement [`CompletionModel`]; callers go through
//! [`LlmClient`](crate::llm::LlmClient), which layers caching, retry,
//! timeout, and batching on top. Provider crates map their wire errors into
//! the core taxonomy so retryability classification is uniform.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A single completion request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The full prompt text.
    pub prompt: String,
    /// Model override; provider default when `None`.
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Token cap for the response.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Stop sequences.
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    /// A request with only a prompt, provider defaults for everything else.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            temperature: None,
            max_tokens: None,
            stop: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage reported by a provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A completion response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub text: String,
    /// Model that produced the response.
    pub model: String,
    /// Token usage, when the provider reports it.
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Why generation stopped ("end_turn", "max_tokens", ...).
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// A text-completion provider.
#[async_trait::async_trait]
pub trait CompletionModel: Send + Sync {
    /// Execute one completion call against the provider.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Default model name used when the request does not override it.
    fn model_name(&self) -> &str;

    /// Short provider identifier ("anthropic", "mock", ...).
    fn provider(&self) -> &str;
}

/// Scripted in-process model for tests and offline development.
///
/// Responses are served round-robin from the configured script; a `Result`
/// per entry lets tests exercise failure paths. Calls are counted so tests
/// can assert exactly-once execution.
pub struct MockCompletionModel {
    script: parking_lot::Mutex<Vec<Result<String>>>,
    fallback: String,
    model: String,
    calls: AtomicUsize,
}

impl MockCompletionModel {
    /// A model that always answers with `text`.
    pub fn answering(text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            script: parking_lot::Mutex::new(Vec::new()),
            fallback: text.into(),
            model: "mock-model".to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    /// A model that plays back `script` in order, then falls back to a
    /// canned answer.
    pub fn scripted(script: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            script: parking_lot::Mutex::new(script),
            fallback: "mock response".to_string(),
            model: "mock-model".to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of `complete` calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CompletionModel for MockCompletionModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.script.lock();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        let text = match next {
            Some(entry) => entry?,
            None => self.fallback.clone(),
        };
        Ok(CompletionResponse {
            text,
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            usage: Some(Usage {
                input_tokens: request.prompt.len() as u32 / 4,
                output_tokens: 16,
            }),
            finish_reason: Some("end_turn".to_string()),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn mock_model_plays_script_then_fallback() {
        let model = MockCompletionModel::scripted(vec![
            Ok("first".to_string()),
            Err(Error::transient("blip")),
        ]);

        let request = CompletionRequest::new("hello");
        assert_eq!(model.complete(&request).await.unwrap().text, "first");
        assert!(model.complete(&request).await.is_err());
        assert_eq!(model.complete(&request).await.unwrap().text, "mock response");
        assert_eq!(model.call_count(), 3);
    }

    #[test]
    fn request_builder() {
        let request = CompletionRequest::new("p")
            .with_model("m")
            .with_temperature(0.3)
            .with_max_tokens(128);
        assert_eq!(request.model.as_deref(), Some("m"));
        assert_eq!(request.max_tokens, Some(128));
    }
}

//! Inference Backend Traits
//!
//! The worker only needs two things from a model server: a complete answer
//! for unary tasks and a token stream for streaming tasks. Implementations
//! handle provider-specific details (endpoints, prompt templates, framing).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Token stream events from LLM backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A fragment of the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message (may differ from concatenated tokens)
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

/// A prompt to run against a backend
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// The prompt text
    pub prompt: String,
    /// Whether the response will be streamed
    pub stream: bool,
    /// Maximum tokens to predict (0 = backend default)
    pub max_tokens: u32,
    /// Sampling temperature, if overriding the server default
    pub temperature: Option<f32>,
}

impl LlmRequest {
    /// Create a request for `prompt`
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stream: false,
            max_tokens: 0,
            temperature: None,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }
}

/// Response from a non-streaming request
#[derive(Clone, Debug)]
pub struct LlmResponse {
    /// The response text
    pub content: String,
    /// Tokens predicted (if reported)
    pub tokens_used: Option<u32>,
    /// Generation time in milliseconds
    pub duration_ms: Option<u64>,
}

/// LLM Backend trait
///
/// Any error returned here is treated by the worker as a task-local
/// failure and reported to the caller; it never stops the worker.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Run the prompt to completion
    async fn generate(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse>;

    /// Run the prompt and receive tokens as they are produced
    ///
    /// The channel closes after `Complete` or `Error`, or when the backend
    /// stops producing.
    async fn generate_stream(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;
}

/// Connection settings for the llama.cpp backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8080`
    pub url: String,
    /// Default `n_predict` for requests that do not set one
    pub max_tokens: u32,
    /// Whole-request timeout
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            max_tokens: 512,
            request_timeout_secs: 120,
        }
    }
}

impl BackendConfig {
    /// Request timeout as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

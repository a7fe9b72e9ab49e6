//! llama.cpp Backend Implementation
//!
//! LLM backend for the llama.cpp HTTP server.
//!
//! # llama.cpp API
//!
//! - `POST /completion` - Complete a prompt (batch, or server-sent events
//!   when `"stream": true`)
//! - `GET /health` - Server readiness
//!
//! Prompts are wrapped in the ChatML template the served models expect.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::traits::{BackendConfig, LlmBackend, LlmRequest, LlmResponse, StreamingToken};

/// llama.cpp server client
#[derive(Clone)]
pub struct LlamaCppBackend {
    /// Server settings
    config: BackendConfig,
    /// HTTP client
    http_client: reqwest::Client,
}

/// One parsed server-sent event from a streaming completion
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    /// Generated text, possibly empty, and whether generation stopped
    Content { content: String, stop: bool },
    /// Server reported an error inside the stream
    Failed(String),
}

/// Splits a byte stream into lines, decoding each line only once it is whole
/// so multibyte characters cut across network chunks survive intact
#[derive(Debug, Default)]
struct SseLineBuffer {
    bytes: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Next complete line including its newline, if one has arrived
    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl LlamaCppBackend {
    /// Create a backend for the given server
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            config,
            http_client,
        }
    }

    /// Get completion endpoint URL
    fn completion_url(&self) -> String {
        format!("{}/completion", self.config.url.trim_end_matches('/'))
    }

    /// Get health endpoint URL
    fn health_url(&self) -> String {
        format!("{}/health", self.config.url.trim_end_matches('/'))
    }

    /// Wrap the prompt in the ChatML template
    fn build_prompt(prompt: &str) -> String {
        format!("<|im_start|>user\n{prompt}\n<|im_end|>\n<|im_start|>assistant\n")
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let n_predict = if request.max_tokens > 0 {
            request.max_tokens
        } else {
            self.config.max_tokens
        };

        let mut body = serde_json::json!({
            "prompt": Self::build_prompt(&request.prompt),
            "n_predict": n_predict,
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }

    /// Parse one line of the event stream; `None` for blank lines, comments
    /// and anything that is not a `data:` field
    fn parse_sse_line(line: &str) -> Option<SseEvent> {
        let data = line.trim().strip_prefix("data:")?.trim();
        if data.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => return Some(SseEvent::Failed(format!("invalid event data: {e}"))),
        };

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned);
            return Some(SseEvent::Failed(message));
        }

        Some(SseEvent::Content {
            content: value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            stop: value.get("stop").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

#[async_trait]
impl LlmBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.health_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|response| response.status().is_success())
    }

    async fn generate(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        let start = Instant::now();
        tracing::debug!(
            prompt = %crate::protocol::preview(request.prompt.as_bytes(), 100),
            "Sending prompt to llama.cpp"
        );

        let response = self
            .http_client
            .post(self.completion_url())
            .json(&self.request_body(request, false))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("llama.cpp returned {status}: {body}");
        }

        let data: Value = response.json().await?;
        let Some(content) = data.get("content").and_then(Value::as_str) else {
            anyhow::bail!("llama.cpp response has no 'content' field");
        };

        let tokens_used = data
            .get("tokens_predicted")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());

        Ok(LlmResponse {
            content: content.trim().to_string(),
            tokens_used,
            duration_ms: u64::try_from(start.elapsed().as_millis()).ok(),
        })
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);

        let response = self
            .http_client
            .post(self.completion_url())
            .json(&self.request_body(request, true))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("llama.cpp returned {status}: {body}");
        }

        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = SseLineBuffer::default();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push(&bytes);

                while let Some(line) = buffer.next_line() {
                    match Self::parse_sse_line(&line) {
                        None => {}
                        Some(SseEvent::Failed(message)) => {
                            let _ = tx.send(StreamingToken::Error(message)).await;
                            return;
                        }
                        Some(SseEvent::Content { content, stop }) => {
                            if !content.is_empty() {
                                full_response.push_str(&content);
                                if tx.send(StreamingToken::Token(content)).await.is_err() {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }
                            if stop {
                                let _ = tx
                                    .send(StreamingToken::Complete {
                                        message: full_response,
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }

            // Connection ended without a stop event
            let _ = tx
                .send(StreamingToken::Error(
                    "llama.cpp stream ended before completion".to_string(),
                ))
                .await;
        });

        Ok(rx)
    }
}

//! Relay Wire Protocol
//!
//! Message shapes exchanged between RPC clients and workers over the broker.
//!
//! # Requests
//!
//! A request is published to the durable task queue. Its correlation id and
//! reply-to queue travel as broker message properties; the JSON body carries
//! the caller identity, the prompt text and the streaming flag:
//!
//! ```json
//! {"user_id": "default_user", "message": "ping", "stream": false}
//! ```
//!
//! # Responses
//!
//! Streaming requests are answered with tagged envelopes, zero or more
//! `chunk`s followed by exactly one `end` or one `error`:
//!
//! ```json
//! {"type": "chunk", "content": "1"}
//! {"type": "end"}
//! {"type": "error", "content": "backend unavailable"}
//! ```
//!
//! Unary requests are answered with a single bare object that has no `type`
//! tag, e.g. `{"llm_response": "pong"}`. This asymmetry is a protocol quirk
//! that clients and workers must agree on; [`InboundReply::decode`] tells the
//! two shapes apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the durable task queue workers consume from
pub const TASK_QUEUE_NAME: &str = "llm_task_queue";

/// Caller identity used when none is supplied
pub const DEFAULT_USER_ID: &str = "default_user";

/// Content type of every message body
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Opaque per-request token matching responses to their request
///
/// Unique only among requests that are still pending; an id may be reused
/// once its request has completed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generate a fresh random correlation id
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

/// JSON body of a task message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Opaque caller identity, passed through unchanged
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Prompt text
    pub message: String,
    /// Whether the worker should answer with a chunked stream
    #[serde(default)]
    pub stream: bool,
}

/// A complete request: routing properties plus body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Token identifying the matching response(s)
    pub correlation_id: CorrelationId,
    /// Queue the worker must publish responses to
    pub reply_to: String,
    /// Message body
    pub task: TaskRequest,
}

impl RequestEnvelope {
    /// Build a request envelope
    pub fn new(
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
        user_id: impl Into<String>,
        message: impl Into<String>,
        stream: bool,
    ) -> Self {
        Self {
            correlation_id,
            reply_to: reply_to.into(),
            task: TaskRequest {
                user_id: user_id.into(),
                message: message.into(),
                stream,
            },
        }
    }

    /// Serialize the body to JSON bytes
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.task)
    }
}

/// Tagged response envelope used for streaming replies
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseEnvelope {
    /// A fragment of the response text
    Chunk {
        /// The fragment
        content: String,
    },
    /// Successful end of a stream
    End,
    /// Failure description from the worker
    Error {
        /// Human-readable description
        content: String,
    },
}

impl ResponseEnvelope {
    /// Build a chunk envelope
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    /// Build an error envelope
    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    /// Serialize to JSON bytes
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Bare payload answering a unary request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnaryReply {
    /// Complete model output
    pub llm_response: String,
}

/// Classification of an inbound reply body
///
/// Decoding is lenient so that the router can decide how each shape affects
/// the pending request it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundReply {
    /// `type == "chunk"`; content is `None` when missing or not a string
    Chunk(Option<String>),
    /// `type == "end"`
    End,
    /// `type == "error"`; content is `None` when missing or not a string
    Error(Option<String>),
    /// A `type` tag this protocol does not know
    Unknown(String),
    /// Untagged JSON value (the unary shape)
    Bare(Value),
    /// The body is not valid JSON
    Malformed(String),
}

impl InboundReply {
    /// Classify a raw reply body
    #[must_use]
    pub fn decode(payload: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                return Self::Malformed(format!(
                    "invalid JSON ({e}): {}",
                    preview(payload, 100)
                ))
            }
        };

        let tag = value
            .as_object()
            .and_then(|obj| obj.get("type"))
            .map(|t| t.as_str().map(str::to_owned).unwrap_or_else(|| t.to_string()));

        let Some(tag) = tag else {
            return Self::Bare(value);
        };

        let content = value
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match tag.as_str() {
            "chunk" => Self::Chunk(content),
            "end" => Self::End,
            "error" => Self::Error(content),
            _ => Self::Unknown(tag),
        }
    }
}

/// Lossy UTF-8 preview of a payload for log lines and error messages
#[must_use]
pub fn preview(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= max_chars {
        text.into_owned()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}

//! RPC Error Taxonomy
//!
//! Every way a `call` or `stream` can fail. Unary calls surface these as
//! values; streams yield them as the final item.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Failure of an RPC operation
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Could not (re)connect to the broker
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker connection was lost while the request was pending
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The request could not be enqueued
    #[error("failed to publish: {0}")]
    Publish(String),

    /// No response (or, for streams, no activity) within the deadline
    #[error("timeout after {} seconds", format_seconds(.0))]
    Timeout(Duration),

    /// A reply was malformed or had an unexpected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker answered with an `error` envelope
    #[error("worker error: {0}")]
    Worker(String),

    /// The caller abandoned the operation
    #[error("cancelled")]
    Cancelled,
}

impl RpcError {
    /// Whether this failure came from the broker connection itself
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectionLost(_))
    }

    /// Render as the `{"error": "..."}` value returned by `call_json`
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed(reason) => Self::ConnectionLost(reason),
            TransportError::PublishFailed(reason) => Self::Publish(reason),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Whole seconds print without a fractional part
fn format_seconds(duration: &Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            RpcError::Timeout(Duration::from_secs(60)).to_string(),
            "timeout after 60 seconds"
        );
        assert_eq!(
            RpcError::Timeout(Duration::from_millis(250)).to_string(),
            "timeout after 0.250 seconds"
        );
    }

    #[test]
    fn test_payload_shape() {
        assert_eq!(
            RpcError::Cancelled.to_payload(),
            serde_json::json!({"error": "cancelled"})
        );
        let publish = RpcError::Publish("channel closed".into()).to_payload();
        assert!(publish["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to publish"));
    }

    #[test]
    fn test_from_transport_error() {
        assert!(matches!(
            RpcError::from(TransportError::ConnectionClosed("gone".into())),
            RpcError::ConnectionLost(_)
        ));
        assert!(matches!(
            RpcError::from(TransportError::ConnectionFailed("refused".into())),
            RpcError::Transport(_)
        ));
        assert!(RpcError::ConnectionLost("x".into()).is_connection_failure());
        assert!(!RpcError::Cancelled.is_connection_failure());
    }
}

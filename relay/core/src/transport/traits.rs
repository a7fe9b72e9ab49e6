//! Transport Traits
//!
//! Core trait definitions for talking to a message broker.
//!
//! Two traits define the two levels of a connection:
//! - `Broker`: a factory that opens sessions against one broker
//! - `BrokerSession`: one live connection plus one channel on it
//!
//! Sessions report their own death through a [`CloseSignal`], which the
//! owning reader loop selects on next to its delivery stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that can occur during transport operations
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Broker unreachable or handshake refused
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Handshake did not complete in time
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// Connection or channel has been closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    /// A channel-level operation (declare, consume, qos, ack) failed
    #[error("Channel error: {0}")]
    ChannelError(String),
    /// Message could not be enqueued
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    /// Message serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Acknowledgement mode for a consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// Broker forgets a message as soon as it is delivered
    Auto,
    /// Consumer must call [`BrokerSession::ack`]
    Manual,
}

/// A message received from a queue
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Session-scoped tag used to acknowledge this delivery
    pub delivery_tag: u64,
    /// Correlation id property
    pub correlation_id: Option<String>,
    /// Reply-to property
    pub reply_to: Option<String>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Message body
    pub body: Vec<u8>,
}

/// A message to publish on the default exchange
#[derive(Clone, Debug, Default)]
pub struct OutboundMessage {
    /// Correlation id property
    pub correlation_id: Option<String>,
    /// Reply-to property
    pub reply_to: Option<String>,
    /// Ask the broker to persist the message
    pub persistent: bool,
    /// JSON body
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Create a message carrying `body`
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Set the correlation id property
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to property
    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Mark the message persistent
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Stream of deliveries from one consumer; ends when the consumer dies
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Sending half of a session's close notification
///
/// The first reported reason wins; later reports are ignored.
#[derive(Clone, Debug)]
pub struct CloseNotifier(Arc<watch::Sender<Option<String>>>);

impl CloseNotifier {
    /// Create a notifier and its first signal
    #[must_use]
    pub fn new() -> (Self, CloseSignal) {
        let (tx, rx) = watch::channel(None);
        (Self(Arc::new(tx)), CloseSignal(rx))
    }

    /// Report that the session is gone. Returns false if already reported.
    pub fn notify(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Another receiver for this notifier
    #[must_use]
    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal(self.0.subscribe())
    }
}

/// Receiving half of a session's close notification
#[derive(Clone, Debug)]
pub struct CloseSignal(watch::Receiver<Option<String>>);

impl CloseSignal {
    /// Whether the session has already been reported closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Wait until the session is reported closed and return the reason
    pub async fn closed(&mut self) -> String {
        loop {
            if let Some(reason) = self.0.borrow_and_update().clone() {
                return reason;
            }
            if self.0.changed().await.is_err() {
                return "session dropped".to_string();
            }
        }
    }
}

/// One live broker connection with a single channel
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Whether both connection and channel are open
    fn is_open(&self) -> bool;

    /// Signal that fires when the connection or channel is lost
    fn close_signal(&self) -> CloseSignal;

    /// Declare an exclusive, auto-deleting queue with a broker-chosen name
    async fn declare_reply_queue(&self) -> Result<String, TransportError>;

    /// Declare a durable named queue (idempotent)
    async fn declare_task_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Limit unacknowledged deliveries held by this session
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Start consuming from `queue`
    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream, TransportError>;

    /// Publish to `routing_key` on the default exchange
    async fn publish(&self, routing_key: &str, message: OutboundMessage)
        -> Result<(), TransportError>;

    /// Acknowledge a manually-acked delivery
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Close channel then connection; failures are logged, not returned
    async fn close(&self);
}

/// Factory for broker sessions
#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-readable broker name for logs
    fn name(&self) -> &str;

    /// Open a new connection and channel
    async fn open(&self) -> Result<Arc<dyn BrokerSession>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_signal_first_reason_wins() {
        let (notifier, mut signal) = CloseNotifier::new();
        assert!(!signal.is_closed());

        assert!(notifier.notify("heartbeat missed"));
        assert!(!notifier.notify("second reason"));

        assert!(signal.is_closed());
        assert_eq!(signal.closed().await, "heartbeat missed");
        assert_eq!(notifier.subscribe().closed().await, "heartbeat missed");
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let (notifier, mut signal) = CloseNotifier::new();
        let waiter = tokio::spawn(async move { signal.closed().await });
        tokio::task::yield_now().await;
        notifier.notify("broker restarted");
        assert_eq!(waiter.await.unwrap(), "broker restarted");
    }

    #[test]
    fn test_outbound_builder() {
        let msg = OutboundMessage::new(b"{}".to_vec())
            .with_correlation_id("c1")
            .with_reply_to("amq.gen-1")
            .persistent();
        assert_eq!(msg.correlation_id.as_deref(), Some("c1"));
        assert_eq!(msg.reply_to.as_deref(), Some("amq.gen-1"));
        assert!(msg.persistent);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));
    }
}

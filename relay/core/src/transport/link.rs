//! Reply Link
//!
//! Client-side connection lifecycle: one broker session, one exclusive reply
//! queue, and one background reader feeding the correlation router.
//!
//! # State
//!
//! The link is healthy when the session is open, the reply queue has a name
//! and the reader task is still running. Anything else counts as
//! disconnected, and the next [`ReplyLink::connect`] rebuilds everything.
//!
//! # Loss
//!
//! The reader selects on the delivery stream and the session's
//! [`CloseSignal`]. Whichever reports loss first causes every pending request
//! to be failed and a [`LinkEvent::Lost`] to be broadcast.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::traits::{
    AckMode, Broker, BrokerSession, CloseSignal, DeliveryStream, OutboundMessage, TransportError,
};
use crate::protocol::{CorrelationId, RequestEnvelope};
use crate::router::CorrelationRouter;

/// Lifecycle events broadcast by a [`ReplyLink`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A fresh session and reply queue are ready
    Connected {
        /// Broker-assigned reply queue name
        reply_queue: String,
    },
    /// The session died; pending requests were failed
    Lost {
        /// Reason reported by the broker or the reader
        reason: String,
    },
    /// The link was closed on request
    Closed,
}

struct LinkState {
    session: Arc<dyn BrokerSession>,
    reply_queue: String,
    reader: JoinHandle<()>,
}

impl LinkState {
    fn is_healthy(&self) -> bool {
        self.session.is_open() && !self.reply_queue.is_empty() && !self.reader.is_finished()
    }

    fn handle(&self) -> LinkHandle {
        LinkHandle {
            session: Arc::clone(&self.session),
            reply_queue: self.reply_queue.clone(),
        }
    }
}

/// Connected session plus the reply queue requests should name
#[derive(Clone)]
pub struct LinkHandle {
    session: Arc<dyn BrokerSession>,
    reply_queue: String,
}

impl LinkHandle {
    /// Reply queue responses will arrive on
    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Publish a request to the task queue
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SerializationError` if the body cannot be
    /// encoded, or the session's publish error.
    pub async fn publish_request(
        &self,
        task_queue: &str,
        request: &RequestEnvelope,
    ) -> Result<(), TransportError> {
        let message = OutboundMessage::new(request.body()?)
            .with_correlation_id(request.correlation_id.as_str())
            .with_reply_to(request.reply_to.clone())
            .persistent();
        self.session.publish(task_queue, message).await
    }
}

/// Owns the client's broker session and reply-queue reader
pub struct ReplyLink {
    broker: Arc<dyn Broker>,
    router: Arc<CorrelationRouter>,
    connect_timeout: Duration,
    state: Mutex<Option<LinkState>>,
    events: broadcast::Sender<LinkEvent>,
}

impl ReplyLink {
    /// Create a disconnected link
    pub fn new(
        broker: Arc<dyn Broker>,
        router: Arc<CorrelationRouter>,
        connect_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            broker,
            router,
            connect_timeout,
            state: Mutex::new(None),
            events,
        }
    }

    /// Connect if not already healthy and return the live handle
    ///
    /// Concurrent callers are serialized; only one reconnect runs at a time.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectTimeout` if the broker does not answer
    /// in time, or the broker's own error if opening or declaring fails.
    pub async fn connect(&self) -> Result<LinkHandle, TransportError> {
        let mut state = self.state.lock().await;

        if let Some(current) = state.as_ref() {
            if current.is_healthy() {
                return Ok(current.handle());
            }
        }

        if let Some(stale) = state.take() {
            tracing::info!(broker = self.broker.name(), "Discarding stale broker session");
            self.discard(stale).await;
        }

        let session = tokio::time::timeout(self.connect_timeout, self.broker.open())
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        let (reply_queue, deliveries) = match Self::prepare(session.as_ref()).await {
            Ok(prepared) => prepared,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let reader = tokio::spawn(read_replies(
            deliveries,
            session.close_signal(),
            Arc::clone(&self.router),
            self.events.clone(),
        ));

        tracing::info!(
            broker = self.broker.name(),
            reply_queue = %reply_queue,
            "Reply link connected"
        );
        let _ = self.events.send(LinkEvent::Connected {
            reply_queue: reply_queue.clone(),
        });

        let fresh = LinkState {
            session,
            reply_queue,
            reader,
        };
        let handle = fresh.handle();
        *state = Some(fresh);
        Ok(handle)
    }

    /// Stop a stale reader, sweeping pending requests if it never got to
    async fn discard(&self, stale: LinkState) {
        stale.reader.abort();
        // Ok means the reader ran to completion and already swept.
        if stale.reader.await.is_err() {
            let mut signal = stale.session.close_signal();
            let reason = if signal.is_closed() {
                signal.closed().await
            } else {
                "reply link unhealthy".to_string()
            };
            tracing::warn!(%reason, "Reply link lost");
            self.router.fail_all(&reason);
            let _ = self.events.send(LinkEvent::Lost { reason });
        }
        stale.session.close().await;
    }

    async fn prepare(
        session: &dyn BrokerSession,
    ) -> Result<(String, DeliveryStream), TransportError> {
        let reply_queue = session.declare_reply_queue().await?;
        let deliveries = session.consume(&reply_queue, AckMode::Auto).await?;
        Ok((reply_queue, deliveries))
    }

    /// Tear down the session and fail everything still pending
    pub async fn disconnect(&self) {
        let taken = self.state.lock().await.take();
        if let Some(state) = taken {
            state.reader.abort();
            state.session.close().await;
            tracing::info!(reply_queue = %state.reply_queue, "Reply link closed");
        }
        self.router.fail_all("client closed");
        let _ = self.events.send(LinkEvent::Closed);
    }

    /// Whether the link is currently healthy
    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(LinkState::is_healthy)
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

/// Background reader: route every reply until the session goes away
async fn read_replies(
    mut deliveries: DeliveryStream,
    mut closed: CloseSignal,
    router: Arc<CorrelationRouter>,
    events: broadcast::Sender<LinkEvent>,
) {
    let reason = loop {
        tokio::select! {
            biased;

            delivery = deliveries.next() => {
                let Some(delivery) = delivery else {
                    if closed.is_closed() {
                        break closed.closed().await;
                    }
                    break "reply consumer stopped".to_string();
                };
                match delivery.correlation_id {
                    Some(id) => router.dispatch(&CorrelationId::from(id), &delivery.body),
                    None => tracing::warn!(
                        bytes = delivery.body.len(),
                        "Reply without correlation id dropped"
                    ),
                }
            }

            reason = closed.closed() => break reason,
        }
    };

    tracing::warn!(%reason, "Reply link lost");
    router.fail_all(&reason);
    let _ = events.send(LinkEvent::Lost { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessBroker;

    fn new_link(broker: Arc<InProcessBroker>) -> (ReplyLink, Arc<CorrelationRouter>) {
        let router = CorrelationRouter::new();
        let link = ReplyLink::new(broker, Arc::clone(&router), Duration::from_secs(1));
        (link, router)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = InProcessBroker::new();
        let (link, _router) = new_link(Arc::clone(&broker));

        let first = link.connect().await.unwrap();
        let second = link.connect().await.unwrap();

        assert_eq!(first.reply_queue(), second.reply_queue());
        assert_eq!(broker.session_count(), 1);
        assert!(link.is_connected().await);
    }

    #[tokio::test]
    async fn test_loss_fails_pending_and_reconnects() {
        let broker = InProcessBroker::new();
        let (link, router) = new_link(Arc::clone(&broker));
        let mut events = link.subscribe();

        let first = link.connect().await.unwrap();
        assert!(matches!(events.recv().await, Ok(LinkEvent::Connected { .. })));

        let (rx, _guard) = router.register_unary(&CorrelationId::from("c1")).unwrap();
        broker.disconnect_all("broker restarted");

        assert!(matches!(
            rx.await.unwrap(),
            Err(crate::RpcError::ConnectionLost(_))
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Lost {
                reason: "broker restarted".into()
            }
        );
        assert!(!link.is_connected().await);

        let second = link.connect().await.unwrap();
        assert_ne!(first.reply_queue(), second.reply_queue());
        assert!(broker.has_queue(second.reply_queue()));
    }

    #[tokio::test]
    async fn test_immediate_reconnect_fails_pending() {
        let broker = InProcessBroker::new();
        let (link, router) = new_link(Arc::clone(&broker));
        link.connect().await.unwrap();
        let mut events = link.subscribe();

        let (rx, _guard) = router.register_unary(&CorrelationId::from("c1")).unwrap();
        // Reconnect before the reader gets a chance to observe the loss.
        broker.disconnect_all("broker restarted");
        link.connect().await.unwrap();

        assert!(matches!(
            rx.await.unwrap(),
            Err(crate::RpcError::ConnectionLost(_))
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Lost {
                reason: "broker restarted".into()
            }
        );
        assert!(matches!(events.recv().await, Ok(LinkEvent::Connected { .. })));
        assert!(events.try_recv().is_err());
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_routed_through_link() {
        let broker = InProcessBroker::new();
        let (link, router) = new_link(Arc::clone(&broker));
        let handle = link.connect().await.unwrap();

        let id = CorrelationId::from("c1");
        let (rx, _guard) = router.register_unary(&id).unwrap();

        let responder = broker.open().await.unwrap();
        responder
            .publish(
                handle.reply_queue(),
                OutboundMessage::new(br#"{"llm_response":"pong"}"#.to_vec())
                    .with_correlation_id("c1"),
            )
            .await
            .unwrap();

        assert_eq!(
            rx.await.unwrap().unwrap(),
            serde_json::json!({"llm_response": "pong"})
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending() {
        let broker = InProcessBroker::new();
        let (link, router) = new_link(Arc::clone(&broker));
        link.connect().await.unwrap();

        let (mut sink, _guard) = router.register_stream(&CorrelationId::from("s")).unwrap();
        link.disconnect().await;

        assert!(matches!(
            sink.recv().await,
            Some(crate::router::StreamEvent::Failed(crate::RpcError::ConnectionLost(_)))
        ));
        assert_eq!(broker.session_count(), 0);
    }
}

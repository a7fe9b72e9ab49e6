//! In-Process Broker
//!
//! A broker living entirely inside the current process, for embedded
//! deployments where client and worker share a runtime, and for tests.
//!
//! It keeps the queue semantics the RPC core depends on:
//! - exclusive reply queues get broker-generated names and disappear with
//!   the session that declared them
//! - publishing to a queue that does not exist silently drops the message
//! - prefetch bounds unacknowledged deliveries per session
//! - unacknowledged deliveries return to the front of their queue, marked
//!   redelivered, when their session closes
//!
//! # Usage
//!
//! ```ignore
//! let broker = InProcessBroker::new();
//! let client = RpcClient::new(broker.clone(), ClientConfig::default());
//! let worker = Worker::new(broker.clone(), backend, WorkerConfig::default());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::traits::{
    AckMode, Broker, BrokerSession, CloseNotifier, CloseSignal, Delivery, DeliveryStream,
    OutboundMessage, TransportError,
};

type SessionId = u64;

#[derive(Clone, Debug)]
struct StoredMessage {
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
    body: Vec<u8>,
}

struct Consumer {
    session: SessionId,
    mode: AckMode,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Queue {
    exclusive_owner: Option<SessionId>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct SessionState {
    notifier: CloseNotifier,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

impl SessionState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    sessions: HashMap<SessionId, SessionState>,
}

impl BrokerState {
    /// Hand ready messages to consumers with spare capacity, round-robin
    fn pump(&mut self, queue_name: &str) {
        let Self { queues, sessions } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    consumer.mode == AckMode::Auto
                        || sessions
                            .get(&consumer.session)
                            .is_some_and(SessionState::has_capacity)
                });
            let Some(idx) = chosen else {
                break;
            };

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let consumer = &queue.consumers[idx];
            let Some(session) = sessions.get_mut(&consumer.session) else {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            };

            session.next_tag += 1;
            let tag = session.next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                correlation_id: message.correlation_id.clone(),
                reply_to: message.reply_to.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                // Consumer stream was dropped
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }

            if consumer.mode == AckMode::Manual {
                session
                    .unacked
                    .insert(tag, (queue_name.to_string(), message));
            }
            queue.next_consumer = (idx + 1) % queue.consumers.len();
        }
    }

    /// Tear down a session: drop its consumers, requeue its unacked
    /// messages and delete its exclusive queues
    fn close_session(&mut self, id: SessionId, reason: &str) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        session.notifier.notify(reason);

        let mut unacked: Vec<_> = session.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        let mut touched = Vec::new();
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.ready.push_front(message);
                touched.push(queue_name);
            }
        }

        self.queues
            .retain(|_, queue| queue.exclusive_owner != Some(id));
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != id);
            queue.next_consumer = 0;
        }

        touched.dedup();
        for name in touched {
            self.pump(&name);
        }
    }
}

/// Broker implemented with in-memory queues
#[derive(Clone, Default)]
pub struct InProcessBroker {
    state: Arc<Mutex<BrokerState>>,
    next_session: Arc<AtomicU64>,
}

impl InProcessBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Close every open session, as if the broker went away
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.state.lock();
        let ids: Vec<_> = state.sessions.keys().copied().collect();
        for id in ids {
            state.close_session(id, reason);
        }
        tracing::warn!(reason, "In-process broker dropped all sessions");
    }

    /// Number of open sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether a queue with this name exists
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Messages waiting in a queue (not counting unacknowledged ones)
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.ready.len())
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn open(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let (notifier, signal) = CloseNotifier::new();

        self.state.lock().sessions.insert(
            id,
            SessionState {
                notifier,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );

        tracing::debug!(session = id, "In-process session opened");
        Ok(Arc::new(InProcessSession {
            id,
            state: Arc::clone(&self.state),
            signal,
        }))
    }
}

/// One session on an [`InProcessBroker`]
pub struct InProcessSession {
    id: SessionId,
    state: Arc<Mutex<BrokerState>>,
    signal: CloseSignal,
}

impl InProcessSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.signal.is_closed() {
            Err(TransportError::ConnectionClosed(format!(
                "session {} is closed",
                self.id
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for InProcessSession {
    fn is_open(&self) -> bool {
        !self.signal.is_closed()
    }

    fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    async fn declare_reply_queue(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        self.state.lock().queues.insert(
            name.clone(),
            Queue {
                exclusive_owner: Some(self.id),
                ..Default::default()
            },
        );
        Ok(name)
    }

    async fn declare_task_queue(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get(name) {
            if queue.exclusive_owner.is_some_and(|owner| owner != self.id) {
                return Err(TransportError::ChannelError(format!(
                    "RESOURCE_LOCKED - queue '{name}' is exclusive to another session"
                )));
            }
            return Ok(());
        }
        state.queues.insert(name.to_string(), Queue::default());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.prefetch = count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(TransportError::ChannelError(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        };
        if target.exclusive_owner.is_some_and(|owner| owner != self.id) {
            return Err(TransportError::ChannelError(format!(
                "RESOURCE_LOCKED - queue '{queue}' is exclusive to another session"
            )));
        }
        target.consumers.push(Consumer {
            session: self.id,
            mode,
            tx,
        });
        state.pump(queue);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(routing_key) else {
            tracing::debug!(queue = routing_key, "No such queue, message dropped");
            return Ok(());
        };
        queue.ready.push_back(StoredMessage {
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            redelivered: false,
            body: message.body,
        });
        state.pump(routing_key);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let queue_name = state
            .sessions
            .get_mut(&self.id)
            .and_then(|session| session.unacked.remove(&delivery_tag))
            .map(|(queue_name, _)| queue_name)
            .ok_or_else(|| {
                TransportError::ChannelError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                ))
            })?;
        state.pump(&queue_name);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().close_session(self.id, "closed by client");
        tracing::debug!(session = self.id, "In-process session closed");
    }
}

impl Drop for InProcessSession {
    fn drop(&mut self) {
        self.state.lock().close_session(self.id, "session dropped");
    }
}

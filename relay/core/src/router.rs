//! Correlation Router
//!
//! Single dispatcher for every reply arriving on the client's reply queue.
//!
//! Each pending request owns exactly one entry, keyed by its correlation id:
//! - a unary slot, resolved once with the decoded payload or a failure
//! - a stream sink, receiving chunks until an end or failure sentinel
//!
//! Entries are registered before the request is published and removed by
//! the [`PendingGuard`] the registering caller holds, so abandoning a call
//! unregisters it synchronously. Unary slots are also removed when they
//! resolve; stream sinks stay until their consumer lets go.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::RpcError;
use crate::protocol::{preview, CorrelationId, InboundReply};

/// Result delivered to a unary slot
pub type UnaryResult = Result<Value, RpcError>;

/// Item delivered to a stream sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A text fragment
    Chunk(String),
    /// The worker finished the stream
    End,
    /// The stream failed; nothing follows
    Failed(RpcError),
}

enum Slot {
    Unary(oneshot::Sender<UnaryResult>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct Pending {
    registration: u64,
    slot: Slot,
}

/// Routes replies to pending requests by correlation id
#[derive(Default)]
pub struct CorrelationRouter {
    pending: DashMap<CorrelationId, Pending>,
    registrations: AtomicU64,
}

impl CorrelationRouter {
    /// Create an empty router
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a single-response slot for `id`
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Protocol` if `id` is already pending.
    pub fn register_unary(
        self: &Arc<Self>,
        id: &CorrelationId,
    ) -> Result<(oneshot::Receiver<UnaryResult>, PendingGuard), RpcError> {
        let (tx, rx) = oneshot::channel();
        let guard = self.insert(id, Slot::Unary(tx))?;
        Ok((rx, guard))
    }

    /// Register a stream sink for `id`
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Protocol` if `id` is already pending.
    pub fn register_stream(
        self: &Arc<Self>,
        id: &CorrelationId,
    ) -> Result<(mpsc::UnboundedReceiver<StreamEvent>, PendingGuard), RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.insert(id, Slot::Stream(tx))?;
        Ok((rx, guard))
    }

    fn insert(self: &Arc<Self>, id: &CorrelationId, slot: Slot) -> Result<PendingGuard, RpcError> {
        let registration = self.registrations.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => Err(RpcError::Protocol(format!(
                "correlation id {id} is already pending"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(Pending { registration, slot });
                Ok(PendingGuard {
                    router: Arc::clone(self),
                    id: id.clone(),
                    registration,
                })
            }
        }
    }

    /// Deliver one inbound reply body to the entry registered for `id`
    pub fn dispatch(&self, id: &CorrelationId, payload: &[u8]) {
        let reply = InboundReply::decode(payload);

        // Clone the sink out so no map reference is held while sending
        let found = self.pending.get(id).map(|entry| match &entry.slot {
            Slot::Stream(tx) => Some(tx.clone()),
            Slot::Unary(_) => None,
        });
        let Some(stream_sink) = found else {
            tracing::warn!(
                correlation_id = %id,
                payload = %preview(payload, 100),
                "Reply for unknown correlation id dropped"
            );
            return;
        };

        match stream_sink {
            Some(sink) => Self::dispatch_stream(id, &sink, reply),
            None => self.dispatch_unary(id, reply),
        }
    }

    fn dispatch_stream(
        id: &CorrelationId,
        sink: &mpsc::UnboundedSender<StreamEvent>,
        reply: InboundReply,
    ) {
        let event = match reply {
            InboundReply::Chunk(Some(content)) => StreamEvent::Chunk(content),
            InboundReply::Chunk(None) => {
                tracing::warn!(correlation_id = %id, "Chunk without content dropped");
                return;
            }
            InboundReply::End => StreamEvent::End,
            InboundReply::Error(content) => StreamEvent::Failed(RpcError::Worker(
                content.unwrap_or_else(|| "Unknown worker error".to_string()),
            )),
            InboundReply::Unknown(kind) => StreamEvent::Failed(RpcError::Protocol(format!(
                "unknown reply type '{kind}'"
            ))),
            InboundReply::Bare(_) => StreamEvent::Failed(RpcError::Protocol(
                "untagged reply received for a streaming request".to_string(),
            )),
            InboundReply::Malformed(reason) => StreamEvent::Failed(RpcError::Protocol(reason)),
        };

        tracing::debug!(correlation_id = %id, ?event, "Stream reply dispatched");
        if sink.send(event).is_err() {
            tracing::debug!(correlation_id = %id, "Stream consumer already gone");
        }
    }

    fn dispatch_unary(&self, id: &CorrelationId, reply: InboundReply) {
        let result = match reply {
            InboundReply::Bare(value) => Ok(value),
            InboundReply::Error(content) => Err(RpcError::Worker(
                content.unwrap_or_else(|| "Unknown worker error".to_string()),
            )),
            InboundReply::Malformed(reason) => Err(RpcError::Protocol(reason)),
            InboundReply::Chunk(_) | InboundReply::End => Err(RpcError::Protocol(
                "stream envelope received for a unary request".to_string(),
            )),
            InboundReply::Unknown(kind) => {
                Err(RpcError::Protocol(format!("unknown reply type '{kind}'")))
            }
        };

        let removed = self
            .pending
            .remove_if(id, |_, pending| matches!(pending.slot, Slot::Unary(_)));
        if let Some((_, Pending { slot: Slot::Unary(tx), .. })) = removed {
            tracing::debug!(correlation_id = %id, ok = result.is_ok(), "Unary reply dispatched");
            if tx.send(result).is_err() {
                tracing::debug!(correlation_id = %id, "Unary caller already gone");
            }
        }
    }

    /// Fail every pending entry with a connection-lost error and clear the table
    pub fn fail_all(&self, reason: &str) {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        tracing::warn!(reason, pending = ids.len(), "Failing all pending requests");

        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let error = RpcError::ConnectionLost(reason.to_string());
                match pending.slot {
                    Slot::Unary(tx) => {
                        let _ = tx.send(Err(error));
                    }
                    Slot::Stream(tx) => {
                        let _ = tx.send(StreamEvent::Failed(error));
                    }
                }
            }
        }
    }

    /// Cancel one pending request. Returns false if `id` was not pending.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        let Some((_, pending)) = self.pending.remove(id) else {
            return false;
        };
        tracing::debug!(correlation_id = %id, "Pending request cancelled");
        match pending.slot {
            Slot::Unary(tx) => {
                let _ = tx.send(Err(RpcError::Cancelled));
            }
            Slot::Stream(tx) => {
                let _ = tx.send(StreamEvent::Failed(RpcError::Cancelled));
            }
        }
        true
    }

    /// Whether `id` currently has an entry
    #[must_use]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending entries
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Removes its pending entry when dropped
#[must_use = "dropping the guard unregisters the request"]
pub struct PendingGuard {
    router: Arc<CorrelationRouter>,
    id: CorrelationId,
    registration: u64,
}

impl PendingGuard {
    /// Correlation id this guard owns
    #[must_use]
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // Only remove our own registration, never a later one that reused the id
        let registration = self.registration;
        self.router
            .pending
            .remove_if(&self.id, |_, pending| pending.registration == registration);
    }
}

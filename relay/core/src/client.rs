//! RPC Client
//!
//! Request/response and request/stream calls on top of the broker.
//!
//! # Usage
//!
//! ```ignore
//! let client = RpcClient::new(broker, ClientConfig::default());
//!
//! // Unary: one decoded reply, e.g. {"llm_response": "pong"}
//! let reply = client.call("ping", None, None).await?;
//!
//! // Streaming: text fragments until the worker sends `end`
//! let mut chunks = client.stream("count to 3", None, None);
//! while let Some(chunk) = chunks.next().await {
//!     print!("{}", chunk?);
//! }
//! ```
//!
//! Both calls connect (or reconnect) on demand. A call that is in flight
//! when the connection drops fails with [`RpcError::ConnectionLost`]; the
//! next call reconnects.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::RpcError;
use crate::protocol::{CorrelationId, RequestEnvelope, DEFAULT_USER_ID, TASK_QUEUE_NAME};
use crate::router::{CorrelationRouter, StreamEvent};
use crate::transport::{Broker, LinkEvent, ReplyLink};

/// Client settings
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Queue requests are published to
    pub task_queue: String,
    /// How long to wait for the broker handshake
    pub connect_timeout: Duration,
    /// Default deadline for a unary call
    pub call_timeout: Duration,
    /// Default inactivity timeout for a stream
    pub stream_timeout: Duration,
    /// Caller identity used when a call does not name one
    pub user_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            task_queue: TASK_QUEUE_NAME.to_string(),
            connect_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(60),
            user_id: DEFAULT_USER_ID.to_string(),
        }
    }
}

/// RPC client owning one reply link and its router
pub struct RpcClient {
    link: Arc<ReplyLink>,
    router: Arc<CorrelationRouter>,
    config: ClientConfig,
}

impl RpcClient {
    /// Create a client; nothing connects until the first call
    pub fn new(broker: Arc<dyn Broker>, config: ClientConfig) -> Self {
        let router = CorrelationRouter::new();
        let link = Arc::new(ReplyLink::new(
            broker,
            Arc::clone(&router),
            config.connect_timeout,
        ));
        Self {
            link,
            router,
            config,
        }
    }

    /// Client settings
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect now instead of on the first call
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the broker cannot be reached.
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.link
            .connect()
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// Send one request and wait for its reply
    ///
    /// `user_id` and `timeout` fall back to the client configuration.
    ///
    /// # Errors
    ///
    /// Returns the [`RpcError`] describing why no reply was obtained.
    pub async fn call(
        &self,
        message: impl Into<String>,
        user_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.call_with_cancel(message, user_id, timeout, std::future::pending::<()>())
            .await
    }

    /// Like [`call`](Self::call), abandoned with `RpcError::Cancelled` as
    /// soon as `cancel` completes
    ///
    /// # Errors
    ///
    /// Returns the [`RpcError`] describing why no reply was obtained.
    pub async fn call_with_cancel<C>(
        &self,
        message: impl Into<String>,
        user_id: Option<&str>,
        timeout: Option<Duration>,
        cancel: C,
    ) -> Result<Value, RpcError>
    where
        C: Future<Output = ()>,
    {
        let message = message.into();
        let user_id = user_id.unwrap_or(&self.config.user_id);
        let timeout = timeout.unwrap_or(self.config.call_timeout);

        tokio::select! {
            biased;

            () = cancel => {
                tracing::debug!("Call cancelled by caller");
                Err(RpcError::Cancelled)
            }
            result = self.call_inner(message, user_id, timeout) => result,
        }
    }

    async fn call_inner(
        &self,
        message: String,
        user_id: &str,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let handle = self
            .link
            .connect()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let id = CorrelationId::new();
        let (reply, _guard) = self.router.register_unary(&id)?;

        let request =
            RequestEnvelope::new(id.clone(), handle.reply_queue(), user_id, message, false);
        if let Err(e) = handle
            .publish_request(&self.config.task_queue, &request)
            .await
        {
            tracing::error!(correlation_id = %id, error = %e, "Failed to publish request");
            return Err(RpcError::Publish(e.to_string()));
        }
        tracing::debug!(correlation_id = %id, "Request published");

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            // Slot dropped without a value: removed by cancel()
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                tracing::warn!(correlation_id = %id, ?timeout, "Call timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Like [`call`](Self::call), with failures flattened to
    /// `{"error": "<message>"}`
    pub async fn call_json(
        &self,
        message: impl Into<String>,
        user_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Value {
        match self.call(message, user_id, timeout).await {
            Ok(value) => value,
            Err(e) => e.to_payload(),
        }
    }

    /// Send one streaming request and iterate its text fragments
    ///
    /// Nothing is sent until the stream is first polled. The stream ends
    /// after `end`, or after yielding a single error. `inactivity` bounds the
    /// wait for each item, not the whole stream. Dropping the stream
    /// unregisters it and discards anything still buffered.
    pub fn stream(
        &self,
        message: impl Into<String>,
        user_id: Option<&str>,
        inactivity: Option<Duration>,
    ) -> BoxStream<'static, Result<String, RpcError>> {
        let link = Arc::clone(&self.link);
        let router = Arc::clone(&self.router);
        let task_queue = self.config.task_queue.clone();
        let user_id = user_id.unwrap_or(&self.config.user_id).to_string();
        let inactivity = inactivity.unwrap_or(self.config.stream_timeout);
        let message = message.into();

        async_stream::stream! {
            let handle = match link.connect().await {
                Ok(handle) => handle,
                Err(e) => {
                    yield Err(RpcError::Transport(e.to_string()));
                    return;
                }
            };

            let id = CorrelationId::new();
            let (mut sink, _guard) = match router.register_stream(&id) {
                Ok(registered) => registered,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let request =
                RequestEnvelope::new(id.clone(), handle.reply_queue(), user_id, message, true);
            if let Err(e) = handle.publish_request(&task_queue, &request).await {
                tracing::error!(
                    correlation_id = %id,
                    error = %e,
                    "Failed to publish stream request"
                );
                yield Err(RpcError::Publish(e.to_string()));
                return;
            }
            tracing::debug!(correlation_id = %id, "Stream request published");

            loop {
                match tokio::time::timeout(inactivity, sink.recv()).await {
                    Ok(Some(StreamEvent::Chunk(content))) => {
                        yield Ok(content);
                    }
                    Ok(Some(StreamEvent::End)) => {
                        tracing::debug!(correlation_id = %id, "Stream finished");
                        break;
                    }
                    Ok(Some(StreamEvent::Failed(e))) => {
                        tracing::warn!(correlation_id = %id, error = %e, "Stream failed");
                        yield Err(e);
                        break;
                    }
                    Ok(None) => {
                        yield Err(RpcError::Cancelled);
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(correlation_id = %id, ?inactivity, "Stream timed out");
                        yield Err(RpcError::Timeout(inactivity));
                        break;
                    }
                }
            }
        }
        .boxed()
    }

    /// Disconnect, failing every pending call and stream
    pub async fn close(&self) {
        self.link.disconnect().await;
    }

    /// Whether the reply link is currently healthy
    pub async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }

    /// Number of calls and streams awaiting replies
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.router.pending_count()
    }

    /// Subscribe to connection lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }
}

//! Worker Dispatch Loop
//!
//! Pulls tasks from the durable task queue, runs them against an inference
//! backend and publishes the replies to each task's reply-to queue.
//!
//! # Task lifecycle
//!
//! ```text
//! received -> unary | stream processing -> reply published -> acked
//! ```
//!
//! A task is acknowledged only after its terminal reply (`{"llm_response"}`,
//! `end` or `error`) has been attempted. A worker that dies mid-task leaves
//! the task unacknowledged, and the broker hands it to another worker, which
//! runs it again from the start.
//!
//! # Connection
//!
//! The loop reconnects with exponential backoff whenever the session fails
//! or cannot be opened. The backoff resets once a session is fully set up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;

use crate::backend::{LlmBackend, LlmRequest, StreamingToken};
use crate::protocol::{preview, ResponseEnvelope, TaskRequest, UnaryReply, TASK_QUEUE_NAME};
use crate::transport::{
    AckMode, BackoffConfig, Broker, BrokerSession, Delivery, OutboundMessage, TransportError,
};

/// Worker failures that stop [`Worker::run`]
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The configuration cannot work
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),
}

/// Worker settings
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Durable queue to consume tasks from
    pub task_queue: String,
    /// Maximum unacknowledged tasks held at once
    pub prefetch: u16,
    /// How long to wait for the broker handshake
    pub connect_timeout: Duration,
    /// Reconnect policy
    pub backoff: BackoffConfig,
    /// Default `max_tokens` passed to the backend (0 = backend default)
    pub max_tokens: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: TASK_QUEUE_NAME.to_string(),
            prefetch: 1,
            connect_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            max_tokens: 0,
        }
    }
}

impl WorkerConfig {
    /// Reject settings the loop cannot run with
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InvalidConfig` for a zero prefetch or an empty
    /// queue name.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.prefetch == 0 {
            return Err(WorkerError::InvalidConfig(
                "prefetch must be at least 1".to_string(),
            ));
        }
        if self.task_queue.trim().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "task queue name is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a session stopped serving
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Task-processing worker bound to one broker and one backend
pub struct Worker {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn LlmBackend>,
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker
    pub fn new(
        broker: Arc<dyn Broker>,
        backend: Arc<dyn LlmBackend>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            backend,
            config,
        }
    }

    /// Serve tasks until `shutdown` completes
    ///
    /// A task already being processed when `shutdown` fires is finished and
    /// acknowledged first.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InvalidConfig` if the configuration is unusable.
    /// Connection failures are retried, never returned.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        tokio::pin!(shutdown);

        tracing::info!(
            broker = self.broker.name(),
            backend = self.backend.name(),
            queue = %self.config.task_queue,
            prefetch = self.config.prefetch,
            "Worker starting"
        );

        let mut attempt: u32 = 0;
        loop {
            match self.run_session(&mut shutdown, &mut attempt).await {
                Ok(SessionEnd::Shutdown) => {
                    tracing::info!("Worker shut down");
                    return Ok(());
                }
                Ok(SessionEnd::Lost(reason)) => {
                    tracing::warn!(%reason, "Broker session lost");
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, "Broker session failed");
                }
            }

            let delay = self.config.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = shutdown.as_mut() => {
                    tracing::info!("Worker shut down");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session<F>(
        &self,
        shutdown: &mut Pin<&mut F>,
        attempt: &mut u32,
    ) -> Result<SessionEnd, TransportError>
    where
        F: Future<Output = ()>,
    {
        let opened = tokio::select! {
            () = shutdown.as_mut() => return Ok(SessionEnd::Shutdown),
            opened = tokio::time::timeout(self.config.connect_timeout, self.broker.open()) => {
                opened
            }
        };
        let session =
            opened.map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;

        let result = self.serve(session.as_ref(), shutdown, attempt).await;
        session.close().await;
        result
    }

    async fn serve<F>(
        &self,
        session: &dyn BrokerSession,
        shutdown: &mut Pin<&mut F>,
        attempt: &mut u32,
    ) -> Result<SessionEnd, TransportError>
    where
        F: Future<Output = ()>,
    {
        let queue = &self.config.task_queue;
        session.declare_task_queue(queue).await?;
        session.set_prefetch(self.config.prefetch).await?;
        let mut deliveries = session.consume(queue, AckMode::Manual).await?;
        let mut closed = session.close_signal();

        *attempt = 0;
        tracing::info!(queue = %queue, "Waiting for tasks");

        loop {
            tokio::select! {
                biased;

                () = shutdown.as_mut() => return Ok(SessionEnd::Shutdown),
                reason = closed.closed() => return Ok(SessionEnd::Lost(reason)),
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => self.handle_delivery(session, delivery).await,
                    None => return Ok(SessionEnd::Lost("task consumer stopped".to_string())),
                },
            }
        }
    }

    /// Process one task and acknowledge it
    async fn handle_delivery(&self, session: &dyn BrokerSession, delivery: Delivery) {
        let tag = delivery.delivery_tag;

        let (Some(reply_to), Some(correlation_id)) =
            (delivery.reply_to.as_deref(), delivery.correlation_id.as_deref())
        else {
            tracing::warn!(
                reply_to = ?delivery.reply_to,
                correlation_id = ?delivery.correlation_id,
                "Task without reply routing skipped"
            );
            ack(session, tag).await;
            return;
        };

        let task: TaskRequest = match serde_json::from_slice(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(
                    correlation_id,
                    error = %e,
                    body = %preview(&delivery.body, 100),
                    "Malformed task payload"
                );
                ack(session, tag).await;
                let envelope = ResponseEnvelope::error(format!("Invalid task payload: {e}"));
                self.reply(session, reply_to, correlation_id, &envelope).await;
                return;
            }
        };

        tracing::info!(
            correlation_id,
            user_id = %task.user_id,
            stream = task.stream,
            redelivered = delivery.redelivered,
            "Task received"
        );

        let request = LlmRequest::new(task.message)
            .with_stream(task.stream)
            .with_max_tokens(self.config.max_tokens);

        if task.stream {
            self.handle_stream(session, reply_to, correlation_id, &request)
                .await;
        } else {
            self.handle_unary(session, reply_to, correlation_id, &request)
                .await;
        }

        ack(session, tag).await;
        tracing::debug!(correlation_id, "Task acknowledged");
    }

    async fn handle_unary(
        &self,
        session: &dyn BrokerSession,
        reply_to: &str,
        correlation_id: &str,
        request: &LlmRequest,
    ) {
        match self.backend.generate(request).await {
            Ok(response) => {
                let reply = UnaryReply {
                    llm_response: response.content,
                };
                self.reply(session, reply_to, correlation_id, &reply).await;
            }
            Err(e) => {
                tracing::error!(correlation_id, error = %e, "Backend failed");
                let envelope = ResponseEnvelope::error(format!("LLM backend error: {e}"));
                self.reply(session, reply_to, correlation_id, &envelope)
                    .await;
            }
        }
    }

    async fn handle_stream(
        &self,
        session: &dyn BrokerSession,
        reply_to: &str,
        correlation_id: &str,
        request: &LlmRequest,
    ) {
        let mut tokens = match self.backend.generate_stream(request).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(correlation_id, error = %e, "Backend failed to start stream");
                let envelope = ResponseEnvelope::error(format!("LLM backend error: {e}"));
                self.reply(session, reply_to, correlation_id, &envelope)
                    .await;
                return;
            }
        };

        let mut chunks: usize = 0;
        let terminal = loop {
            match tokens.recv().await {
                Some(StreamingToken::Token(content)) => {
                    let chunk = ResponseEnvelope::chunk(content);
                    if let Err(e) = self
                        .try_reply(session, reply_to, correlation_id, &chunk)
                        .await
                    {
                        tracing::error!(correlation_id, error = %e, "Failed to publish chunk");
                        break ResponseEnvelope::error(format!("failed to publish chunk: {e}"));
                    }
                    chunks += 1;
                }
                Some(StreamingToken::Complete { .. }) => break ResponseEnvelope::End,
                Some(StreamingToken::Error(message)) => {
                    tracing::error!(correlation_id, error = %message, "Backend stream failed");
                    break ResponseEnvelope::error(message);
                }
                None => {
                    tracing::error!(correlation_id, chunks, "Backend stream closed early");
                    break ResponseEnvelope::error("LLM backend stream ended before completion");
                }
            }
        };

        tracing::debug!(correlation_id, chunks, "Stream finished");
        self.reply(session, reply_to, correlation_id, &terminal)
            .await;
    }

    async fn try_reply<T: Serialize + Sync>(
        &self,
        session: &dyn BrokerSession,
        reply_to: &str,
        correlation_id: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        let message =
            OutboundMessage::new(serde_json::to_vec(payload)?).with_correlation_id(correlation_id);
        session.publish(reply_to, message).await
    }

    /// Publish a reply; failures are logged, never retried
    async fn reply<T: Serialize + Sync>(
        &self,
        session: &dyn BrokerSession,
        reply_to: &str,
        correlation_id: &str,
        payload: &T,
    ) {
        if let Err(e) = self
            .try_reply(session, reply_to, correlation_id, payload)
            .await
        {
            tracing::error!(correlation_id, reply_to, error = %e, "Failed to publish reply");
        }
    }
}

async fn ack(session: &dyn BrokerSession, tag: u64) {
    if let Err(e) = session.ack(tag).await {
        tracing::error!(delivery_tag = tag, error = %e, "Failed to acknowledge task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmResponse;
    use crate::transport::{DeliveryStream, InProcessBroker};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tokio::sync::{mpsc, oneshot};

    struct ScriptedBackend {
        unary: Result<String, String>,
        tokens: Vec<StreamingToken>,
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn generate(&self, _request: &LlmRequest) -> anyhow::Result<LlmResponse> {
            match &self.unary {
                Ok(content) => Ok(LlmResponse {
                    content: content.clone(),
                    tokens_used: None,
                    duration_ms: None,
                }),
                Err(message) => Err(anyhow::anyhow!("{message}")),
            }
        }

        async fn generate_stream(
            &self,
            _request: &LlmRequest,
        ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
            let (tx, rx) = mpsc::channel(16);
            for token in self.tokens.clone() {
                tx.send(token).await?;
            }
            Ok(rx)
        }
    }

    fn backend(unary: Result<&str, &str>, tokens: Vec<StreamingToken>) -> Arc<dyn LlmBackend> {
        Arc::new(ScriptedBackend {
            unary: unary.map(str::to_string).map_err(str::to_string),
            tokens,
        })
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            backoff: BackoffConfig {
                initial_ms: 10,
                max_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Harness {
        broker: Arc<InProcessBroker>,
        client: Arc<dyn BrokerSession>,
        reply_queue: String,
        replies: DeliveryStream,
        stop: Option<oneshot::Sender<()>>,
        worker: tokio::task::JoinHandle<Result<(), WorkerError>>,
    }

    impl Harness {
        async fn start(backend: Arc<dyn LlmBackend>) -> Self {
            let broker = InProcessBroker::new();
            let client = broker.open().await.unwrap();
            client.declare_task_queue(TASK_QUEUE_NAME).await.unwrap();
            let reply_queue = client.declare_reply_queue().await.unwrap();
            let replies = client.consume(&reply_queue, AckMode::Auto).await.unwrap();

            let (stop, stopped) = oneshot::channel::<()>();
            let worker = Worker::new(broker.clone(), backend, fast_config());
            let worker = tokio::spawn(async move {
                worker
                    .run(async {
                        let _ = stopped.await;
                    })
                    .await
            });

            Self {
                broker,
                client,
                reply_queue,
                replies,
                stop: Some(stop),
                worker,
            }
        }

        async fn send(&self, correlation_id: &str, body: &str) {
            let message = OutboundMessage::new(body.as_bytes().to_vec())
                .with_correlation_id(correlation_id)
                .with_reply_to(self.reply_queue.clone());
            self.client.publish(TASK_QUEUE_NAME, message).await.unwrap();
        }

        async fn next_reply(&mut self) -> (String, Value) {
            let delivery = tokio::time::timeout(Duration::from_secs(2), self.replies.next())
                .await
                .unwrap()
                .unwrap();
            (
                delivery.correlation_id.unwrap(),
                serde_json::from_slice(&delivery.body).unwrap(),
            )
        }

        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.worker.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_unary_task_answered_with_bare_payload() {
        let mut harness = Harness::start(backend(Ok("pong"), vec![])).await;
        harness
            .send("c1", r#"{"user_id":"u","message":"ping","stream":false}"#)
            .await;

        let (id, body) = harness.next_reply().await;
        assert_eq!(id, "c1");
        assert_eq!(body, serde_json::json!({"llm_response": "pong"}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.broker.queue_depth(TASK_QUEUE_NAME), 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_stream_task_chunks_then_end() {
        let tokens = vec![
            StreamingToken::Token("1".into()),
            StreamingToken::Token("2".into()),
            StreamingToken::Token("3".into()),
            StreamingToken::Complete {
                message: "123".into(),
            },
        ];
        let mut harness = Harness::start(backend(Ok(""), tokens)).await;
        harness.send("s1", r#"{"message":"count to 3","stream":true}"#).await;

        let mut bodies = Vec::new();
        for _ in 0..4 {
            let (id, body) = harness.next_reply().await;
            assert_eq!(id, "s1");
            bodies.push(body);
        }
        assert_eq!(
            bodies,
            vec![
                serde_json::json!({"type": "chunk", "content": "1"}),
                serde_json::json!({"type": "chunk", "content": "2"}),
                serde_json::json!({"type": "chunk", "content": "3"}),
                serde_json::json!({"type": "end"}),
            ]
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_backend_failures_become_error_envelopes() {
        let tokens = vec![
            StreamingToken::Token("partial".into()),
            StreamingToken::Error("backend unavailable".into()),
        ];
        let mut harness = Harness::start(backend(Err("model not loaded"), tokens)).await;

        harness.send("u1", r#"{"message":"hi"}"#).await;
        let (_, body) = harness.next_reply().await;
        assert_eq!(body["type"], "error");
        assert!(body["content"]
            .as_str()
            .unwrap()
            .contains("model not loaded"));

        harness.send("s1", r#"{"message":"hi","stream":true}"#).await;
        let (_, chunk) = harness.next_reply().await;
        assert_eq!(chunk["content"], "partial");
        let (_, error) = harness.next_reply().await;
        assert_eq!(
            error,
            serde_json::json!({"type": "error", "content": "backend unavailable"})
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_stream_closed_without_complete_is_error() {
        let tokens = vec![StreamingToken::Token("partial".into())];
        let mut harness = Harness::start(backend(Ok(""), tokens)).await;
        harness.send("s1", r#"{"message":"hi","stream":true}"#).await;

        let (_, chunk) = harness.next_reply().await;
        assert_eq!(chunk, serde_json::json!({"type": "chunk", "content": "partial"}));
        let (id, terminal) = harness.next_reply().await;
        assert_eq!(id, "s1");
        assert_eq!(terminal["type"], "error");
        assert!(terminal["content"]
            .as_str()
            .unwrap()
            .contains("ended before completion"));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_task_acked_with_error_reply() {
        let mut harness = Harness::start(backend(Ok("unused"), vec![])).await;
        harness.send("bad", "this is not json").await;

        let (id, body) = harness.next_reply().await;
        assert_eq!(id, "bad");
        assert_eq!(body["type"], "error");
        assert!(body["content"]
            .as_str()
            .unwrap()
            .starts_with("Invalid task payload"));

        // The worker is free for the next task
        harness.send("ok", r#"{"message":"ping"}"#).await;
        let (id, _) = harness.next_reply().await;
        assert_eq!(id, "ok");
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_task_without_reply_to_is_skipped() {
        let mut harness = Harness::start(backend(Ok("pong"), vec![])).await;
        harness
            .client
            .publish(
                TASK_QUEUE_NAME,
                OutboundMessage::new(br#"{"message":"ping"}"#.to_vec()).with_correlation_id("x"),
            )
            .await
            .unwrap();
        harness.send("c2", r#"{"message":"ping"}"#).await;

        let (id, _) = harness.next_reply().await;
        assert_eq!(id, "c2");
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_worker_reconnects_after_broker_loss() {
        let mut harness = Harness::start(backend(Ok("pong"), vec![])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.broker.disconnect_all("broker restarted");

        // Fresh client session and reply queue; the task queue is durable
        let client = harness.broker.open().await.unwrap();
        let reply_queue = client.declare_reply_queue().await.unwrap();
        harness.replies = client.consume(&reply_queue, AckMode::Auto).await.unwrap();
        harness.reply_queue = reply_queue;
        harness.client = client;

        harness.send("after", r#"{"message":"ping"}"#).await;
        let (id, body) = harness.next_reply().await;
        assert_eq!(id, "after");
        assert_eq!(body["llm_response"], "pong");
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let broker = InProcessBroker::new();
        let worker = Worker::new(
            broker,
            backend(Ok(""), vec![]),
            WorkerConfig {
                prefetch: 0,
                ..Default::default()
            },
        );
        assert!(matches!(
            worker.run(std::future::pending::<()>()).await,
            Err(WorkerError::InvalidConfig(_))
        ));
    }
}

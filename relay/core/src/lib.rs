//! Relay Core - RPC over a Message Broker for LLM Workers
//!
//! This crate turns a fire-and-forget message broker into a request/response
//! and request/stream channel between chat front ends and the worker
//! processes that run language-model inference.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐              ┌──────────────────────────────┐
//! │          RpcClient           │              │            Worker            │
//! │  call() / stream()           │              │  run(shutdown)               │
//! │      │             ▲         │              │      │              │        │
//! │      │      CorrelationRouter│              │      ▼              ▼        │
//! │      │             ▲         │              │  LlmBackend    reply publish │
//! │      ▼             │         │              │  (llama.cpp)                 │
//! │  ReplyLink ── reader task    │              │                              │
//! └──────┼─────────────▲─────────┘              └──────▲───────────────┼───────┘
//!        │             │                               │               │
//!        │   ┌─────────┴───────── Broker ──────────────┴───────┐       │
//!        └──►│  llm_task_queue (durable)  ───────────────────► │       │
//!            │  amq.gen-… reply queue (exclusive) ◄────────────┼───────┘
//!            └─────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`RpcClient`]: `call`, `call_with_cancel`, `call_json`, `stream`
//! - [`Worker`]: the task-processing loop
//! - [`CorrelationRouter`]: matches replies to pending requests
//! - [`transport::Broker`]: broker abstraction, with in-process and AMQP
//!   implementations
//! - [`backend::LlmBackend`]: inference backend contract
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{ClientConfig, RpcClient, Worker, WorkerConfig};
//! use relay_core::backend::LlamaCppBackend;
//! use relay_core::transport::InProcessBroker;
//!
//! let broker = InProcessBroker::new();
//!
//! let backend = Arc::new(LlamaCppBackend::default());
//! let worker = Worker::new(broker.clone(), backend, WorkerConfig::default());
//! tokio::spawn(async move { worker.run(std::future::pending()).await });
//!
//! let client = RpcClient::new(broker, ClientConfig::default());
//! let reply = client.call("ping", None, None).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: correlation ids and request/response envelopes
//! - [`error`]: RPC failure taxonomy
//! - [`transport`]: broker sessions, reply link, AMQP and in-process brokers
//! - [`router`]: correlation router
//! - [`client`]: RPC client
//! - [`worker`]: worker dispatch loop
//! - [`backend`]: LLM backend abstraction (llama.cpp)
//! - [`config`]: TOML/environment configuration

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod router;
pub mod transport;
pub mod worker;

// Re-exports for convenience
pub use backend::{
    BackendConfig, LlamaCppBackend, LlmBackend, LlmRequest, LlmResponse, StreamingToken,
};
pub use client::{ClientConfig, RpcClient};
pub use error::RpcError;
pub use protocol::{
    CorrelationId, InboundReply, RequestEnvelope, ResponseEnvelope, TaskRequest, UnaryReply,
    DEFAULT_USER_ID, TASK_QUEUE_NAME,
};
pub use router::{CorrelationRouter, PendingGuard, StreamEvent};
pub use worker::{Worker, WorkerConfig, WorkerError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_env,
    ConfigError, ConfigOverrides, ConfigSource, RelayConfig, RelayToml,
};

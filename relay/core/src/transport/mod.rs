//! Broker Transport Layer
//!
//! Abstraction over the message broker carrying requests and replies:
//! - `InProcess`: in-memory queues (embedded mode and tests)
//! - `Amqp`: RabbitMQ via `lapin` (feature `amqp`)
//!
//! # Design Philosophy
//!
//! The RPC client and the worker only see the [`Broker`] and
//! [`BrokerSession`] traits. Connection lifecycle on the client side lives
//! in [`ReplyLink`]; the worker manages its own session in its run loop.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod config;
pub mod in_process;
pub mod link;
pub mod traits;

// Re-exports for convenience
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use config::{BackoffConfig, BrokerConfig};
pub use in_process::InProcessBroker;
pub use link::{LinkEvent, LinkHandle, ReplyLink};
pub use traits::{
    AckMode, Broker, BrokerSession, CloseNotifier, CloseSignal, Delivery, DeliveryStream,
    OutboundMessage, TransportError,
};

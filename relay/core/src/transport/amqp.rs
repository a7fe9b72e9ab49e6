//! AMQP Broker
//!
//! [`Broker`] implementation for RabbitMQ and other AMQP 0-9-1 brokers,
//! built on `lapin`.
//!
//! Each session is one connection carrying one channel in publisher-confirm
//! mode. Connection and channel errors are forwarded to the session's close
//! signal, which is how the reply link and the worker learn about loss.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::config::BrokerConfig;
use super::traits::{
    AckMode, Broker, BrokerSession, CloseNotifier, CloseSignal, Delivery, DeliveryStream,
    OutboundMessage, TransportError,
};
use crate::protocol::CONTENT_TYPE_JSON;

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Broker reached over AMQP
pub struct AmqpBroker {
    config: BrokerConfig,
}

impl AmqpBroker {
    /// Create a broker for the given configuration
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn open(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        let uri = self.config.amqp_uri();
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ChannelError(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::ChannelError(e.to_string()))?;

        let (notifier, signal) = CloseNotifier::new();
        let on_connection = notifier.clone();
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "AMQP connection error");
            on_connection.notify(format!("connection error: {err}"));
        });
        let on_channel = notifier.clone();
        channel.on_error(move |err| {
            tracing::warn!(error = %err, "AMQP channel error");
            on_channel.notify(format!("channel error: {err}"));
        });

        tracing::info!(channel = channel.id(), "AMQP session opened");
        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            notifier,
            signal,
        }))
    }
}

/// One AMQP connection with one channel
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    notifier: CloseNotifier,
    signal: CloseSignal,
}

fn channel_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
            TransportError::ConnectionClosed(err.to_string())
        }
        other => TransportError::ChannelError(other.to_string()),
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_string()),
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
            && self.channel.status().connected()
            && !self.signal.is_closed()
    }

    fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    async fn declare_reply_queue(&self) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_task_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream, TransportError> {
        let consumer_tag = format!("relay-{}", uuid::Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        let notifier = self.notifier.clone();
        let stream = consumer
            .take_while(move |item| {
                if let Err(e) = item {
                    tracing::warn!(error = %e, "AMQP consumer failed");
                    notifier.notify(format!("consumer error: {e}"));
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok().map(into_delivery)));

        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(CONTENT_TYPE_JSON));
        if let Some(id) = message.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }
        if message.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let confirmation = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(TransportError::PublishFailed(format!(
                "broker rejected message for '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn close(&self) {
        self.notifier.notify("closed by client");
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "bye").await {
                tracing::debug!(error = %e, "Channel close failed");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "bye").await {
                tracing::debug!(error = %e, "Connection close failed");
            }
        }
    }
}

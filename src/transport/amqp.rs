//! RabbitMQ transport backed by lapin.
//!
//! Connection and channel failures reported by lapin are forwarded as
//! lifecycle events: one `Error` followed by `Closed`. Consumers run on a
//! spawned task that hands deliveries to the handler one at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    Channel, Connection, ConsumeOptions, Delivery, DeliveryHandler, LifecycleEvent, Listeners,
    MessageProperties, QueueOptions, Result, Transport, TransportError,
};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

fn map_error(error: lapin::Error) -> TransportError {
    match error {
        lapin::Error::InvalidChannelState(state) => {
            TransportError::ChannelClosed(format!("{:?}", state))
        }
        lapin::Error::InvalidConnectionState(state) => {
            TransportError::ConnectionClosed(format!("{:?}", state))
        }
        lapin::Error::IOError(e) => TransportError::ConnectionClosed(e.to_string()),
        lapin::Error::ProtocolError(e) => TransportError::Protocol(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

// ============================================================================
// Properties
// ============================================================================

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn from_field_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(id) = properties.correlation_id {
        basic = basic.with_correlation_id(id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(app_id) = properties.app_id {
        basic = basic.with_app_id(app_id.into());
    }
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(content_encoding) = properties.content_encoding {
        basic = basic.with_content_encoding(content_encoding.into());
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(message_id.into());
    }
    if let Some(expiration) = properties.expiration {
        basic = basic.with_expiration(expiration.into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&properties.headers));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        app_id: text(basic.app_id()),
        content_type: text(basic.content_type()),
        content_encoding: text(basic.content_encoding()),
        message_id: text(basic.message_id()),
        expiration: text(basic.expiration()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT),
        headers: basic
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn from_lapin_delivery(delivery: LapinDelivery, consumer_tag: &str) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        content: delivery.data,
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport {
    _private: (),
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let listeners = Listeners::new();
        let notify = listeners.clone();
        connection.on_error(move |error| {
            warn!(error = %error, "AMQP connection error");
            notify.emit(LifecycleEvent::Error(error.to_string()));
            notify.emit(LifecycleEvent::Closed);
        });

        info!("Connected to AMQP");
        Ok(Arc::new(AmqpConnection {
            connection,
            listeners,
        }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    listeners: Listeners,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.listeners.listen()
    }

    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn Channel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| match map_error(e) {
                TransportError::ChannelClosed(reason) => TransportError::ConnectionClosed(reason),
                other => other,
            })?;
        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(map_error)?;
        }

        let listeners = Listeners::new();
        let notify = listeners.clone();
        let id = channel.id();
        channel.on_error(move |error| {
            warn!(channel = id, error = %error, "AMQP channel error");
            notify.emit(LifecycleEvent::Error(error.to_string()));
            notify.emit(LifecycleEvent::Closed);
        });

        debug!(channel = id, confirm, "AMQP channel created");
        Ok(Arc::new(AmqpChannel {
            channel,
            listeners,
            confirm,
        }))
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error);
        self.listeners.emit(LifecycleEvent::Closed);
        result
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    listeners: Listeners,
    confirm: bool,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.listeners.listen()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                to_basic_properties(properties),
            )
            .await
            .map_err(map_error)?;

        if !self.confirm {
            return Ok(());
        }
        match confirm.await.map_err(map_error)? {
            Confirmation::Nack(_) => Err(TransportError::Nack),
            _ => Ok(()),
        }
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: DeliveryHandler,
        options: ConsumeOptions,
    ) -> Result<String> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or(""),
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let tag = consumer.tag().as_str().to_string();
        let consumer_tag = tag.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => handler(from_lapin_delivery(delivery, &consumer_tag)).await,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Consumer delivery error");
                        break;
                    }
                }
            }
            debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer stream ended");
        });
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error);
        self.listeners.emit(LifecycleEvent::Closed);
        result
    }
}

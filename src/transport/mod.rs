//! Broker transport boundary.
//!
//! This module contains:
//! - `Transport`, `Connection`, `Channel` traits: the wire-level collaborator
//! - `Delivery`, `MessageProperties`: transport-neutral message shapes
//! - `LifecycleEvent`: the `error`/`close` events of connections and channels
//! - Implementations: AMQP (lapin), in-memory

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Channel is closed: {0}")]
    ChannelClosed(String),

    #[error("Connection is closed: {0}")]
    ConnectionClosed(String),

    #[error("Broker rejected the publish")]
    Nack,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl TransportError {
    /// The operation failed because its channel or connection went away.
    /// Retrying on the next channel is expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::ConnectionClosed(_))
    }

    /// The owning connection is already closing; closing it again is redundant.
    pub fn is_connection_closing(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}

// ============================================================================
// Message shapes
// ============================================================================

/// Standard message properties used by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub expiration: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub content: Vec<u8>,
}

/// Queue declaration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Consumer registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Explicit consumer tag; generated by the broker when absent.
    pub consumer_tag: Option<String>,
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Lifecycle notifications of a connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Non-fatal error report.
    Error(String),
    /// The resource is gone (broker-initiated or network failure).
    Closed,
}

/// Callback invoked for each delivery on a consumer.
///
/// Deliveries of one consumer are dispatched sequentially: the next delivery
/// is handed over only after the previous future completes.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// Traits
// ============================================================================

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register a listener for `error`/`close` events.
    ///
    /// Dropping the receiver detaches the listener.
    fn events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent>;

    /// Open a channel, in publisher-confirm mode when `confirm` is set.
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn Channel>>;

    async fn close(&self) -> Result<()>;
}

/// A channel on a broker connection.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Register a listener for `error`/`close` events.
    fn events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent>;

    /// Publish to an exchange. On a confirm channel this resolves only after
    /// the broker acknowledged the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Publish straight to a queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.publish("", queue, body, properties).await
    }

    /// Declare a queue; returns its name.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming; returns the consumer tag.
    async fn consume(
        &self,
        queue: &str,
        handler: DeliveryHandler,
        options: ConsumeOptions,
    ) -> Result<String>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Listener fan-out
// ============================================================================

/// Fan-out list of lifecycle listeners shared by transport implementations.
#[derive(Clone, Default)]
pub struct Listeners {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<LifecycleEvent>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver an event to every attached listener, pruning detached ones.
    pub fn emit(&self, event: LifecycleEvent) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

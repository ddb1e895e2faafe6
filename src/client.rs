//! Client façade.
//!
//! One [`Client`] owns a [`Context`] and the publisher, requester and
//! subscriber built on it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::context::Context;
use crate::error::Result;
use crate::events::{ClientEvent, EventBus};
use crate::publisher::Publisher;
use crate::requester::Requester;
use crate::subscriber::{Layer, Subscriber, UsageParams};
use crate::transport::{MessageProperties, Transport};

/// Publishes, requests and subscribes over one supervised connection.
pub struct Client {
    context: Context,
    publisher: Publisher,
    requester: Requester,
    subscriber: Subscriber,
}

impl Client {
    /// Connect to RabbitMQ at `config.url`.
    #[cfg(feature = "amqp")]
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        Self::with_transport(Arc::new(crate::transport::AmqpTransport::new()), config)
    }

    /// Build a client over any transport.
    pub fn with_transport(transport: Arc<dyn Transport>, config: &ClientConfig) -> Result<Self> {
        Ok(Self::from_context(Context::new(transport, config)?, config))
    }

    /// Build a client with a reconnect policy the configuration cannot express.
    pub fn with_reconnect(
        transport: Arc<dyn Transport>,
        config: &ClientConfig,
        reconnect: ReconnectPolicy,
    ) -> Result<Self> {
        Ok(Self::from_context(
            Context::with_reconnect(transport, config, reconnect)?,
            config,
        ))
    }

    fn from_context(context: Context, config: &ClientConfig) -> Self {
        let publisher = Publisher::new(
            context.confirm_channel().clone(),
            context.events().clone(),
            context.defaults().clone(),
        );
        let requester = Requester::new(
            context.channel().clone(),
            context.events().clone(),
            context.app_id(),
            context.defaults().clone(),
            config.request_timeout(),
        );
        let subscriber = Subscriber::new(
            context.channel().clone(),
            context.confirm_channel().clone(),
            context.events().clone(),
            context.app_id(),
        );
        Self {
            context,
            publisher,
            requester,
            subscriber,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn app_id(&self) -> &str {
        self.context.app_id()
    }

    pub fn connection_id(&self) -> &str {
        self.context.connection_id()
    }

    /// Listen to client events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.context.events().subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        self.context.events()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Publish an event; resolves once the broker confirmed it.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: T,
        options: MessageProperties,
    ) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.publisher
            .publish(exchange, routing_key, payload, options)
            .await
    }

    /// Send straight to a queue; resolves once the broker confirmed it.
    pub async fn send_to_queue<T: Serialize>(
        &self,
        queue: &str,
        payload: T,
        options: MessageProperties,
    ) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.publisher.send_to_queue(queue, payload, options).await
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Send a request and wait for its reply (`{"data": .., "status": ..}`).
    pub async fn request<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: T,
        options: MessageProperties,
    ) -> Result<Value> {
        let payload = serde_json::to_value(payload)?;
        self.requester
            .request(exchange, routing_key, payload, options)
            .await
    }

    pub async fn assert_reply_queue(&self, routing_key: &str) -> Result<String> {
        self.requester.assert_reply_queue(routing_key).await
    }

    pub async fn assert_reply_queues<I, S>(&self, routing_keys: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.requester.assert_reply_queues(routing_keys).await
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Register a usage; returns its queue name.
    pub fn register(&self, params: UsageParams, layers: Vec<Layer>) -> Result<String> {
        self.subscriber.register(params, layers)
    }

    /// Global layers: middlewares run before every usage's own layers,
    /// error handlers after them.
    pub fn register_global(&self, layers: impl IntoIterator<Item = Layer>) {
        self.subscriber.register_global(layers);
    }

    /// Start consuming every registered usage.
    pub fn listen(&self) {
        self.subscriber.listen();
    }

    pub async fn delete_queue(&self, params: &UsageParams) -> Result<()> {
        self.subscriber.delete_queue(params).await
    }

    /// Drain publishes, stop consuming and requesting, then close the
    /// connection.
    ///
    /// The connection is closed even when some publishes were never
    /// confirmed; that failure is returned afterwards.
    pub async fn shutdown(mut self) -> Result<()> {
        let drained = self.publisher.shutdown().await;
        if let Err(error) = &drained {
            warn!(error = %error, "Publishes left unconfirmed at shutdown");
        }
        self.subscriber.shutdown().await;
        self.requester.shutdown().await;
        self.context.close().await;
        info!(connection_id = %self.context.connection_id(), "Client shut down");
        drained
    }
}

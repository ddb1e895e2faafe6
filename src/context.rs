//! Composition root.
//!
//! Wires one connection supervisor into a plain channel (consumers,
//! requests) and a confirm channel (publishes, replies), and holds the
//! identifiers and the event bus every component shares.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::{ChannelOptions, ChannelSupervisor};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::connection::{ConnectOptions, ConnectionSupervisor};
use crate::error::Result;
use crate::events::EventBus;
use crate::logging;
use crate::message::{CONTENT_ENCODING, CONTENT_TYPE};
use crate::transport::{MessageProperties, Transport};

/// Shared wiring of one client.
pub struct Context {
    connection: ConnectionSupervisor,
    channel: ChannelSupervisor,
    confirm_channel: ChannelSupervisor,
    events: EventBus,
    app_id: String,
    defaults: MessageProperties,
    logger: Option<JoinHandle<()>>,
}

impl Context {
    /// Connect through `transport` using the configured reconnect policy.
    pub fn new(transport: Arc<dyn Transport>, config: &ClientConfig) -> Result<Self> {
        Self::with_reconnect(transport, config, config.reconnect_policy())
    }

    /// Connect through `transport` with an explicit reconnect policy.
    pub fn with_reconnect(
        transport: Arc<dyn Transport>,
        config: &ClientConfig,
        reconnect: ReconnectPolicy,
    ) -> Result<Self> {
        config.validate()?;
        let connection_id = config.connection_id();

        let events = EventBus::new();
        let logger = config
            .log_events
            .then(|| logging::attach(&events, &connection_id));

        let connection = ConnectionSupervisor::connect(
            transport,
            &config.url,
            ConnectOptions {
                connection_id: Some(connection_id.clone()),
                reconnect,
            },
        );
        let channel = ChannelSupervisor::open(
            &connection,
            ChannelOptions {
                confirmation_mode: false,
                prefetch: config.prefetch,
            },
        );
        let confirm_channel = ChannelSupervisor::open(
            &connection,
            ChannelOptions {
                confirmation_mode: true,
                prefetch: None,
            },
        );

        let defaults = MessageProperties {
            app_id: Some(config.app_id.clone()),
            content_type: Some(CONTENT_TYPE.to_string()),
            content_encoding: Some(CONTENT_ENCODING.to_string()),
            ..Default::default()
        };

        info!(
            connection_id = %connection_id,
            app_id = %config.app_id,
            "Client context created"
        );

        Ok(Self {
            connection,
            channel,
            confirm_channel,
            events,
            app_id: config.app_id.clone(),
            defaults,
            logger,
        })
    }

    pub fn connection(&self) -> &ConnectionSupervisor {
        &self.connection
    }

    /// Plain channel: consumers and requests.
    pub fn channel(&self) -> &ChannelSupervisor {
        &self.channel
    }

    /// Confirm channel: publishes and replies.
    pub fn confirm_channel(&self) -> &ChannelSupervisor {
        &self.confirm_channel
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// Properties stamped on every outgoing message.
    pub fn defaults(&self) -> &MessageProperties {
        &self.defaults
    }

    /// Close both channels, then the connection.
    pub async fn close(&mut self) {
        self.channel.close().await;
        self.confirm_channel.close().await;
        self.connection.close().await;
        if let Some(logger) = self.logger.take() {
            logger.abort();
        }
    }
}

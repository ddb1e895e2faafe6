//! amqp-courier - resilient AMQP client layer
//!
//! Keeps a broker connection and its channels alive across failures, and
//! builds publishing, correlated request/reply and middleware-based
//! subscriptions on top of them.
//!
//! The broker is reached through the [`transport`] traits: RabbitMQ via
//! lapin (feature `amqp`) or the in-process [`transport::MemoryBroker`].

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod publisher;
pub mod requester;
pub mod subscriber;
pub mod transport;
pub mod utils;

pub use client::Client;
pub use config::{ClientConfig, ReconnectConfig, ReconnectPolicy};
pub use error::{ClientError, HandlerError, Result};
pub use events::{ClientEvent, EventBus, MessageSummary};
pub use message::{IncomingMessage, OutgoingMessage};
pub use subscriber::{
    error_handler, middleware, Flow, HandlerContext, HandlerResult, Layer, UsageParams,
};
pub use transport::MessageProperties;

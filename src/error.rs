//! Client error types.

use std::time::Duration;

use crate::transport::TransportError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error raised or passed on by a subscriber middleware.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the public client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Request <{short_id}> timeout after {}ms", timeout.as_millis())]
    Timeout { short_id: String, timeout: Duration },

    /// The responder answered with an error payload (`{error, status}`).
    #[error("Request rejected: {0}")]
    Rejected(serde_json::Value),

    #[error("Message has no replyTo, cannot respond")]
    MissingReplyTo,

    #[error("Message <{0}> was already acknowledged or rejected")]
    AlreadySettled(String),

    #[error("{count} publish(es) were never confirmed by the broker")]
    Unconfirmed { count: usize },

    #[error("Connection is closed")]
    Closed,

    #[error("Client is shutting down")]
    ShutDown,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Error payload carried by a rejected request, if any.
    pub fn rejection(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Rejected(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

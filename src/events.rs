//! Client observability events.
//!
//! Components emit a [`ClientEvent`] at each step of a message's life. The
//! [`EventBus`] fans them out to any number of listeners; the `logging`
//! module renders them through `tracing`.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::message::{IncomingMessage, OutgoingMessage};

const EVENT_BUS_CAPACITY: usize = 1024;

/// What the observability layer knows about a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSummary {
    pub id: Option<String>,
    pub short_id: Option<String>,
    /// Logical routing key, or the queue name for direct sends.
    pub routing_key: String,
    /// Sender's app id.
    pub app_id: Option<String>,
    pub reply_to: Option<String>,
    pub request_id: Option<String>,
    /// Usage that handled the message, for inbound messages.
    pub handler_id: Option<String>,
    pub payload: Value,
}

impl From<&OutgoingMessage> for MessageSummary {
    fn from(message: &OutgoingMessage) -> Self {
        Self {
            id: Some(message.id().to_string()),
            short_id: Some(message.short_id().to_string()),
            routing_key: message.routing_key().to_string(),
            app_id: message.app_id().map(str::to_string),
            reply_to: message.reply_to().map(str::to_string),
            request_id: message.request_id().map(str::to_string),
            handler_id: None,
            payload: message.payload().clone(),
        }
    }
}

impl From<&IncomingMessage> for MessageSummary {
    fn from(message: &IncomingMessage) -> Self {
        Self {
            id: message.id().map(str::to_string),
            short_id: message.short_id().map(str::to_string),
            routing_key: message.routing_key().to_string(),
            app_id: message.app_id().map(str::to_string),
            reply_to: message.reply_to().map(str::to_string),
            request_id: message.request_id().map(str::to_string),
            handler_id: None,
            payload: message.payload().clone(),
        }
    }
}

impl MessageSummary {
    pub fn with_handler_id(mut self, handler_id: Option<&str>) -> Self {
        self.handler_id = handler_id.map(str::to_string);
        self
    }
}

/// Observability signal emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A publish was confirmed by the broker.
    EventPublished(MessageSummary),
    RequestSent(MessageSummary),
    EventReceived(MessageSummary),
    RequestReceived(MessageSummary),
    EventAck(MessageSummary),
    EventNack { message: MessageSummary, requeue: bool },
    ResponseSuccessSent { message: MessageSummary, payload: Value },
    ResponseErrorSent { message: MessageSummary, payload: Value },
    ResponseSuccessReceived(MessageSummary),
    ResponseErrorReceived(MessageSummary),
    /// A reply queue is consuming.
    QueueConfigured { queue: String },
    /// A usage queue is bound and consuming.
    RequestQueueConfigured { queue: String },
    QueueDeleted { queue: String },
    /// Every usage was re-bound on a new channel.
    Resubscribed,
}

impl ClientEvent {
    /// Dotted event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EventPublished(_) => "event.published",
            Self::RequestSent(_) => "request.sent",
            Self::EventReceived(_) => "event.received",
            Self::RequestReceived(_) => "request.received",
            Self::EventAck(_) => "event.ack",
            Self::EventNack { .. } => "event.nack",
            Self::ResponseSuccessSent { .. } => "response.success.sent",
            Self::ResponseErrorSent { .. } => "response.error.sent",
            Self::ResponseSuccessReceived(_) => "response.success.received",
            Self::ResponseErrorReceived(_) => "response.error.received",
            Self::QueueConfigured { .. } => "queue.configured",
            Self::RequestQueueConfigured { .. } => "requestQueue.configured",
            Self::QueueDeleted { .. } => "queue.deleted",
            Self::Resubscribed => "resubscribed",
        }
    }

    /// Message the event is about, if any.
    pub fn message(&self) -> Option<&MessageSummary> {
        match self {
            Self::EventPublished(message)
            | Self::RequestSent(message)
            | Self::EventReceived(message)
            | Self::RequestReceived(message)
            | Self::EventAck(message)
            | Self::ResponseSuccessReceived(message)
            | Self::ResponseErrorReceived(message)
            | Self::EventNack { message, .. }
            | Self::ResponseSuccessSent { message, .. }
            | Self::ResponseErrorSent { message, .. } => Some(message),
            Self::QueueConfigured { .. }
            | Self::RequestQueueConfigured { .. }
            | Self::QueueDeleted { .. }
            | Self::Resubscribed => None,
        }
    }
}

/// Multi-listener event fan-out.
///
/// Emitting never blocks; listeners that fall behind by more than the bus
/// capacity lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: ClientEvent) {
        // No listeners is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_every_listener() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ClientEvent::Resubscribed);

        assert_eq!(a.recv().await.unwrap(), ClientEvent::Resubscribed);
        assert_eq!(b.recv().await.unwrap(), ClientEvent::Resubscribed);
    }

    #[test]
    fn test_emit_without_listeners_is_silent() {
        EventBus::new().emit(ClientEvent::QueueDeleted {
            queue: "q".into(),
        });
    }

    #[test]
    fn test_names() {
        let message = MessageSummary::from(&OutgoingMessage::to_queue(
            "jobs",
            json!({}),
            Default::default(),
        ));
        assert_eq!(ClientEvent::EventPublished(message.clone()).name(), "event.published");
        assert_eq!(
            ClientEvent::EventNack {
                message: message.clone(),
                requeue: false
            }
            .name(),
            "event.nack"
        );
        assert_eq!(
            ClientEvent::RequestQueueConfigured { queue: "q".into() }.name(),
            "requestQueue.configured"
        );
        assert_eq!(ClientEvent::Resubscribed.message(), None);
        assert_eq!(
            ClientEvent::EventAck(message.clone()).message().map(|m| m.routing_key.as_str()),
            Some("jobs")
        );
    }
}

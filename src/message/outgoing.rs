use serde_json::Value;
use uuid::Uuid;

use super::{find_request_id, is_truthy, short, to_bytes, CONTENT_ENCODING, CONTENT_TYPE};
use crate::error::{ClientError, Result};
use crate::transport::MessageProperties;

/// Where an outgoing message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An exchange plus routing key.
    Exchange { exchange: String, routing_key: String },
    /// A queue, through the default exchange.
    Queue(String),
}

/// Arguments handed to a channel's `publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishArgs {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message about to be published.
///
/// `id()` is always the correlation id; one is generated when the caller did
/// not supply it. The only field that may change after construction is
/// `reply_to`, and only once.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    destination: Destination,
    payload: Value,
    properties: MessageProperties,
}

impl OutgoingMessage {
    pub fn new(destination: Destination, payload: Value, mut properties: MessageProperties) -> Self {
        if properties.correlation_id.is_none() {
            properties.correlation_id = Some(Uuid::new_v4().to_string());
        }
        if properties.content_type.is_none() {
            properties.content_type = Some(CONTENT_TYPE.to_string());
        }
        if properties.content_encoding.is_none() {
            properties.content_encoding = Some(CONTENT_ENCODING.to_string());
        }
        Self {
            destination,
            payload,
            properties,
        }
    }

    /// Message published to `exchange` with `routing_key`.
    pub fn to_exchange(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Value,
        properties: MessageProperties,
    ) -> Self {
        let destination = Destination::Exchange {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        };
        Self::new(destination, payload, properties)
    }

    /// Message sent straight to `queue`.
    pub fn to_queue(queue: impl Into<String>, payload: Value, properties: MessageProperties) -> Self {
        Self::new(Destination::Queue(queue.into()), payload, properties)
    }

    pub fn id(&self) -> &str {
        self.properties.correlation_id.as_deref().unwrap_or_default()
    }

    pub fn short_id(&self) -> &str {
        short(self.id())
    }

    pub fn app_id(&self) -> Option<&str> {
        self.properties.app_id.as_deref()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Routing key for exchange messages, queue name for direct sends.
    pub fn routing_key(&self) -> &str {
        match &self.destination {
            Destination::Exchange { routing_key, .. } => routing_key,
            Destination::Queue(queue) => queue,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// True when the payload carries a truthy `error` field.
    pub fn has_error(&self) -> bool {
        is_truthy(self.payload.get("error"))
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        find_request_id(&self.properties.headers)
    }

    /// Set the reply queue. Fails if one is already set.
    pub fn set_reply_to(&mut self, queue: impl Into<String>) -> Result<()> {
        if let Some(existing) = &self.properties.reply_to {
            return Err(ClientError::Config(format!(
                "replyTo of <{}> is already set to {existing}",
                self.short_id()
            )));
        }
        self.properties.reply_to = Some(queue.into());
        Ok(())
    }

    /// Channel publish arguments: destination, encoded body, properties.
    pub fn to_args(&self) -> Result<PublishArgs> {
        let (exchange, routing_key) = match &self.destination {
            Destination::Exchange {
                exchange,
                routing_key,
            } => (exchange.clone(), routing_key.clone()),
            Destination::Queue(queue) => (String::new(), queue.clone()),
        };
        Ok(PublishArgs {
            exchange,
            routing_key,
            body: to_bytes(&self.payload)?,
            properties: self.properties.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::from_bytes;
    use serde_json::json;

    fn message() -> OutgoingMessage {
        let properties = MessageProperties {
            app_id: Some("appId".into()),
            ..Default::default()
        };
        OutgoingMessage::to_exchange("exchange", "routingKey", json!({"foo": "bar"}), properties)
    }

    #[test]
    fn test_id_is_generated_uuid() {
        let message = message();
        assert!(Uuid::parse_str(message.id()).is_ok());
        assert_eq!(message.properties().correlation_id.as_deref(), Some(message.id()));
    }

    #[test]
    fn test_explicit_correlation_id_is_kept() {
        let properties = MessageProperties {
            correlation_id: Some("abcdef0123456789".into()),
            ..Default::default()
        };
        let message = OutgoingMessage::to_queue("q", json!(null), properties);
        assert_eq!(message.id(), "abcdef0123456789");
        assert_eq!(message.short_id(), "abcdef01");
    }

    #[test]
    fn test_app_id_and_routing_key() {
        let message = message();
        assert_eq!(message.app_id(), Some("appId"));
        assert_eq!(message.routing_key(), "routingKey");
    }

    #[test]
    fn test_reply_to_is_settable_once() {
        let mut message = message();
        message.set_reply_to("replyTo").unwrap();
        assert_eq!(message.reply_to(), Some("replyTo"));
        assert!(message.set_reply_to("other").is_err());
        assert_eq!(message.to_args().unwrap().properties.reply_to.as_deref(), Some("replyTo"));
    }

    #[test]
    fn test_has_error() {
        assert!(!message().has_error());
        let errored = OutgoingMessage::to_queue("q", json!({"error": "bad one"}), Default::default());
        assert!(errored.has_error());
    }

    #[test]
    fn test_to_args_for_exchange() {
        let args = message().to_args().unwrap();
        assert_eq!(args.exchange, "exchange");
        assert_eq!(args.routing_key, "routingKey");
        assert_eq!(from_bytes(&args.body).unwrap(), json!({"foo": "bar"}));
        assert_eq!(args.properties.content_type.as_deref(), Some(CONTENT_TYPE));
        assert_eq!(args.properties.content_encoding.as_deref(), Some(CONTENT_ENCODING));
    }

    #[test]
    fn test_to_args_for_queue_uses_default_exchange() {
        let message = OutgoingMessage::to_queue("jobs", json!([1]), Default::default());
        assert_eq!(message.destination(), &Destination::Queue("jobs".into()));
        let args = message.to_args().unwrap();
        assert_eq!(args.exchange, "");
        assert_eq!(args.routing_key, "jobs");
    }

    #[test]
    fn test_request_id_header_is_case_insensitive() {
        let mut properties = MessageProperties::default();
        properties.headers.insert("X-Request-ID".into(), "req-1".into());
        let message = OutgoingMessage::to_queue("q", json!({}), properties);
        assert_eq!(message.request_id(), Some("req-1"));
    }
}

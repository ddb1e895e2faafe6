use std::sync::OnceLock;

use serde_json::{json, Value};

use super::{find_request_id, from_bytes, is_truthy, short, REPLY_FOR_DELIMITER};
use crate::transport::{Delivery, MessageProperties};

#[derive(Debug)]
struct Parsed {
    payload: Value,
    invalid: bool,
}

/// A delivery received from the broker.
#[derive(Debug)]
pub struct IncomingMessage {
    delivery: Delivery,
    parsed: OnceLock<Parsed>,
}

impl IncomingMessage {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            parsed: OnceLock::new(),
        }
    }

    /// Correlation id.
    pub fn id(&self) -> Option<&str> {
        self.delivery.properties.correlation_id.as_deref()
    }

    pub fn short_id(&self) -> Option<&str> {
        self.id().map(short)
    }

    /// App id of the sender.
    pub fn publisher(&self) -> Option<&str> {
        self.app_id()
    }

    pub fn app_id(&self) -> Option<&str> {
        self.delivery.properties.app_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.delivery.properties.reply_to.as_deref()
    }

    /// A message with a reply queue is a request; otherwise an event.
    pub fn is_request(&self) -> bool {
        self.reply_to().is_some()
    }

    /// Logical routing key, with any `.replyFor.<suffix>` stripped.
    pub fn routing_key(&self) -> &str {
        let key = self.delivery.routing_key.as_str();
        match key.split_once(REPLY_FOR_DELIMITER) {
            Some((logical, _)) => logical,
            None => key,
        }
    }

    /// Routing key exactly as delivered.
    pub fn raw_routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    pub fn consumer_tag(&self) -> &str {
        &self.delivery.consumer_tag
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn request_id(&self) -> Option<&str> {
        find_request_id(&self.delivery.properties.headers)
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.delivery.properties
    }

    pub fn content(&self) -> &[u8] {
        &self.delivery.content
    }

    fn parsed(&self) -> &Parsed {
        self.parsed.get_or_init(|| match from_bytes(&self.delivery.content) {
            Ok(payload) => Parsed {
                payload,
                invalid: false,
            },
            Err(error) => Parsed {
                payload: json!({ "error": format!("Invalid response: {error}") }),
                invalid: true,
            },
        })
    }

    /// Decode the content as JSON. Never fails: undecodable content yields
    /// `{"error": "Invalid response: ..."}`. The result is memoized.
    pub fn parse(&self) -> &Value {
        &self.parsed().payload
    }

    /// Payload, parsing on first access.
    pub fn payload(&self) -> &Value {
        self.parse()
    }

    /// Content was not valid JSON.
    pub fn is_invalid(&self) -> bool {
        self.parsed().invalid
    }

    /// Content was invalid, or the payload carries a truthy `error` field.
    pub fn has_error(&self) -> bool {
        let parsed = self.parsed();
        parsed.invalid || is_truthy(parsed.payload.get("error"))
    }
}

impl From<Delivery> for IncomingMessage {
    fn from(delivery: Delivery) -> Self {
        Self::new(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn delivery(routing_key: &str, content: &[u8]) -> Delivery {
        Delivery {
            routing_key: routing_key.into(),
            content: content.to_vec(),
            properties: MessageProperties {
                correlation_id: Some(Uuid::new_v4().to_string()),
                app_id: Some("appId".into()),
                reply_to: Some("replyTo".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_derived_fields() {
        let message = IncomingMessage::new(delivery("some.replyFor.someOne", b"{}"));
        let id = message.id().unwrap().to_string();
        assert_eq!(message.short_id(), Some(&id[..8]));
        assert_eq!(message.publisher(), Some("appId"));
        assert_eq!(message.reply_to(), Some("replyTo"));
        assert!(message.is_request());
    }

    #[test]
    fn test_routing_key_strips_reply_suffix() {
        let message = IncomingMessage::new(delivery("some.replyFor.someOne", b"{}"));
        assert_eq!(message.routing_key(), "some");
        assert_eq!(message.raw_routing_key(), "some.replyFor.someOne");
    }

    #[test]
    fn test_routing_key_without_suffix_is_unchanged() {
        let message = IncomingMessage::new(delivery("some", b"{}"));
        assert_eq!(message.routing_key(), "some");
    }

    #[test]
    fn test_parses_content() {
        let message = IncomingMessage::new(delivery("some", br#"{"foo":"bar"}"#));
        assert_eq!(message.parse(), &json!({"foo": "bar"}));
        assert!(!message.has_error());
    }

    #[test]
    fn test_invalid_content_yields_error_payload() {
        let message = IncomingMessage::new(delivery("some", br#"{"foo":"bar"}123"#));
        let payload = message.parse().clone();
        assert!(message.has_error());
        assert!(message.is_invalid());
        let error = payload["error"].as_str().unwrap();
        assert!(error.starts_with("Invalid response: "));
    }

    #[test]
    fn test_error_payload_sets_has_error() {
        let message = IncomingMessage::new(delivery("some", br#"{"error":"error"}"#));
        assert!(message.has_error());
        assert!(!message.is_invalid());
    }

    #[test]
    fn test_parse_is_memoized() {
        let message = IncomingMessage::new(delivery("some", b"[1,2]"));
        let first: *const Value = message.parse();
        let second: *const Value = message.parse();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_correlation_id() {
        let mut raw = delivery("some", b"{}");
        raw.properties.correlation_id = None;
        let message = IncomingMessage::from(raw);
        assert_eq!(message.id(), None);
        assert_eq!(message.short_id(), None);
    }
}

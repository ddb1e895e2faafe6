//! Message envelopes and the JSON wire codec.
//!
//! Payloads travel as UTF-8 JSON, pretty-printed with tab indentation.
//! Decoding accepts any whitespace.

mod incoming;
mod outgoing;

pub use incoming::IncomingMessage;
pub use outgoing::{Destination, OutgoingMessage, PublishArgs};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use crate::transport::MessageProperties;

/// `contentType` set on published messages.
pub const CONTENT_TYPE: &str = "application/json";
/// `contentEncoding` set on published messages.
pub const CONTENT_ENCODING: &str = "utf-8";

/// Separator between a logical routing key and the reply-queue suffix.
pub const REPLY_FOR_DELIMITER: &str = ".replyFor.";

/// Header carrying an end-to-end request id (matched case-insensitively).
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Encode a value as tab-indented JSON bytes.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    Ok(buffer)
}

/// Decode JSON bytes.
pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Value> {
    serde_json::from_slice(bytes)
}

/// JavaScript-style truthiness of an optional JSON value.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// First eight characters of an id, as shown in logs.
pub(crate) fn short(id: &str) -> &str {
    id.char_indices()
        .nth(8)
        .map(|(index, _)| &id[..index])
        .unwrap_or(id)
}

/// Fill the unset fields of `primary` from `fallback`.
///
/// Headers are merged; `primary` wins on conflicting keys.
pub fn with_defaults(
    mut primary: MessageProperties,
    fallback: &MessageProperties,
) -> MessageProperties {
    fn fill(slot: &mut Option<String>, fallback: &Option<String>) {
        if slot.is_none() {
            slot.clone_from(fallback);
        }
    }
    fill(&mut primary.correlation_id, &fallback.correlation_id);
    fill(&mut primary.reply_to, &fallback.reply_to);
    fill(&mut primary.app_id, &fallback.app_id);
    fill(&mut primary.content_type, &fallback.content_type);
    fill(&mut primary.content_encoding, &fallback.content_encoding);
    fill(&mut primary.message_id, &fallback.message_id);
    fill(&mut primary.expiration, &fallback.expiration);
    primary.persistent |= fallback.persistent;
    for (key, value) in &fallback.headers {
        primary
            .headers
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    primary
}

/// Case-insensitive lookup of the request id header.
pub(crate) fn find_request_id(
    headers: &std::collections::BTreeMap<String, String>,
) -> Option<&str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(REQUEST_ID_HEADER))
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_bytes_uses_tab_indentation() {
        let bytes = to_bytes(&json!({"foo": "bar"})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\n\t\"foo\": \"bar\"\n}");
    }

    #[test]
    fn test_codec_is_idempotent() {
        let value = json!({"nested": {"list": [1, 2.5, "x", null, true]}, "empty": {}});
        let once = to_bytes(&value).unwrap();
        let twice = to_bytes(&from_bytes(&once).unwrap()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(from_bytes(&twice).unwrap(), value);
    }

    #[test]
    fn test_from_bytes_tolerates_any_whitespace() {
        let value = from_bytes(b" {\r\n  \"a\" :\t1 }\n").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(null))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(is_truthy(Some(&json!("bad one"))));
        assert!(is_truthy(Some(&json!({"message": "x"}))));
    }

    #[test]
    fn test_with_defaults_keeps_primary_values() {
        let mut primary = MessageProperties {
            app_id: Some("caller".into()),
            ..Default::default()
        };
        primary.headers.insert("x-request-id".into(), "1".into());
        let mut fallback = MessageProperties {
            app_id: Some("default".into()),
            content_type: Some(CONTENT_TYPE.into()),
            ..Default::default()
        };
        fallback.headers.insert("x-request-id".into(), "2".into());
        fallback.headers.insert("tenant".into(), "acme".into());

        let merged = with_defaults(primary, &fallback);
        assert_eq!(merged.app_id.as_deref(), Some("caller"));
        assert_eq!(merged.content_type.as_deref(), Some(CONTENT_TYPE));
        assert_eq!(merged.headers["x-request-id"], "1");
        assert_eq!(merged.headers["tenant"], "acme");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}

//! Renders client events through `tracing`.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ClientEvent, EventBus, MessageSummary};

/// Spawn a task that logs every event emitted on `events`.
///
/// The task ends once every emitter is dropped.
pub fn attach(events: &EventBus, connection_id: &str) -> JoinHandle<()> {
    let mut receiver = events.subscribe();
    let connection_id = connection_id.to_string();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&connection_id, &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Event log lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(connection_id: &str, event: &ClientEvent) {
    let line = describe(event);
    let summary = event.message();
    info!(
        connection_id = %connection_id,
        event = event.name(),
        short_id = summary.and_then(|m| m.short_id.as_deref()),
        routing_key = summary.map(|m| m.routing_key.as_str()),
        app_id = summary.and_then(|m| m.app_id.as_deref()),
        request_id = summary.and_then(|m| m.request_id.as_deref()),
        "{line}"
    );
    if let Some(payload) = body(event) {
        debug!(event = event.name(), payload = %payload, "Message body");
    }
}

fn body(event: &ClientEvent) -> Option<&serde_json::Value> {
    match event {
        ClientEvent::ResponseSuccessSent { payload, .. }
        | ClientEvent::ResponseErrorSent { payload, .. } => Some(payload),
        ClientEvent::EventAck(_) | ClientEvent::EventNack { .. } => None,
        other => other.message().map(|m| &m.payload),
    }
}

fn tagged(kind: &str, message: &MessageSummary) -> String {
    match &message.short_id {
        Some(short_id) => format!("{kind}<{short_id}>"),
        None => kind.to_string(),
    }
}

fn from_publisher(message: &MessageSummary, lead: &str) -> Option<String> {
    message
        .app_id
        .as_ref()
        .map(|app_id| format!("{lead} '{app_id}'"))
}

fn by_handler(message: &MessageSummary) -> Option<String> {
    message
        .handler_id
        .as_ref()
        .map(|handler_id| format!("by '{handler_id}'"))
}

fn join(parts: Vec<Option<String>>) -> String {
    parts.into_iter().flatten().collect::<Vec<_>>().join(" ")
}

/// One-line human description of an event.
pub fn describe(event: &ClientEvent) -> String {
    match event {
        ClientEvent::EventPublished(m) => join(vec![
            Some(tagged("EVENT", m)),
            Some(format!("published to '{}'", m.routing_key)),
        ]),
        ClientEvent::EventReceived(m) => join(vec![
            Some(tagged("EVENT", m)),
            Some(format!("'{}'", m.routing_key)),
            from_publisher(m, "received from").or_else(|| Some("is received".into())),
            by_handler(m),
        ]),
        ClientEvent::EventAck(m) => join(vec![
            Some(tagged("EVENT", m)),
            Some(format!("'{}'", m.routing_key)),
            from_publisher(m, "received from"),
            Some("is acknowledged".into()),
            by_handler(m),
        ]),
        ClientEvent::EventNack { message: m, requeue } => join(vec![
            Some(tagged("EVENT", m)),
            Some(format!("'{}'", m.routing_key)),
            from_publisher(m, "received from"),
            Some(if *requeue { "is requeued" } else { "is rejected" }.into()),
            by_handler(m),
        ]),
        ClientEvent::RequestSent(m) => join(vec![
            Some(tagged("REQUEST", m)),
            Some(format!("for '{}'", m.routing_key)),
            from_publisher(m, "sent by").or_else(|| Some("is sent".into())),
        ]),
        ClientEvent::RequestReceived(m) => join(vec![
            Some(tagged("REQUEST", m)),
            Some(format!("for '{}'", m.routing_key)),
            from_publisher(m, "received from").or_else(|| Some("is received".into())),
        ]),
        ClientEvent::ResponseSuccessSent { message: m, .. } => {
            response_sent("RESPONSE:SUCCESS", m)
        }
        ClientEvent::ResponseErrorSent { message: m, .. } => response_sent("RESPONSE:ERROR", m),
        ClientEvent::ResponseSuccessReceived(m) => join(vec![
            Some(tagged("RESPONSE:SUCCESS", m)),
            Some(format!("is received in reply to '{}'", m.routing_key)),
            from_publisher(m, "from"),
        ]),
        ClientEvent::ResponseErrorReceived(m) => join(vec![
            Some(tagged("RESPONSE:ERROR", m)),
            Some(format!("is received in reply to '{}'", m.routing_key)),
            from_publisher(m, "from"),
        ]),
        ClientEvent::QueueConfigured { queue } => {
            format!("QUEUE {queue} is listening for replies")
        }
        ClientEvent::RequestQueueConfigured { queue } => {
            format!("QUEUE {queue} is listening for requests")
        }
        ClientEvent::QueueDeleted { queue } => format!("QUEUE {queue} is deleted"),
        ClientEvent::Resubscribed => "Usages are bound on a new channel".to_string(),
    }
}

fn response_sent(kind: &str, m: &MessageSummary) -> String {
    join(vec![
        Some(tagged(kind, m)),
        Some(format!("is sent in reply to '{}'", m.routing_key)),
        from_publisher(m, "from"),
        m.reply_to.as_ref().map(|reply_to| format!("via '{reply_to}'")),
    ])
}

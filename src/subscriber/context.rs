use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::channel::{ChannelHandle, ChannelSupervisor};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus, MessageSummary};
use crate::message::{to_bytes, IncomingMessage};
use crate::transport::MessageProperties;

/// `contentEncoding` of replies. Swapped with `contentType` on the wire.
pub const REPLY_CONTENT_ENCODING: &str = "application/json";
/// `contentType` of replies.
pub const REPLY_CONTENT_TYPE: &str = "utf-8";

pub const DEFAULT_SUCCESS_STATUS: u16 = 200;
pub const DEFAULT_ERROR_STATUS: u16 = 500;

struct Inner {
    message: IncomingMessage,
    source: ChannelHandle,
    replies: ChannelSupervisor,
    events: EventBus,
    app_id: String,
    handler_id: Option<String>,
    settled: AtomicBool,
}

/// Settlement and reply operations for one delivery.
///
/// A delivery is settled at most once: after `ack`, `reject`, `respond` or
/// `reject_and_respond`, any further settlement fails with
/// [`ClientError::AlreadySettled`].
#[derive(Clone)]
pub struct HandlerContext {
    inner: Arc<Inner>,
}

impl HandlerContext {
    pub(crate) fn new(
        message: IncomingMessage,
        source: ChannelHandle,
        replies: ChannelSupervisor,
        events: EventBus,
        app_id: String,
        handler_id: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                message,
                source,
                replies,
                events,
                app_id,
                handler_id,
                settled: AtomicBool::new(false),
            }),
        }
    }

    pub fn message(&self) -> &IncomingMessage {
        &self.inner.message
    }

    pub fn handler_id(&self) -> Option<&str> {
        self.inner.handler_id.as_deref()
    }

    /// The delivery carries a reply queue.
    pub fn is_request(&self) -> bool {
        self.inner.message.is_request()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    fn summary(&self) -> MessageSummary {
        MessageSummary::from(&self.inner.message).with_handler_id(self.handler_id())
    }

    fn settle(&self) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            let id = self.inner.message.short_id().unwrap_or_default().to_string();
            warn!(
                short_id = %id,
                routing_key = %self.inner.message.routing_key(),
                "Message already settled"
            );
            return Err(ClientError::AlreadySettled(id));
        }
        Ok(())
    }

    /// Acknowledge the delivery.
    pub async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.inner.events.emit(ClientEvent::EventAck(self.summary()));
        self.inner
            .source
            .channel()
            .ack(self.inner.message.delivery_tag())
            .await?;
        Ok(())
    }

    /// Reject the delivery, putting it back on the queue when `requeue` is set.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.inner.events.emit(ClientEvent::EventNack {
            message: self.summary(),
            requeue,
        });
        self.inner
            .source
            .channel()
            .reject(self.inner.message.delivery_tag(), requeue)
            .await?;
        Ok(())
    }

    /// Ack and reply `{"data": payload, "status": 200}`.
    pub async fn respond(&self, payload: Value) -> Result<()> {
        self.respond_with_status(payload, DEFAULT_SUCCESS_STATUS)
            .await
    }

    /// Ack and reply `{"data": payload, "status": status}`.
    pub async fn respond_with_status(&self, payload: Value, status: u16) -> Result<()> {
        let reply_to = self.reply_to()?;
        self.settle()?;
        let body = json!({ "data": payload, "status": status });
        self.inner.events.emit(ClientEvent::ResponseSuccessSent {
            message: self.summary(),
            payload: body.clone(),
        });
        self.inner
            .source
            .channel()
            .ack(self.inner.message.delivery_tag())
            .await?;
        self.send_reply(&reply_to, &body).await
    }

    /// Reject without requeue and reply `{"error": payload, "status": 500}`.
    pub async fn reject_and_respond(&self, payload: Value) -> Result<()> {
        self.reject_and_respond_with_status(payload, DEFAULT_ERROR_STATUS)
            .await
    }

    /// Reject without requeue and reply `{"error": payload, "status": status}`.
    pub async fn reject_and_respond_with_status(&self, payload: Value, status: u16) -> Result<()> {
        let reply_to = self.reply_to()?;
        self.settle()?;
        let body = json!({ "error": payload, "status": status });
        self.inner.events.emit(ClientEvent::ResponseErrorSent {
            message: self.summary(),
            payload: body.clone(),
        });
        self.inner
            .source
            .channel()
            .reject(self.inner.message.delivery_tag(), false)
            .await?;
        self.send_reply(&reply_to, &body).await
    }

    fn reply_to(&self) -> Result<String> {
        self.inner
            .message
            .reply_to()
            .map(str::to_string)
            .ok_or(ClientError::MissingReplyTo)
    }

    async fn send_reply(&self, reply_to: &str, body: &Value) -> Result<()> {
        let properties = MessageProperties {
            app_id: Some(self.inner.app_id.clone()),
            correlation_id: self.inner.message.id().map(str::to_string),
            content_encoding: Some(REPLY_CONTENT_ENCODING.to_string()),
            content_type: Some(REPLY_CONTENT_TYPE.to_string()),
            ..Default::default()
        };
        self.inner
            .replies
            .send_to_queue(reply_to, to_bytes(body)?, properties)
            .await
    }
}

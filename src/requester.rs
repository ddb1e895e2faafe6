//! Requester: request/reply correlation over exclusive reply queues.
//!
//! Each logical routing key gets its own reply queue per channel instance,
//! named `<routingKey>.replyFor.<appId>.<channelId>`. Replies are matched to
//! pending requests by correlation id; unknown ids are dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{ChannelHandle, ChannelState, ChannelSupervisor};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus, MessageSummary};
use crate::message::{with_defaults, IncomingMessage, OutgoingMessage, REPLY_FOR_DELIMITER};
use crate::transport::{self, ConsumeOptions, Delivery, DeliveryHandler, MessageProperties, QueueOptions};

/// Reply queues are private to this client and vanish with it.
pub fn reply_queue_options() -> QueueOptions {
    QueueOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
    }
}

/// Reply queue name for `routing_key` on the given channel instance.
pub fn reply_queue_name(routing_key: &str, app_id: &str, channel_id: &str) -> String {
    format!("{routing_key}{REPLY_FOR_DELIMITER}{app_id}.{channel_id}")
}

#[derive(Default)]
struct ReplyQueues {
    /// Channel the memoized queues were declared on.
    channel_id: Option<String>,
    queues: HashMap<String, Arc<OnceCell<String>>>,
    /// Every routing key a reply queue was ever requested for.
    known: BTreeSet<String>,
}

struct Inner {
    channel: ChannelSupervisor,
    events: EventBus,
    app_id: String,
    defaults: MessageProperties,
    timeout: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<IncomingMessage>>>,
    replies: Mutex<ReplyQueues>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<IncomingMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replies(&self) -> MutexGuard<'_, ReplyQueues> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve_reply(&self, delivery: Delivery) {
        let reply = IncomingMessage::new(delivery);
        let Some(id) = reply.id() else {
            debug!(routing_key = %reply.routing_key(), "Reply without correlation id dropped");
            return;
        };

        let Some(waiter) = self.pending().remove(id) else {
            debug!(
                short_id = ?reply.short_id(),
                routing_key = %reply.routing_key(),
                "Late reply dropped"
            );
            return;
        };

        reply.parse();
        let summary = MessageSummary::from(&reply);
        self.events.emit(if reply.has_error() {
            ClientEvent::ResponseErrorReceived(summary)
        } else {
            ClientEvent::ResponseSuccessReceived(summary)
        });
        let _ = waiter.send(reply);
    }
}

/// Removes a pending request however its wait ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.id);
    }
}

/// Sends requests and awaits their correlated replies.
#[derive(Clone)]
pub struct Requester {
    inner: Arc<Inner>,
}

impl Requester {
    /// `channel` should be a plain (non-confirm) channel. `defaults` take
    /// precedence over caller-supplied properties.
    pub fn new(
        channel: ChannelSupervisor,
        events: EventBus,
        app_id: impl Into<String>,
        defaults: MessageProperties,
        timeout: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            channel,
            events,
            app_id: app_id.into(),
            defaults,
            timeout,
            pending: Mutex::new(HashMap::new()),
            replies: Mutex::new(ReplyQueues::default()),
            shutdown,
            task: Mutex::new(None),
        });

        let requester = Self { inner };
        let task = tokio::spawn(requester.clone().watch_channel(shutdown_rx));
        *requester
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        requester
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.inner.pending().len()
    }

    /// Publish a request and wait for its reply.
    ///
    /// Resolves with the reply payload (`{"data": .., "status": ..}`), or
    /// fails with [`ClientError::Rejected`] carrying an error reply, or
    /// [`ClientError::Timeout`] when no reply arrives in time.
    pub async fn request(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        options: MessageProperties,
    ) -> Result<Value> {
        let mut properties = with_defaults(self.inner.defaults.clone(), &options);
        properties.reply_to = None;
        properties.correlation_id = None;
        let mut message = OutgoingMessage::to_exchange(exchange, routing_key, payload, properties);

        let (waiter, reply) = oneshot::channel();
        let _guard = PendingGuard {
            inner: &self.inner,
            id: message.id().to_string(),
        };
        self.inner.pending().insert(message.id().to_string(), waiter);

        let short_id = message.short_id().to_string();
        let flow = async {
            let reply_to = self.assert_reply_queue(routing_key).await?;
            message.set_reply_to(reply_to)?;
            let args = message.to_args()?;
            self.inner
                .channel
                .publish(&args.exchange, &args.routing_key, args.body, args.properties)
                .await?;
            self.inner
                .events
                .emit(ClientEvent::RequestSent(MessageSummary::from(&message)));
            reply.await.map_err(|_| ClientError::ShutDown)
        };

        let reply = match tokio::time::timeout(self.inner.timeout, flow).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(short_id = %short_id, routing_key = %routing_key, "Request timed out");
                return Err(ClientError::Timeout {
                    short_id,
                    timeout: self.inner.timeout,
                });
            }
        };

        let payload = reply.parse().clone();
        if reply.has_error() {
            Err(ClientError::Rejected(payload))
        } else {
            Ok(payload)
        }
    }

    /// Declare and consume the reply queue for `routing_key`.
    ///
    /// Memoized per channel instance; returns the queue name.
    pub async fn assert_reply_queue(&self, routing_key: &str) -> Result<String> {
        loop {
            let handle = self.inner.channel.ready().await?;
            let cell = {
                let mut replies = self.inner.replies();
                if replies.channel_id.as_deref() != Some(handle.id()) {
                    replies.channel_id = Some(handle.id().to_string());
                    replies.queues.clear();
                }
                replies.known.insert(routing_key.to_string());
                Arc::clone(replies.queues.entry(routing_key.to_string()).or_default())
            };

            let name = reply_queue_name(routing_key, &self.inner.app_id, handle.id());
            match cell
                .get_or_try_init(|| self.declare_reply_queue(&handle, name))
                .await
            {
                Ok(name) => return Ok(name.clone()),
                Err(error) if error.is_transient() => {
                    debug!(routing_key = %routing_key, error = %error, "Reply queue lost, retrying");
                    self.forget_channel(handle.id());
                    self.wait_for_replacement(handle.id()).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Pre-warm reply queues for several routing keys in parallel.
    pub async fn assert_reply_queues<I, S>(&self, routing_keys: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = routing_keys
            .into_iter()
            .map(|key| key.as_ref().to_string())
            .collect();
        join_all(keys.iter().map(|key| self.assert_reply_queue(key)))
            .await
            .into_iter()
            .collect()
    }

    async fn declare_reply_queue(
        &self,
        handle: &ChannelHandle,
        name: String,
    ) -> transport::Result<String> {
        let channel = handle.channel();
        channel.assert_queue(&name, reply_queue_options()).await?;

        let inner = Arc::clone(&self.inner);
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            inner.resolve_reply(delivery);
            async {}.boxed()
        });
        let options = ConsumeOptions {
            no_ack: true,
            ..Default::default()
        };
        channel.consume(&name, handler, options).await?;

        self.inner
            .events
            .emit(ClientEvent::QueueConfigured { queue: name.clone() });
        Ok(name)
    }

    fn forget_channel(&self, channel_id: &str) {
        let mut replies = self.inner.replies();
        if replies.channel_id.as_deref() == Some(channel_id) {
            replies.channel_id = None;
            replies.queues.clear();
        }
    }

    async fn wait_for_replacement(&self, channel_id: &str) -> Result<()> {
        self.inner
            .channel
            .subscribe()
            .find_map(|state| match state {
                ChannelState::Open(handle) if handle.id() != channel_id => Some(()),
                _ => None,
            })
            .await
            .ok_or(ClientError::Closed)
    }

    /// Clear the registry when the channel closes and re-declare every known
    /// reply queue on the next one.
    async fn watch_channel(self, mut shutdown: watch::Receiver<bool>) {
        let mut states = self.inner.channel.subscribe();
        loop {
            let state = tokio::select! {
                state = states.next() => state,
                _ = shutdown.changed() => break,
            };
            match state {
                Some(ChannelState::Closed) => {
                    let mut replies = self.inner.replies();
                    replies.channel_id = None;
                    replies.queues.clear();
                }
                Some(ChannelState::Open(_)) => {
                    let known: Vec<String> = self.inner.replies().known.iter().cloned().collect();
                    if known.is_empty() {
                        continue;
                    }
                    let requester = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = requester.assert_reply_queues(&known).await {
                            warn!(error = %error, "Failed to re-declare reply queues");
                        }
                    });
                }
                None => break,
            }
        }
    }

    /// Fail every pending request and stop following the channel.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let dropped: Vec<_> = self.inner.pending().drain().collect();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Abandoning pending requests");
        }
        drop(dropped);

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

//! Subscriber: usages, re-binding on reconnect, and middleware dispatch.
//!
//! A usage is a queue, its bindings and a middleware chain. `listen` binds
//! every usage on each new channel; each delivery is parsed, announced and
//! run through the global middlewares, then the usage's own layers, then the
//! global error handlers.

mod context;
mod middleware;

pub use context::{
    HandlerContext, DEFAULT_ERROR_STATUS, DEFAULT_SUCCESS_STATUS, REPLY_CONTENT_ENCODING,
    REPLY_CONTENT_TYPE,
};
pub use middleware::{error_handler, middleware, ErrorHandler, Flow, HandlerResult, Layer, Middleware};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelHandle, ChannelState, ChannelSupervisor};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus, MessageSummary};
use crate::message::IncomingMessage;
use crate::transport::{self, ConsumeOptions, Delivery, DeliveryHandler, QueueOptions};
use middleware::run_chain;

// ============================================================================
// Usage registration
// ============================================================================

/// Where a usage consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageParams {
    pub routing_keys: Vec<String>,
    /// Exchange the queue is bound to. Without one, the queue is consumed
    /// as-is and must be named explicitly.
    pub exchange: Option<String>,
    /// Explicit queue name.
    pub queue: Option<String>,
    pub queue_options: QueueOptions,
    pub consumer_options: ConsumeOptions,
    /// Part of the generated queue name; shown in logs.
    pub handler_id: Option<String>,
}

impl UsageParams {
    /// Bind `routing_key` on `exchange`.
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            routing_keys: vec![routing_key.into()],
            exchange: Some(exchange.into()),
            queue: None,
            queue_options: QueueOptions::default(),
            consumer_options: ConsumeOptions::default(),
            handler_id: None,
        }
    }

    /// Consume an existing queue without bindings.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            routing_keys: vec![queue.clone()],
            exchange: None,
            queue: Some(queue),
            queue_options: QueueOptions::default(),
            consumer_options: ConsumeOptions::default(),
            handler_id: None,
        }
    }

    pub fn with_routing_keys<I, S>(mut self, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = routing_keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_handler_id(mut self, handler_id: impl Into<String>) -> Self {
        self.handler_id = Some(handler_id.into());
        self
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn with_consumer_options(mut self, options: ConsumeOptions) -> Self {
        self.consumer_options = options;
        self
    }

    /// Explicit queue, else `<appId>.<handlerId>.<routingKeys joined by '.'>`.
    pub fn queue_name(&self, app_id: &str) -> String {
        if let Some(queue) = &self.queue {
            return queue.clone();
        }
        let mut parts = vec![app_id.to_string()];
        parts.extend(self.handler_id.clone());
        parts.push(self.routing_keys.join("."));
        parts.join(".")
    }

    fn validate(&self) -> Result<()> {
        if self.routing_keys.iter().all(|key| key.is_empty()) {
            return Err(ClientError::Config(
                "a usage needs at least one routing key".to_string(),
            ));
        }
        if self.exchange.is_none() && self.queue.is_none() {
            return Err(ClientError::Config(
                "a usage needs an exchange to bind to or an explicit queue".to_string(),
            ));
        }
        Ok(())
    }
}

struct Usage {
    params: UsageParams,
    queue: String,
    layers: Vec<Layer>,
}

/// Global layers split by where they join a usage's chain.
#[derive(Default)]
struct Globals {
    middlewares: Vec<Layer>,
    error_handlers: Vec<Layer>,
}

struct ActiveConsumer {
    queue: String,
    handle: ChannelHandle,
    tag: String,
}

// ============================================================================
// Subscriber
// ============================================================================

struct Inner {
    channel: ChannelSupervisor,
    replies: ChannelSupervisor,
    events: EventBus,
    app_id: String,
    usages: Mutex<BTreeMap<String, Arc<Usage>>>,
    globals: Mutex<Globals>,
    consumers: Mutex<Vec<ActiveConsumer>>,
    in_flight: watch::Sender<usize>,
    listening: AtomicBool,
    /// Channel the usages are bound on. Held across every bind and unbind.
    bound: AsyncMutex<Option<ChannelHandle>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts a dispatch as in flight until dropped.
struct InFlight<'a>(&'a watch::Sender<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Consumes usage queues and dispatches deliveries through middleware.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<Inner>,
}

impl Subscriber {
    /// Consume on `channel`; send replies through `replies` (a confirm channel).
    pub fn new(
        channel: ChannelSupervisor,
        replies: ChannelSupervisor,
        events: EventBus,
        app_id: impl Into<String>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                channel,
                replies,
                events,
                app_id: app_id.into(),
                usages: Mutex::new(BTreeMap::new()),
                globals: Mutex::new(Globals::default()),
                consumers: Mutex::new(Vec::new()),
                in_flight,
                listening: AtomicBool::new(false),
                bound: AsyncMutex::new(None),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// Register a usage; returns its queue name.
    ///
    /// A usage registered under an existing queue name replaces it, and its
    /// consumer is restarted. When the subscriber is listening, the usage is
    /// bound as soon as a channel is open.
    pub fn register(&self, params: UsageParams, layers: Vec<Layer>) -> Result<String> {
        params.validate()?;
        let queue = params.queue_name(&self.inner.app_id);
        let usage = Arc::new(Usage {
            params,
            queue: queue.clone(),
            layers,
        });
        lock(&self.inner.usages).insert(queue.clone(), Arc::clone(&usage));
        debug!(queue = %queue, "Usage registered");

        if self.inner.listening.load(Ordering::SeqCst) {
            let subscriber = self.clone();
            tokio::spawn(async move { subscriber.bind_late(usage).await });
        }
        Ok(queue)
    }

    async fn bind_late(&self, usage: Arc<Usage>) {
        let bound = self.inner.bound.lock().await;
        let Some(handle) = bound.as_ref() else {
            return;
        };
        let current = lock(&self.inner.usages).get(&usage.queue).cloned();
        if *self.inner.shutdown.borrow() || !current.is_some_and(|c| Arc::ptr_eq(&c, &usage)) {
            return;
        }
        self.cancel_consumers(&usage.queue).await;
        if let Err(error) = self.apply_usage(handle, &usage).await {
            warn!(queue = %usage.queue, error = %error, "Failed to bind usage");
        }
    }

    /// Add global layers. Middlewares run before every usage's own layers,
    /// error handlers after them, each in registration order.
    pub fn register_global(&self, layers: impl IntoIterator<Item = Layer>) {
        let mut globals = lock(&self.inner.globals);
        for layer in layers {
            if layer.is_error_handler() {
                globals.error_handlers.push(layer);
            } else {
                globals.middlewares.push(layer);
            }
        }
    }

    /// Registered queue names.
    pub fn queues(&self) -> Vec<String> {
        lock(&self.inner.usages).keys().cloned().collect()
    }

    /// Bind every usage on each new channel. Calling it again is a no-op.
    pub fn listen(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriber = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(subscriber.follow_channel(shutdown));
        *lock(&self.inner.task) = Some(task);
    }

    async fn follow_channel(self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow_and_update() {
            return;
        }
        let mut states = self.inner.channel.subscribe();
        loop {
            let state = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                state = states.next() => state,
            };
            match state {
                Some(ChannelState::Open(handle)) => {
                    let mut bound = self.inner.bound.lock().await;
                    if bound.as_ref().is_some_and(|current| current.id() == handle.id()) {
                        continue;
                    }
                    *bound = Some(handle.clone());
                    self.apply_all(&handle).await;
                }
                Some(ChannelState::Closed) => {
                    let mut bound = self.inner.bound.lock().await;
                    *bound = None;
                    lock(&self.inner.consumers).clear();
                }
                None => break,
            }
        }
        debug!(app_id = %self.inner.app_id, "Subscriber stopped following the channel");
    }

    async fn apply_all(&self, handle: &ChannelHandle) {
        let usages: Vec<Arc<Usage>> = lock(&self.inner.usages).values().cloned().collect();
        let results = join_all(usages.iter().map(|usage| self.apply_usage(handle, usage))).await;

        let mut failed = 0;
        for (usage, result) in usages.iter().zip(results) {
            if let Err(error) = result {
                failed += 1;
                warn!(queue = %usage.queue, error = %error, "Failed to bind usage");
            }
        }
        if failed == 0 {
            info!(usages = usages.len(), channel = %handle.id(), "Usages bound");
            self.inner.events.emit(ClientEvent::Resubscribed);
        }
    }

    async fn apply_usage(&self, handle: &ChannelHandle, usage: &Arc<Usage>) -> transport::Result<()> {
        let channel = handle.channel();
        let params = &usage.params;
        channel
            .assert_queue(&usage.queue, params.queue_options.clone())
            .await?;
        if let Some(exchange) = &params.exchange {
            for routing_key in &params.routing_keys {
                channel.bind_queue(&usage.queue, exchange, routing_key).await?;
            }
        }
        self.inner.events.emit(ClientEvent::RequestQueueConfigured {
            queue: usage.queue.clone(),
        });

        let mut options = params.consumer_options.clone();
        if options.consumer_tag.is_none() {
            options.consumer_tag = Some(format!("{}-{}", self.inner.app_id, Uuid::new_v4()));
        }
        let tag = channel
            .consume(&usage.queue, self.delivery_handler(handle, &usage.queue), options)
            .await?;
        lock(&self.inner.consumers).push(ActiveConsumer {
            queue: usage.queue.clone(),
            handle: handle.clone(),
            tag,
        });
        Ok(())
    }

    async fn cancel_consumers(&self, queue: &str) {
        let consumers: Vec<ActiveConsumer> = {
            let mut active = lock(&self.inner.consumers);
            let (matching, rest) = active.drain(..).partition(|consumer| consumer.queue == queue);
            *active = rest;
            matching
        };
        for consumer in consumers {
            if let Err(error) = consumer.handle.channel().cancel(&consumer.tag).await {
                debug!(queue = %queue, error = %error, "Consumer cancel failed");
            }
        }
    }

    fn delivery_handler(&self, handle: &ChannelHandle, queue: &str) -> DeliveryHandler {
        let subscriber = self.clone();
        let handle = handle.clone();
        let queue = queue.to_string();
        Arc::new(move |delivery: Delivery| {
            let subscriber = subscriber.clone();
            let handle = handle.clone();
            let queue = queue.clone();
            async move { subscriber.dispatch(&queue, handle, delivery).await }.boxed()
        })
    }

    async fn dispatch(&self, queue: &str, source: ChannelHandle, delivery: Delivery) {
        let _in_flight = InFlight::enter(&self.inner.in_flight);

        let usage = lock(&self.inner.usages).get(queue).cloned();
        let Some(usage) = usage else {
            warn!(queue = %queue, "Delivery for an unregistered usage, requeueing");
            if let Err(error) = source.channel().reject(delivery.delivery_tag, true).await {
                debug!(queue = %queue, error = %error, "Requeue failed");
            }
            return;
        };

        let message = IncomingMessage::new(delivery);
        debug!(
            queue = %queue,
            exchange = %message.exchange(),
            consumer_tag = %message.consumer_tag(),
            redelivered = message.redelivered(),
            "Dispatching delivery"
        );
        message.parse();
        let handler_id = usage.params.handler_id.clone();
        let summary =
            MessageSummary::from(&message).with_handler_id(handler_id.as_deref());
        let is_request = message.is_request();
        let invalid = message.is_invalid();
        let payload = message.payload().clone();

        self.inner.events.emit(if is_request {
            ClientEvent::RequestReceived(summary)
        } else {
            ClientEvent::EventReceived(summary)
        });

        let ctx = HandlerContext::new(
            message,
            source,
            self.inner.replies.clone(),
            self.inner.events.clone(),
            self.inner.app_id.clone(),
            handler_id,
        );

        if invalid {
            let reason = payload.get("error").cloned().unwrap_or(Value::Null);
            warn!(queue = %queue, error = %reason, "Undecodable message rejected");
            let settled = if is_request {
                ctx.reject_and_respond(reason).await
            } else {
                ctx.reject(false).await
            };
            if let Err(error) = settled {
                warn!(queue = %queue, error = %error, "Failed to reject undecodable message");
            }
            return;
        }

        let layers: Vec<Layer> = {
            let globals = lock(&self.inner.globals);
            globals
                .middlewares
                .iter()
                .chain(&usage.layers)
                .chain(&globals.error_handlers)
                .cloned()
                .collect()
        };

        if let Some(unhandled) = run_chain(&layers, &payload, &ctx).await {
            error!(
                queue = %queue,
                short_id = ?ctx.message().short_id(),
                routing_key = %ctx.message().routing_key(),
                error = %unhandled,
                "Unhandled middleware error"
            );
        }
    }

    /// Delete a usage's queue and drop its registration.
    pub async fn delete_queue(&self, params: &UsageParams) -> Result<()> {
        let queue = params.queue_name(&self.inner.app_id);
        lock(&self.inner.usages).remove(&queue);
        {
            let _bound = self.inner.bound.lock().await;
            self.cancel_consumers(&queue).await;
        }

        self.inner.channel.delete_queue(&queue).await?;
        self.inner
            .events
            .emit(ClientEvent::QueueDeleted { queue });
        Ok(())
    }

    /// Deliveries currently running through middleware.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Stop consuming and wait for in-flight dispatches to finish.
    ///
    /// Handler chains already running are never interrupted.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);

        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        {
            let mut bound = self.inner.bound.lock().await;
            *bound = None;
            let consumers: Vec<ActiveConsumer> = lock(&self.inner.consumers).drain(..).collect();
            for consumer in consumers {
                if let Err(error) = consumer.handle.channel().cancel(&consumer.tag).await {
                    debug!(queue = %consumer.queue, error = %error, "Consumer cancel failed");
                }
            }
        }

        let mut in_flight = self.inner.in_flight.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
        info!(app_id = %self.inner.app_id, "Subscriber shut down");
    }
}

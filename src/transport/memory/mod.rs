//! In-memory broker transport.
//!
//! Implements the transport traits over process-local state so the client can
//! run without an external broker. Ideal for local development and testing.
//!
//! Modelled behaviour:
//! - Any non-empty exchange name behaves as a topic exchange (`*` matches one
//!   word, `#` matches zero or more); the empty exchange routes by queue name
//! - Exclusive queues belong to the declaring connection and vanish with it
//! - Auto-delete queues vanish when their last consumer goes away
//! - Unacknowledged deliveries are requeued when their channel closes
//! - Acknowledging an unknown delivery tag closes the channel, as a broker does
//!
//! Failure injection (`set_reachable`, `disconnect_all`, `close_all_channels`)
//! lets tests drive the reconnect paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    Channel, Connection, ConsumeOptions, Delivery, DeliveryHandler, LifecycleEvent, Listeners,
    MessageProperties, QueueOptions, Result, Transport, TransportError,
};

/// Check if a routing key matches a topic binding pattern.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// A message recorded by the broker on publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub content: Vec<u8>,
    pub confirmed: bool,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    content: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueEntry {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

struct ConnectionEntry {
    open: bool,
    listeners: Listeners,
}

struct ChannelEntry {
    connection: u64,
    confirm: bool,
    open: bool,
    listeners: Listeners,
    next_delivery_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
    prefetch: Option<u16>,
}

struct BrokerState {
    reachable: bool,
    next_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> Result<&ChannelEntry> {
        match self.channels.get(&channel) {
            Some(entry) if entry.open => Ok(entry),
            _ => Err(TransportError::ChannelClosed(format!("channel {} is closed", channel))),
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && topic_matches(&binding.pattern, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    /// Hand ready messages of `queue` to its consumers, round-robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(entry) = self.queues.get_mut(queue) else {
                return;
            };
            if entry.consumers.is_empty() || entry.ready.is_empty() {
                return;
            }
            let index = entry.next_consumer % entry.consumers.len();
            entry.next_consumer = index + 1;
            let Some(message) = entry.ready.pop_front() else {
                return;
            };
            let consumer = &entry.consumers[index];
            let (tag, channel_id, no_ack, tx) = (
                consumer.tag.clone(),
                consumer.channel,
                consumer.no_ack,
                consumer.tx.clone(),
            );

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                continue;
            };
            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            if !no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue.to_string(), message.clone()));
            }

            let delivery = Delivery {
                delivery_tag,
                consumer_tag: tag,
                exchange: message.exchange,
                routing_key: message.routing_key,
                redelivered: message.redelivered,
                properties: message.properties,
                content: message.content,
            };
            let _ = tx.send(delivery);
        }
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, front: bool) {
        if let Some(entry) = self.queues.get_mut(queue) {
            if front {
                entry.ready.push_front(message);
            } else {
                entry.ready.push_back(message);
            }
        }
        self.dispatch(queue);
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|binding| binding.queue != name);
    }

    /// Remove consumers matching `predicate`, dropping auto-delete queues left
    /// without consumers.
    fn remove_consumers(&mut self, predicate: impl Fn(&ConsumerEntry) -> bool) {
        let mut emptied = Vec::new();
        for (name, entry) in self.queues.iter_mut() {
            let before = entry.consumers.len();
            entry.consumers.retain(|consumer| !predicate(consumer));
            if before > 0 && entry.consumers.is_empty() && entry.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
    }

    /// Close a channel: drop its consumers and requeue what it left unacked.
    fn shut_channel(&mut self, channel_id: u64) -> Option<Listeners> {
        let entry = self.channels.get_mut(&channel_id)?;
        if !entry.open {
            return None;
        }
        entry.open = false;
        let listeners = entry.listeners.clone();
        let unacked: Vec<_> = entry.unacked.drain().collect();

        self.remove_consumers(|consumer| consumer.channel == channel_id);

        let mut unacked = unacked;
        unacked.sort_by_key(|(tag, _)| *tag);
        for (_, (queue, mut message)) in unacked.into_iter().rev() {
            message.redelivered = true;
            self.enqueue(&queue, message, true);
        }

        Some(listeners)
    }

    fn shut_connection(&mut self, connection_id: u64) -> Vec<Listeners> {
        let mut notify = Vec::new();
        let Some(entry) = self.connections.get_mut(&connection_id) else {
            return notify;
        };
        if !entry.open {
            return notify;
        }
        entry.open = false;
        let connection_listeners = entry.listeners.clone();

        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            if let Some(listeners) = self.shut_channel(id) {
                notify.push(listeners);
            }
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }

        notify.push(connection_listeners);
        notify
    }
}

/// Process-local broker shared by every connection opened through it.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                next_id: 0,
                connections: HashMap::new(),
                channels: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                published: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A transport opening connections to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// Make new connection attempts succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Drop every open connection as a network failure would.
    pub fn disconnect_all(&self) {
        let notify: Vec<Listeners> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, entry)| entry.open)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .flat_map(|id| state.shut_connection(id))
                .collect()
        };
        for listeners in notify {
            listeners.emit(LifecycleEvent::Error("connection reset by peer".to_string()));
            listeners.emit(LifecycleEvent::Closed);
        }
    }

    /// Force-close every open channel as a broker-side protocol error would.
    pub fn close_all_channels(&self) {
        let notify: Vec<Listeners> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, entry)| entry.open)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.shut_channel(id))
                .collect()
        };
        for listeners in notify {
            listeners.emit(LifecycleEvent::Error("PRECONDITION_FAILED".to_string()));
            listeners.emit(LifecycleEvent::Closed);
        }
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|entry| entry.open)
            .count()
    }

    pub fn open_channels(&self) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|entry| entry.open)
            .count()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|entry| entry.consumers.len())
            .unwrap_or(0)
    }

    /// Messages waiting in `queue` without a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|entry| entry.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out but neither acked nor rejected, across channels.
    pub fn unacked_count(&self) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|entry| entry.open)
            .map(|entry| entry.unacked.len())
            .sum()
    }

    /// Prefetch applied on the most recently opened channel.
    pub fn last_prefetch(&self) -> Option<u16> {
        self.lock()
            .channels
            .iter()
            .max_by_key(|(id, _)| **id)
            .and_then(|(_, entry)| entry.prefetch)
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }
}

/// Transport backed by a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        let mut state = self.broker.lock();
        if !state.reachable {
            return Err(TransportError::Connect(format!("{}: connection refused", url)));
        }
        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                listeners: Listeners::new(),
            },
        );
        debug!(connection = id, "Memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let state = self.broker.lock();
        match state.connections.get(&self.id) {
            Some(entry) if entry.open => entry.listeners.listen(),
            _ => {
                let listeners = Listeners::new();
                let rx = listeners.listen();
                listeners.emit(LifecycleEvent::Closed);
                rx
            }
        }
    }

    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn Channel>> {
        let mut state = self.broker.lock();
        match state.connections.get(&self.id) {
            Some(entry) if entry.open => {}
            _ => {
                return Err(TransportError::ConnectionClosed(format!(
                    "connection {} is closed",
                    self.id
                )))
            }
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                confirm,
                open: true,
                listeners: Listeners::new(),
                next_delivery_tag: 0,
                unacked: HashMap::new(),
                prefetch: None,
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    async fn close(&self) -> Result<()> {
        let notify = self.broker.lock().shut_connection(self.id);
        if notify.is_empty() {
            return Err(TransportError::ConnectionClosed(format!(
                "connection {} is already closed",
                self.id
            )));
        }
        for listeners in notify {
            listeners.emit(LifecycleEvent::Closed);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
}

impl MemoryChannel {
    fn fail_channel(&self, reason: &str) -> TransportError {
        let listeners = self.broker.lock().shut_channel(self.id);
        if let Some(listeners) = listeners {
            listeners.emit(LifecycleEvent::Error(reason.to_string()));
            listeners.emit(LifecycleEvent::Closed);
        }
        TransportError::ChannelClosed(reason.to_string())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let state = self.broker.lock();
        match state.channels.get(&self.id) {
            Some(entry) if entry.open => entry.listeners.listen(),
            _ => {
                let listeners = Listeners::new();
                let rx = listeners.listen();
                listeners.emit(LifecycleEvent::Closed);
                rx
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        let confirmed = state.channel_open(self.id)?.confirm;

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            content: body.clone(),
            confirmed,
        });

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            content: body,
            redelivered: false,
        };
        for queue in state.route(exchange, routing_key) {
            state.enqueue(&queue, message.clone(), false);
        }
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.broker.lock();
        state.channel_open(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let locked = state
            .queues
            .get(&name)
            .and_then(|existing| existing.owner)
            .is_some_and(|owner| owner != self.connection);
        if locked {
            drop(state);
            return Err(self.fail_channel(&format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                name
            )));
        }

        if !state.queues.contains_key(&name) {
            let owner = options.exclusive.then_some(self.connection);
            state.queues.insert(
                name.clone(),
                QueueEntry {
                    options,
                    owner,
                    ready: VecDeque::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                },
            );
        }
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.channel_open(self.id)?;
        if !state.queues.contains_key(queue) {
            drop(state);
            return Err(self.fail_channel(&format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exists = state.bindings.iter().any(|binding| {
            binding.queue == queue && binding.exchange == exchange && binding.pattern == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: DeliveryHandler,
        options: ConsumeOptions,
    ) -> Result<String> {
        let tag = {
            let mut state = self.broker.lock();
            state.channel_open(self.id)?;
            let owner = match state.queues.get(queue) {
                Some(entry) => entry.owner,
                None => {
                    drop(state);
                    return Err(self.fail_channel(&format!("NOT_FOUND - no queue '{}'", queue)));
                }
            };
            if owner.is_some_and(|owner| owner != self.connection) {
                drop(state);
                return Err(self.fail_channel(&format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                    queue
                )));
            }

            let tag = options
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("amq.ctag-{}", Uuid::new_v4().simple()));

            let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    handler(delivery).await;
                }
            });

            if let Some(entry) = state.queues.get_mut(queue) {
                entry.consumers.push(ConsumerEntry {
                    tag: tag.clone(),
                    channel: self.id,
                    no_ack: options.no_ack,
                    tx,
                });
            }
            state.dispatch(queue);
            tag
        };
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.channel_open(self.id)?;
        let channel = self.id;
        state.remove_consumers(|consumer| consumer.channel == channel && consumer.tag == consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let known = {
            let mut state = self.broker.lock();
            state.channel_open(self.id)?;
            state
                .channels
                .get_mut(&self.id)
                .and_then(|entry| entry.unacked.remove(&delivery_tag))
                .is_some()
        };
        if known {
            Ok(())
        } else {
            Err(self.fail_channel(&format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )))
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let entry = {
            let mut state = self.broker.lock();
            state.channel_open(self.id)?;
            let entry = state
                .channels
                .get_mut(&self.id)
                .and_then(|channel| channel.unacked.remove(&delivery_tag));
            if let (Some((queue, message)), true) = (entry.as_ref(), requeue) {
                let mut message = message.clone();
                message.redelivered = true;
                state.enqueue(queue, message, true);
            }
            entry
        };
        match entry {
            Some(_) => Ok(()),
            None => Err(self.fail_channel(&format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.channel_open(self.id)?;
        if let Some(entry) = state.channels.get_mut(&self.id) {
            entry.prefetch = Some(count);
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.channel_open(self.id)?;
        state.delete_queue(name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let listeners = self.broker.lock().shut_channel(self.id);
        if let Some(listeners) = listeners {
            listeners.emit(LifecycleEvent::Closed);
        }
        Ok(())
    }
}

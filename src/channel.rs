//! Channel supervisor.
//!
//! Derives a channel from the connection broadcast and recreates it whenever
//! the connection changes or the channel itself closes. Channel-dependent
//! operations suspend until a channel is open, so callers never branch on
//! availability.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{Broadcast, Subscription};
use crate::connection::{ConnectionHandle, ConnectionState, ConnectionSupervisor};
use crate::error::{ClientError, Result};
use crate::transport::{
    self, Channel, ConsumeOptions, DeliveryHandler, LifecycleEvent, MessageProperties,
    QueueOptions,
};

// ============================================================================
// State
// ============================================================================

/// An open channel and the session it belongs to.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn Channel>,
    id: String,
    connection: ConnectionHandle,
    confirmation_mode: bool,
}

impl ChannelHandle {
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Unique per channel instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn confirmation_mode(&self) -> bool {
        self.confirmation_mode
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("connection_id", &self.connection.connection_id())
            .field("connection_epoch", &self.connection.epoch())
            .field("confirmation_mode", &self.confirmation_mode)
            .finish()
    }
}

/// Current channel, or its absence.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    Open(ChannelHandle),
    Closed,
}

impl ChannelState {
    pub fn handle(&self) -> Option<&ChannelHandle> {
        match self {
            Self::Open(handle) => Some(handle),
            Self::Closed => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

/// Options recognized by [`ChannelSupervisor::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelOptions {
    /// Open a publisher-confirm channel.
    pub confirmation_mode: bool,
    /// Consumer prefetch applied to each new channel.
    pub prefetch: Option<u16>,
}

// ============================================================================
// Supervisor
// ============================================================================

struct Inner {
    connection: ConnectionSupervisor,
    options: ChannelOptions,
    state: Broadcast<ChannelState>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of one (optionally confirm-mode) channel.
#[derive(Clone)]
pub struct ChannelSupervisor {
    inner: Arc<Inner>,
}

impl ChannelSupervisor {
    /// Follow `connection`, opening a channel on every new session.
    pub fn open(connection: &ConnectionSupervisor, options: ChannelOptions) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            connection: connection.clone(),
            options,
            state: Broadcast::new(ChannelState::Closed),
            closed: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run(Arc::clone(&inner), shutdown_rx));
        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Self { inner }
    }

    pub fn confirmation_mode(&self) -> bool {
        self.inner.options.confirmation_mode
    }

    pub fn connection_id(&self) -> &str {
        self.inner.connection.connection_id()
    }

    pub fn current(&self) -> ChannelState {
        self.inner.state.current()
    }

    /// Current state first, then every transition.
    pub fn subscribe(&self) -> Subscription<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Wait for an open channel.
    ///
    /// Fails with [`ClientError::Closed`] once the supervisor has stopped.
    pub async fn ready(&self) -> Result<ChannelHandle> {
        self.next_open(None).await
    }

    async fn next_open(&self, stale: Option<&str>) -> Result<ChannelHandle> {
        self.subscribe()
            .find_map(|state| match state {
                ChannelState::Open(handle) if Some(handle.id()) != stale => Some(handle),
                _ => None,
            })
            .await
            .ok_or(ClientError::Closed)
    }

    /// Run `op` on the current channel.
    ///
    /// Transient failures (the channel or connection went away) are retried
    /// on the replacement channel; other errors are returned.
    pub async fn with_channel<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(ChannelHandle) -> Fut,
        Fut: Future<Output = transport::Result<T>>,
    {
        let mut handle = self.ready().await?;
        loop {
            match op(handle.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => {
                    debug!(
                        connection_id = %handle.connection_id(),
                        channel = %handle.id(),
                        error = %error,
                        "Channel lost, waiting for the next one"
                    );
                    handle = self.next_open(Some(handle.id())).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.with_channel(|handle| {
            let body = body.clone();
            let properties = properties.clone();
            async move {
                handle
                    .channel()
                    .publish(exchange, routing_key, body, properties)
                    .await
            }
        })
        .await
    }

    pub async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.with_channel(|handle| {
            let body = body.clone();
            let properties = properties.clone();
            async move { handle.channel().send_to_queue(queue, body, properties).await }
        })
        .await
    }

    pub async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.with_channel(|handle| {
            let options = options.clone();
            async move { handle.channel().assert_queue(name, options).await }
        })
        .await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_channel(|handle| async move {
            handle.channel().bind_queue(queue, exchange, routing_key).await
        })
        .await
    }

    /// Start consuming on the current channel.
    ///
    /// Returns the channel the consumer lives on with its consumer tag.
    pub async fn consume(
        &self,
        queue: &str,
        handler: DeliveryHandler,
        options: ConsumeOptions,
    ) -> Result<(ChannelHandle, String)> {
        self.with_channel(|handle| {
            let handler = Arc::clone(&handler);
            let options = options.clone();
            async move {
                let tag = handle.channel().consume(queue, handler, options).await?;
                Ok::<_, transport::TransportError>((handle, tag))
            }
        })
        .await
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.with_channel(|handle| async move { handle.channel().delete_queue(name).await })
            .await
    }

    /// Close the channel and stop following the connection. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.closed.swap(true, Ordering::SeqCst) {
            let _ = inner.shutdown.send(true);
            if let ChannelState::Open(handle) = inner.state.current() {
                if let Err(error) = handle.channel().close().await {
                    debug!(channel = %handle.id(), error = %error, "Channel already closed");
                }
            }
            inner.state.publish(ChannelState::Closed);
            inner.state.terminate();
        }

        let task = inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = inner.connection.subscribe();
    loop {
        let state = tokio::select! {
            state = connections.next() => state,
            _ = shutdown.changed() => break,
        };
        match state {
            Some(ConnectionState::Connected(connection)) => open_channel(&inner, connection).await,
            Some(ConnectionState::Disconnected) => {
                inner.state.publish(ChannelState::Closed);
            }
            None => break,
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
    }

    if let ChannelState::Open(handle) = inner.state.current() {
        if inner.closed.load(Ordering::SeqCst) {
            let _ = handle.channel().close().await;
        }
    }
    inner.state.publish(ChannelState::Closed);
    inner.state.terminate();
}

async fn open_channel(inner: &Arc<Inner>, connection: ConnectionHandle) {
    let confirm = inner.options.confirmation_mode;
    let channel = match connection.connection().create_channel(confirm).await {
        Ok(channel) => channel,
        Err(error) => {
            warn!(
                connection_id = %connection.connection_id(),
                error = %error,
                "Failed to create channel"
            );
            if !error.is_connection_closing() {
                inner.connection.recycle(&connection).await;
            }
            return;
        }
    };

    let events = channel.events();
    if let Some(count) = inner.options.prefetch {
        if let Err(error) = channel.prefetch(count).await {
            warn!(connection_id = %connection.connection_id(), error = %error, "Failed to set prefetch");
        }
    }

    let handle = ChannelHandle {
        channel,
        id: Uuid::new_v4().simple().to_string(),
        connection,
        confirmation_mode: confirm,
    };
    info!(
        connection_id = %handle.connection_id(),
        channel = %handle.id(),
        confirmation_mode = confirm,
        "Channel has been opened"
    );
    if inner.state.publish(ChannelState::Open(handle.clone())) {
        tokio::spawn(watch_channel(Arc::clone(inner), handle, events));
    }
}

async fn watch_channel(
    inner: Arc<Inner>,
    handle: ChannelHandle,
    mut events: tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    loop {
        match events.recv().await {
            Some(LifecycleEvent::Error(message)) => {
                warn!(
                    connection_id = %handle.connection_id(),
                    channel = %handle.id(),
                    error = %message,
                    "Channel error"
                );
            }
            Some(LifecycleEvent::Closed) | None => break,
        }
    }

    let was_current = inner.state.publish_if(
        |current| current.handle().is_some_and(|open| open.id() == handle.id()),
        ChannelState::Closed,
    );
    if was_current && !inner.closed.load(Ordering::SeqCst) {
        info!(
            connection_id = %handle.connection_id(),
            channel = %handle.id(),
            "Channel was closed"
        );
        inner.connection.recycle(handle.connection()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::connection::ConnectOptions;
    use crate::transport::MemoryBroker;
    use std::time::Duration;

    fn connect(broker: &MemoryBroker) -> ConnectionSupervisor {
        ConnectionSupervisor::connect(
            Arc::new(broker.transport()),
            "amqp://memory",
            ConnectOptions {
                connection_id: None,
                reconnect: ReconnectPolicy::fixed(Duration::from_millis(10)),
            },
        )
    }

    async fn next_open(sub: &mut Subscription<ChannelState>) -> ChannelHandle {
        tokio::time::timeout(Duration::from_secs(2), sub.find_map(|s| s.handle().cloned()))
            .await
            .expect("Timed out waiting for channel")
            .expect("Channel broadcast terminated")
    }

    #[tokio::test]
    async fn test_opens_channel_with_connection_id() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let channel = ChannelSupervisor::open(&connection, ChannelOptions::default());

        let handle = channel.ready().await.unwrap();
        assert_eq!(handle.connection_id(), "/");
        assert!(!handle.confirmation_mode());
        assert_eq!(broker.open_channels(), 1);
        connection.close().await;
    }

    #[tokio::test]
    async fn test_confirm_mode_and_prefetch() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let options = ChannelOptions {
            confirmation_mode: true,
            prefetch: Some(5),
        };
        let channel = ChannelSupervisor::open(&connection, options);

        assert!(channel.ready().await.unwrap().confirmation_mode());
        assert_eq!(broker.last_prefetch(), Some(5));
        connection.close().await;
    }

    #[tokio::test]
    async fn test_reopens_after_disconnect() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let channel = ChannelSupervisor::open(&connection, ChannelOptions::default());
        let mut sub = channel.subscribe();
        let first = next_open(&mut sub).await;

        broker.disconnect_all();

        let mut saw_closed = false;
        let second = loop {
            match sub.next().await.unwrap() {
                ChannelState::Closed => saw_closed = true,
                ChannelState::Open(handle) => break handle,
            }
        };
        assert!(saw_closed);
        assert_ne!(first.id(), second.id());
        assert_eq!(second.connection().epoch(), 2);
        connection.close().await;
    }

    #[tokio::test]
    async fn test_broker_closed_channel_recycles_connection() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let channel = ChannelSupervisor::open(&connection, ChannelOptions::default());
        let mut sub = channel.subscribe();
        let first = next_open(&mut sub).await;

        broker.close_all_channels();

        let second = next_open(&mut sub).await;
        assert_ne!(first.id(), second.id());
        assert!(second.connection().epoch() > first.connection().epoch());
        assert_eq!(broker.open_connections(), 1);
        connection.close().await;
    }

    #[tokio::test]
    async fn test_operations_survive_channel_loss() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let channel = ChannelSupervisor::open(&connection, ChannelOptions::default());
        channel.ready().await.unwrap();

        broker.close_all_channels();
        channel
            .assert_queue("jobs", QueueOptions::default())
            .await
            .unwrap();
        channel
            .send_to_queue("jobs", b"{}".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("jobs"), 1);
        connection.close().await;
    }

    #[tokio::test]
    async fn test_terminates_with_connection() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let channel = ChannelSupervisor::open(&connection, ChannelOptions::default());
        channel.ready().await.unwrap();

        connection.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), channel.ready())
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::Closed)));
        assert_eq!(channel.current(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let channel = ChannelSupervisor::open(&connection, ChannelOptions::default());
        channel.ready().await.unwrap();

        channel.close().await;
        channel.close().await;

        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.open_connections(), 1);
        connection.close().await;
    }
}

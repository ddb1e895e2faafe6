//! Connection supervisor.
//!
//! Keeps one broker connection alive across failures and broadcasts its
//! current state. Subscribers see `Disconnected` first, then one `Connected`
//! per established session and one `Disconnected` per lost session.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcast, Subscription};
use crate::config::{ReconnectCause, ReconnectPolicy};
use crate::transport::{Connection, LifecycleEvent, Transport};
use crate::utils::vhost::to_vhost;

// ============================================================================
// State
// ============================================================================

/// A live connection tagged with its session epoch.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<dyn Connection>,
    connection_id: String,
    epoch: u64,
}

impl ConnectionHandle {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Session counter, starting at 1 and bumped on every new connection.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Current connection, or its absence.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connected(ConnectionHandle),
    Disconnected,
}

impl ConnectionState {
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        match self {
            Self::Connected(handle) => Some(handle),
            Self::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Options recognized by [`ConnectionSupervisor::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Explicit connection id; derived from the URL vhost when absent.
    pub connection_id: Option<String>,
    pub reconnect: ReconnectPolicy,
}

// ============================================================================
// Supervisor
// ============================================================================

struct Inner {
    url: String,
    connection_id: String,
    reconnect: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    state: Broadcast<ConnectionState>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    // Held while connecting and publishing the result, so `close` never
    // races a connect that is about to succeed.
    attempt: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of the broker connection lifecycle.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Start connecting to `url` in the background.
    ///
    /// Connect failures and lost sessions are retried indefinitely using
    /// `options.reconnect`.
    pub fn connect(transport: Arc<dyn Transport>, url: &str, options: ConnectOptions) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection_id = options
            .connection_id
            .unwrap_or_else(|| to_vhost(url));
        let inner = Arc::new(Inner {
            url: url.to_string(),
            connection_id,
            reconnect: options.reconnect,
            transport,
            state: Broadcast::new(ConnectionState::Disconnected),
            closed: AtomicBool::new(false),
            shutdown,
            attempt: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run(Arc::clone(&inner), shutdown_rx));
        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Self { inner }
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Current state first, then every transition.
    pub fn subscribe(&self) -> Subscription<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait for a live connection. `None` once the supervisor is closed.
    pub async fn ready(&self) -> Option<ConnectionHandle> {
        self.subscribe()
            .find_map(|state| match state {
                ConnectionState::Connected(handle) => Some(handle),
                ConnectionState::Disconnected => None,
            })
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection a dependent found unusable.
    ///
    /// Ignored when `handle` is no longer the current session. The close
    /// event drives the regular reconnect path.
    pub async fn recycle(&self, handle: &ConnectionHandle) {
        let current = self.inner.state.current();
        if current.handle().map(ConnectionHandle::epoch) != Some(handle.epoch) {
            debug!(
                connection_id = %self.inner.connection_id,
                epoch = handle.epoch,
                "Stale connection, not recycling"
            );
            return;
        }
        info!(connection_id = %self.inner.connection_id, epoch = handle.epoch, "Closing connection");
        if let Err(error) = handle.connection.close().await {
            debug!(connection_id = %self.inner.connection_id, error = %error, "Connection close failed");
        }
    }

    /// Close the connection and stop reconnecting. Idempotent.
    ///
    /// Safe to call before the first connect resolves: an in-flight attempt
    /// is allowed to finish and its connection is then closed.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.closed.swap(true, Ordering::SeqCst) {
            let _ = inner.shutdown.send(true);

            let guard = inner.attempt.lock().await;
            if let ConnectionState::Connected(handle) = inner.state.current() {
                if let Err(error) = handle.connection.close().await {
                    debug!(connection_id = %inner.connection_id, error = %error, "Connection already closed");
                }
            }
            inner.state.publish(ConnectionState::Disconnected);
            inner.state.terminate();
            drop(guard);
            info!(connection_id = %inner.connection_id, "Connection closed by client");
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
    let mut failures: u32 = 0;
    let mut sessions_lost: u32 = 0;

    loop {
        let attempt = {
            let _guard = inner.attempt.lock().await;
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            match inner.transport.connect(&inner.url).await {
                Ok(connection) => {
                    let events = connection.events();
                    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let handle = ConnectionHandle {
                        connection,
                        connection_id: inner.connection_id.clone(),
                        epoch,
                    };
                    info!(connection_id = %inner.connection_id, epoch, "Connected");
                    inner.state.publish(ConnectionState::Connected(handle));
                    Ok(events)
                }
                Err(error) => Err(error),
            }
        };

        let delay = match attempt {
            Ok(mut events) => {
                failures = 0;
                let lost = loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(LifecycleEvent::Error(message)) => {
                                warn!(connection_id = %inner.connection_id, error = %message, "Connection error");
                            }
                            Some(LifecycleEvent::Closed) | None => break true,
                        },
                        _ = shutdown.changed() => break false,
                    }
                };
                drop(events);
                if !lost {
                    break;
                }

                info!(connection_id = %inner.connection_id, "Connection was closed");
                inner.state.publish(ConnectionState::Disconnected);
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                sessions_lost = sessions_lost.saturating_add(1);
                inner.reconnect.delay(ReconnectCause::Closed, sessions_lost)
            }
            Err(error) => {
                warn!(connection_id = %inner.connection_id, error = %error, "Failed to connect");
                failures = failures.saturating_add(1);
                inner.reconnect.delay(ReconnectCause::ConnectFailed, failures)
            }
        };

        info!(
            connection_id = %inner.connection_id,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(connection_id = %inner.connection_id, "Connection supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn fast() -> ConnectOptions {
        ConnectOptions {
            connection_id: None,
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(10)),
        }
    }

    async fn next(sub: &mut Subscription<ConnectionState>) -> ConnectionState {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("Timed out waiting for connection state")
            .expect("Broadcast terminated")
    }

    #[tokio::test]
    async fn test_connects_and_tags_connection_id() {
        let broker = MemoryBroker::new();
        let supervisor =
            ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://host/orders", fast());

        let handle = supervisor.ready().await.unwrap();
        assert_eq!(handle.connection_id(), "/orders");
        assert_eq!(handle.epoch(), 1);
        assert_eq!(broker.open_connections(), 1);
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_explicit_connection_id() {
        let broker = MemoryBroker::new();
        let options = ConnectOptions {
            connection_id: Some("primary".into()),
            ..fast()
        };
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", options);
        assert_eq!(supervisor.ready().await.unwrap().connection_id(), "primary");
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_one_transition_per_session() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", fast());
        let mut sub = supervisor.subscribe();

        assert_eq!(next(&mut sub).await, ConnectionState::Disconnected);
        let first = next(&mut sub).await;
        assert_eq!(first.handle().map(ConnectionHandle::epoch), Some(1));

        broker.disconnect_all();
        assert_eq!(next(&mut sub).await, ConnectionState::Disconnected);
        let second = next(&mut sub).await;
        assert_eq!(second.handle().map(ConnectionHandle::epoch), Some(2));

        supervisor.close().await;
        assert_eq!(next(&mut sub).await, ConnectionState::Disconnected);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_retries_until_broker_reachable() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", fast());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!supervisor.current().is_connected());

        broker.set_reachable(true);
        let handle = tokio::time::timeout(Duration::from_secs(2), supervisor.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.epoch(), 1);
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_backoff_receives_independent_attempt_counters() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let seen = Arc::new(AtomicU32::new(0));
        let recorded = Arc::clone(&seen);
        let options = ConnectOptions {
            connection_id: None,
            reconnect: ReconnectPolicy::backoff(move |attempt| {
                recorded.fetch_max(attempt, Ordering::SeqCst);
                Duration::from_millis(5)
            }),
        };
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", options);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.load(Ordering::SeqCst) >= 2);
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", fast());
        supervisor.ready().await.unwrap();

        supervisor.close().await;
        assert_eq!(supervisor.current(), ConnectionState::Disconnected);
        assert!(supervisor.is_closed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.open_connections(), 0);
        assert!(supervisor.ready().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", fast());
        supervisor.ready().await.unwrap();

        supervisor.close().await;
        supervisor.close().await;
        assert_eq!(supervisor.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_before_first_connect() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", fast());

        supervisor.close().await;
        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.open_connections(), 0);
        assert_eq!(supervisor.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_recycle_ignores_stale_handle() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(Arc::new(broker.transport()), "amqp://h", fast());
        let first = supervisor.ready().await.unwrap();

        supervisor.recycle(&first).await;
        let mut sub = supervisor.subscribe();
        let second = sub
            .find_map(|state| state.handle().filter(|h| h.epoch() == 2).cloned())
            .await
            .unwrap();

        supervisor.recycle(&first).await;
        assert_eq!(supervisor.current(), ConnectionState::Connected(second));
        supervisor.close().await;
    }
}

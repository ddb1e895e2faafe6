//! Replay-latest broadcast cell.
//!
//! A single-writer, multi-reader state holder. Every subscriber first receives
//! the current value, then each later transition in publish order. Unlike
//! `tokio::sync::watch`, intermediate values are never coalesced: each
//! subscriber owns an unbounded queue.
//!
//! Publishing a value equal to the current one is ignored, so consecutive
//! duplicate states are never observed. Once terminated, the cell keeps its
//! last value but emits nothing further and all subscriptions end.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

struct Inner<T> {
    current: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    terminated: bool,
}

/// Replay-latest broadcast of a state value.
pub struct Broadcast<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> Broadcast<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: initial,
                subscribers: Vec::new(),
                terminated: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value.
    pub fn current(&self) -> T {
        self.lock().current.clone()
    }

    /// Publish a new value to every subscriber.
    ///
    /// Returns `false` if the value was dropped because it equals the current
    /// one or the cell is terminated.
    pub fn publish(&self, value: T) -> bool {
        let mut inner = self.lock();
        if inner.terminated || inner.current == value {
            return false;
        }
        inner.current = value.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        true
    }

    /// Publish only if `condition` holds for the current value, checked and
    /// applied atomically.
    pub fn publish_if(&self, condition: impl FnOnce(&T) -> bool, value: T) -> bool {
        let mut inner = self.lock();
        if inner.terminated || inner.current == value || !condition(&inner.current) {
            return false;
        }
        inner.current = value.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        true
    }

    /// Subscribe: the current value is delivered first.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let _ = tx.send(inner.current.clone());
        if !inner.terminated {
            inner.subscribers.push(tx);
        }
        Subscription {
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    /// Stop emitting. Existing subscriptions drain and then end.
    pub fn terminate(&self) {
        let mut inner = self.lock();
        inner.terminated = true;
        inner.subscribers.clear();
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }
}

/// A subscriber's view of a [`Broadcast`].
pub struct Subscription<T> {
    stream: UnboundedReceiverStream<T>,
}

impl<T> Subscription<T> {
    /// Next value, or `None` once the broadcast is terminated and drained.
    pub async fn next(&mut self) -> Option<T> {
        self.stream.next().await
    }

    /// Wait for the first value matching `predicate` and map it.
    pub async fn find_map<U>(&mut self, mut predicate: impl FnMut(T) -> Option<U>) -> Option<U> {
        while let Some(value) = self.stream.next().await {
            if let Some(found) = predicate(value) {
                return Some(found);
            }
        }
        None
    }
}

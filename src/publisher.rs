//! Publisher: confirmed publishes with drain-on-shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::channel::ChannelSupervisor;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus, MessageSummary};
use crate::message::{with_defaults, Destination, OutgoingMessage};
use crate::transport::MessageProperties;

/// Progress of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Publishes through the confirm channel and tracks unconfirmed messages.
#[derive(Clone)]
pub struct Publisher {
    channel: ChannelSupervisor,
    events: EventBus,
    defaults: MessageProperties,
    in_flight: Arc<Mutex<HashMap<String, watch::Receiver<PublishStatus>>>>,
}

impl Publisher {
    /// `defaults` fill every property the caller leaves unset.
    pub fn new(channel: ChannelSupervisor, events: EventBus, defaults: MessageProperties) -> Self {
        Self {
            channel,
            events,
            defaults,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<PublishStatus>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish to an exchange; resolves once the broker confirmed it.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        options: MessageProperties,
    ) -> Result<()> {
        let message = OutgoingMessage::to_exchange(
            exchange,
            routing_key,
            payload,
            with_defaults(options, &self.defaults),
        );
        self.send(message).await
    }

    /// Send straight to a queue; resolves once the broker confirmed it.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: Value,
        options: MessageProperties,
    ) -> Result<()> {
        let message =
            OutgoingMessage::to_queue(queue, payload, with_defaults(options, &self.defaults));
        self.send(message).await
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        let args = message.to_args()?;
        let (status_tx, status_rx) = watch::channel(PublishStatus::Pending);
        self.in_flight().insert(message.id().to_string(), status_rx);

        // The publish runs to completion even if the caller stops waiting,
        // so `shutdown` always observes its outcome.
        let (result_tx, result_rx) = oneshot::channel();
        let publisher = self.clone();
        tokio::spawn(async move {
            let result = match message.destination() {
                Destination::Exchange { .. } => {
                    publisher
                        .channel
                        .publish(&args.exchange, &args.routing_key, args.body, args.properties)
                        .await
                }
                Destination::Queue(queue) => {
                    publisher
                        .channel
                        .send_to_queue(queue, args.body, args.properties)
                        .await
                }
            };

            match &result {
                Ok(()) => {
                    publisher.in_flight().remove(message.id());
                    let _ = status_tx.send(PublishStatus::Confirmed);
                    publisher
                        .events
                        .emit(ClientEvent::EventPublished(MessageSummary::from(&message)));
                }
                Err(error) => {
                    warn!(
                        short_id = %message.short_id(),
                        routing_key = %message.routing_key(),
                        error = %error,
                        "Publish failed"
                    );
                    let _ = status_tx.send(PublishStatus::Failed);
                }
            }
            let _ = result_tx.send(result);
        });

        result_rx.await.map_err(|_| ClientError::ShutDown)?
    }

    /// Number of publishes not yet confirmed, failed ones included.
    pub fn pending(&self) -> usize {
        self.in_flight().len()
    }

    /// Wait for every publish registered so far to settle.
    ///
    /// Fails with [`ClientError::Unconfirmed`] if any of them failed.
    pub async fn shutdown(&self) -> Result<()> {
        let waiting: Vec<_> = self.in_flight().values().cloned().collect();
        debug!(count = waiting.len(), "Draining publishes");

        let mut failed = 0;
        for mut status in waiting {
            let settled = status
                .wait_for(|status| *status != PublishStatus::Pending)
                .await
                .map(|status| *status);
            if !matches!(settled, Ok(PublishStatus::Confirmed)) {
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(ClientError::Unconfirmed { count: failed });
        }
        Ok(())
    }
}

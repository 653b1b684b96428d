// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery queue and dispatcher.
//!
//! Inbound events are published onto a bounded queue. The dispatcher takes
//! each one, finds the forwarding function for its channel and forwards it.
//! A retriable failure is put back on the queue after the function's backoff
//! delay until its retry policy is exhausted; anything else is logged and
//! dropped. Delivery is at-least-once; the workflow-start handlers and the
//! step memoization behind them absorb duplicates.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::forwarder::{DeliveryError, EventForwarder, ForwardReceipt, InboundEvent};
use crate::registry::TriggerRegistry;
use crate::retry::{ErrorClass, RetryPolicy};

/// Queue capacity used by [`DeliveryQueue::default_bounded`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One delivery attempt of an event.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Event to forward.
    pub event: InboundEvent,
    /// 1-indexed attempt number.
    pub attempt: u32,
}

/// Publishing side of the delivery queue.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<Delivery>,
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` pending deliveries.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Create a queue with [`DEFAULT_QUEUE_CAPACITY`].
    pub fn default_bounded() -> (Self, mpsc::Receiver<Delivery>) {
        Self::bounded(DEFAULT_QUEUE_CAPACITY)
    }

    /// Publish an event for its first delivery attempt.
    pub async fn publish(&self, event: InboundEvent) -> Result<(), CoreError> {
        debug!(channel = %event.name, "Event published");
        self.send(Delivery { event, attempt: 1 }).await
    }

    async fn send(&self, delivery: Delivery) -> Result<(), CoreError> {
        self.tx
            .send(delivery)
            .await
            .map_err(|_| CoreError::QueueClosed)
    }
}

/// Consumes the delivery queue and forwards events.
pub struct EventDispatcher {
    registry: Arc<TriggerRegistry>,
    forwarder: EventForwarder,
    queue: DeliveryQueue,
}

impl EventDispatcher {
    /// Create a dispatcher. `queue` is used for redelivery.
    pub fn new(
        registry: Arc<TriggerRegistry>,
        forwarder: EventForwarder,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            registry,
            forwarder,
            queue,
        }
    }

    /// Forward an event once.
    ///
    /// An event on a channel without a forwarding function can never be
    /// delivered and fails as non-retriable.
    pub async fn deliver(&self, event: &InboundEvent) -> Result<ForwardReceipt, DeliveryError> {
        let function = self.registry.function(&event.name).ok_or_else(|| {
            DeliveryError::new(
                ErrorClass::NonRetriable,
                None,
                format!("no forwarding function for channel '{}'", event.name),
            )
        })?;
        let target = function.target_for(event.data.path.as_deref());
        self.forwarder.forward(target, event).await
    }

    /// Process deliveries until `shutdown` flips to `true` or the queue closes.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Event dispatcher started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event dispatcher shutting down");
                        break;
                    }
                }
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else {
                        info!("Delivery queue closed");
                        break;
                    };
                    let dispatcher = self.clone();
                    tokio::spawn(async move { dispatcher.handle(delivery).await });
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let Delivery { event, attempt } = delivery;
        let error = match self.deliver(&event).await {
            Ok(receipt) => {
                info!(channel = %event.name, attempt, status = receipt.status, "Event delivered");
                return;
            }
            Err(e) => e,
        };

        let policy = self
            .registry
            .function(&event.name)
            .map(|f| f.retry.clone())
            .unwrap_or_else(RetryPolicy::no_retry);

        if !policy.should_retry(attempt, error.class()) {
            error!(
                channel = %event.name,
                attempt,
                retriable = error.is_retriable(),
                error = %error,
                "Event delivery failed permanently"
            );
            return;
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            channel = %event.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Event delivery failed, redelivering"
        );
        tokio::time::sleep(delay).await;
        if let Err(e) = self
            .queue
            .send(Delivery {
                event,
                attempt: attempt + 1,
            })
            .await
        {
            error!(error = %e, "Failed to requeue event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerSpec;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry() -> Arc<TriggerRegistry> {
        let mut registry = TriggerRegistry::new();
        let retry = RetryPolicy::new(3, Duration::from_millis(10));
        registry
            .register_api_route(
                "/webhooks/slack/action",
                HandlerSpec::new("slack").with_retry(retry.clone()),
            )
            .unwrap();
        registry
            .register_api_route(
                "/webhooks/telegram/action",
                HandlerSpec::new("telegram").with_retry(retry),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_deliver_routes_by_event_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhooks/telegram/action"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let (queue, _rx) = DeliveryQueue::bounded(8);
        let forwarder = EventForwarder::new(server.uri(), Duration::from_secs(5)).unwrap();
        let dispatcher = EventDispatcher::new(registry(), forwarder, queue);

        let mut event = InboundEvent::new("event/api.webhooks.webhooks.action");
        event.data.path = Some("/webhooks/telegram/action".to_string());
        let receipt = dispatcher.deliver(&event).await.unwrap();
        assert_eq!(receipt.status, 202);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_non_retriable() {
        let (queue, _rx) = DeliveryQueue::bounded(8);
        let forwarder =
            EventForwarder::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let dispatcher = EventDispatcher::new(registry(), forwarder, queue);

        let err = dispatcher
            .deliver(&InboundEvent::new("event/api.webhooks.nobody.action"))
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped() {
        let (queue, rx) = DeliveryQueue::bounded(1);
        drop(rx);
        let err = queue.publish(InboundEvent::new("x")).await.unwrap_err();
        assert!(matches!(err, CoreError::QueueClosed));
    }
}

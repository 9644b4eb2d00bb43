//! Fan-out of ticket updates to live observers
//!
//! The hub keeps one bounded outbox per connected observer. A single
//! listener task relays every message from the updates channel into all
//! outboxes. An observer whose outbox is closed or full is dropped on the
//! spot; the rest of the broadcast continues.

use crate::health::{components, HealthRegistry};
use crate::observability::TriageMetrics;
use crate::pubsub::{Notifier, PubSubError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single wait for the next pub/sub message
    pub poll_interval: Duration,
    /// Messages buffered per observer before it counts as failed
    pub connection_buffer: usize,
    /// Pause before resubscribing after a subscription error
    pub resubscribe_backoff: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            connection_buffer: 64,
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

/// An observer's end of a hub connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct BroadcastHub {
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    config: HubConfig,
    metrics: TriageMetrics,
    health: Option<HealthRegistry>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            metrics: TriageMetrics::new(),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn connect(&self) -> Connection {
        let (tx, receiver) = mpsc::channel(self.config.connection_buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let count = {
            let mut connections = self.connections.write().await;
            connections.insert(id, tx);
            connections.len()
        };
        self.metrics.set_hub_connections(count);
        info!(connection_id = id, connections = count, "Observer connected");

        Connection { id, receiver }
    }

    /// Returns false if the connection was already gone
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            self.metrics.set_hub_connections(count);
            info!(connection_id = id, connections = count, "Observer disconnected");
        }
        removed
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Deliver `message` to every connection, dropping the ones that fail
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let snapshot: Vec<(ConnectionId, mpsc::Sender<String>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, tx) in snapshot {
            match tx.try_send(message.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection_id = id, "Observer outbox full, dropping connection");
                    failed.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection_id = id, "Observer gone, dropping connection");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let count = {
                let mut connections = self.connections.write().await;
                for id in &failed {
                    connections.remove(id);
                }
                connections.len()
            };
            self.metrics.set_hub_connections(count);
            report.dropped = failed.len();
        }

        report
    }

    /// Relay every message on `channel` to all connections until `cancel` fires.
    ///
    /// Subscription failures and lag are logged and survived; only
    /// cancellation ends the listener.
    pub async fn run_listener(
        self: Arc<Self>,
        notifier: Arc<dyn Notifier>,
        channel: String,
        cancel: CancellationToken,
    ) {
        info!(channel = %channel, "Broadcast listener starting");

        'subscribe: while !cancel.is_cancelled() {
            let mut subscription = match notifier.subscribe(&channel).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(channel = %channel, error = %e, "Failed to subscribe, retrying");
                    self.report_health(Some(e.to_string())).await;
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };
            self.report_health(None).await;
            debug!(channel = %channel, "Subscribed to updates channel");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'subscribe,
                    next = tokio::time::timeout(self.config.poll_interval, subscription.recv()) => {
                        match next {
                            // Poll interval elapsed with nothing to relay
                            Err(_) => continue,
                            Ok(Ok(Some(message))) => {
                                let report = self.broadcast(&message).await;
                                debug!(
                                    delivered = report.delivered,
                                    dropped = report.dropped,
                                    "Relayed update"
                                );
                            }
                            Ok(Ok(None)) => {
                                warn!(channel = %channel, "Updates channel closed, resubscribing");
                                break;
                            }
                            Ok(Err(PubSubError::Lagged(skipped))) => {
                                warn!(skipped = skipped, "Listener lagged behind updates channel");
                            }
                            Ok(Err(e)) => {
                                error!(error = %e, "Error receiving update, resubscribing");
                                self.report_health(Some(e.to_string())).await;
                                if self.pause(&cancel).await {
                                    break 'subscribe;
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(channel = %channel, "Broadcast listener stopped");
    }

    /// Sleep for the resubscribe backoff; true if cancelled meanwhile
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.resubscribe_backoff) => false,
        }
    }

    async fn report_health(&self, problem: Option<String>) {
        if let Some(health) = &self.health {
            match problem {
                None => health.set_healthy(components::BROADCAST_HUB).await,
                Some(message) => health.set_degraded(components::BROADCAST_HUB, message).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{InMemoryPubSub, Subscription};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn hub(buffer: usize) -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(HubConfig {
            connection_buffer: buffer,
            poll_interval: Duration::from_millis(20),
            resubscribe_backoff: Duration::from_millis(10),
        }))
    }

    #[tokio::test]
    async fn test_every_observer_gets_every_message_in_order() {
        let hub = hub(64);
        let mut observers = Vec::new();
        for _ in 0..3 {
            observers.push(hub.connect().await);
        }

        for i in 0..10 {
            let report = hub.broadcast(&i.to_string()).await;
            assert_eq!(report, BroadcastReport { delivered: 3, dropped: 0 });
        }

        for observer in &mut observers {
            for i in 0..10 {
                assert_eq!(observer.receiver.recv().await.unwrap(), i.to_string());
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_leaves_others_untouched() {
        let hub = hub(8);
        let a = hub.connect().await;
        let mut b = hub.connect().await;

        assert!(hub.disconnect(a.id).await);
        assert!(!hub.disconnect(a.id).await);

        let report = hub.broadcast("update").await;
        assert_eq!(report.delivered, 1);
        assert_eq!(b.receiver.recv().await.unwrap(), "update");
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closed_observer_is_removed() {
        let hub = hub(8);
        let gone = hub.connect().await;
        let mut alive = hub.connect().await;
        drop(gone);

        let report = hub.broadcast("x").await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert_eq!(hub.connection_count().await, 1);
        assert_eq!(alive.receiver.recv().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_slow_observer_does_not_block_others() {
        let hub = hub(2);
        let _slow = hub.connect().await;
        let mut fast = hub.connect().await;

        for i in 0..3 {
            hub.broadcast(&i.to_string()).await;
            assert_eq!(fast.receiver.recv().await.unwrap(), i.to_string());
        }

        // Third message overflowed the slow outbox
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_listener_relays_and_stops_on_cancel() {
        let hub = hub(16);
        let pubsub = Arc::new(InMemoryPubSub::default());
        let cancel = CancellationToken::new();
        let mut observer = hub.connect().await;

        let listener = tokio::spawn(Arc::clone(&hub).run_listener(
            pubsub.clone(),
            "ticket_updates".to_string(),
            cancel.clone(),
        ));

        // Wait until the listener has subscribed
        while pubsub.subscriber_count("ticket_updates") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pubsub.publish("ticket_updates", "snapshot-1").await.unwrap();
        pubsub.publish("ticket_updates", "snapshot-2").await.unwrap();

        assert_eq!(observer.receiver.recv().await.unwrap(), "snapshot-1");
        assert_eq!(observer.receiver.recv().await.unwrap(), "snapshot-2");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener should stop on cancel")
            .unwrap();
    }

    struct FlakyNotifier {
        subscribes: AtomicUsize,
        inner: InMemoryPubSub,
    }

    struct FailingOnce {
        failed: bool,
        inner: Box<dyn Subscription>,
    }

    #[async_trait]
    impl Subscription for FailingOnce {
        async fn recv(&mut self) -> Result<Option<String>, PubSubError> {
            if !self.failed {
                self.failed = true;
                return Err(PubSubError::Backend("connection reset".into()));
            }
            self.inner.recv().await
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PubSubError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
            let n = self.subscribes.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(PubSubError::Backend("refused".into()));
            }
            Ok(Box::new(FailingOnce {
                failed: n > 1,
                inner: self.inner.subscribe(channel).await?,
            }))
        }
    }

    #[tokio::test]
    async fn test_listener_survives_subscription_errors() {
        let hub = hub(16);
        let notifier = Arc::new(FlakyNotifier {
            subscribes: AtomicUsize::new(0),
            inner: InMemoryPubSub::default(),
        });
        let cancel = CancellationToken::new();
        let mut observer = hub.connect().await;

        let listener = tokio::spawn(Arc::clone(&hub).run_listener(
            notifier.clone(),
            "ticket_updates".to_string(),
            cancel.clone(),
        ));

        // First subscribe is refused, second fails on recv, third is healthy
        while notifier.subscribes.load(Ordering::SeqCst) < 3
            || notifier.inner.subscriber_count("ticket_updates") == 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        notifier.publish("ticket_updates", "after-recovery").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), observer.receiver.recv())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("after-recovery"));

        cancel.cancel();
        listener.await.unwrap();
    }
}

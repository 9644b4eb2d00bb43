//! Channel-based publish/subscribe for ticket snapshots
//!
//! Publishers never wait for subscribers. A subscriber that falls behind the
//! channel buffer is told how many messages it missed and keeps receiving.
//! [`InMemoryPubSub`] serves a single process; `PgNotifier` (postgres
//! feature) carries updates between workers sharing one database.

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PgNotifier;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    #[error("subscriber lagged behind and skipped {0} messages")]
    Lagged(u64),

    #[error("pub/sub backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the channel has closed
    async fn recv(&mut self) -> Result<Option<String>, PubSubError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish to a channel and return how many subscribers were listening,
    /// or 0 when the backend cannot tell
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PubSubError>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError>;
}

/// In-process notifier with one broadcast channel per name
#[derive(Debug)]
pub struct InMemoryPubSub {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

struct BroadcastSubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn recv(&mut self) -> Result<Option<String>, PubSubError> {
        match self.rx.recv().await {
            Ok(message) => Ok(Some(message)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Err(PubSubError::Lagged(skipped))
            }
        }
    }
}

#[async_trait]
impl Notifier for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PubSubError> {
        // Sending with no receivers is not an error for a fire-and-forget channel
        let receivers = self.sender(channel).send(payload.to_string()).unwrap_or(0);
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
        Ok(Box::new(BroadcastSubscription {
            rx: self.sender(channel).subscribe(),
        }))
    }
}

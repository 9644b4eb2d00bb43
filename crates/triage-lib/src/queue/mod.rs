//! Consumer-group stream queue
//!
//! Tickets travel from ingestion to the pipeline over an ordered stream.
//! Each consumer group tracks which entries it has delivered and a
//! pending-entries list: a delivered message stays pending against the
//! consumer that read it until it is acknowledged, and can be redelivered to
//! that consumer or reclaimed by another one once it has been idle long
//! enough. Entries every group has acknowledged can be trimmed.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryStreamQueue;
#[cfg(feature = "postgres")]
pub use postgres::PgStreamQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Flat field map carried by a stream entry
pub type Fields = BTreeMap<String, String>;

/// Queue-assigned opaque message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivered stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: MessageId,
    pub fields: Fields,
    /// How many times this entry has been handed to a consumer, this delivery included
    pub delivery_count: u32,
}

/// Errors from the stream queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("consumer group `{group}` does not exist on stream `{topic}`")]
    NoSuchGroup { topic: String, group: String },

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Durable, ordered, multi-consumer log with consumer-group semantics
#[async_trait]
pub trait StreamQueue: Send + Sync {
    /// Create the group (and the stream) if missing; reading starts at the beginning of the stream
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), QueueError>;

    /// Append an entry and return its id
    async fn enqueue(&self, topic: &str, fields: Fields) -> Result<MessageId, QueueError>;

    /// Block until an entry never delivered to this group is available and claim it for `consumer`
    async fn read_next(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<QueueMessage, QueueError>;

    /// Redeliver the oldest entry pending against `consumer` whose id sorts
    /// after `after`, or `None` when there is none.
    ///
    /// Only the returned entry has its delivery count bumped, so a caller
    /// walks its pending list by passing back the id it was last given.
    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&MessageId>,
    ) -> Result<Option<QueueMessage>, QueueError>;

    /// Take over entries pending against any consumer for longer than `min_idle`
    async fn claim_idle(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge an entry; returns false if it was not pending
    async fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<bool, QueueError>;

    /// Number of delivered but unacknowledged entries in the group
    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize, QueueError>;

    /// Remove entries that every group on `topic` has acknowledged and
    /// return how many were removed. A topic without groups is left alone.
    async fn trim_acknowledged(&self, topic: &str) -> Result<usize, QueueError>;
}

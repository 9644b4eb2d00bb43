//! In-process stream queue
//!
//! Mirrors the consumer-group behaviour of a Redis stream closely enough
//! that the pipeline can be exercised end to end without infrastructure.

use super::{Fields, MessageId, QueueError, QueueMessage, StreamQueue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u32,
    last_delivered: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the first entry never delivered to this group
    cursor: usize,
    /// Pending entries keyed by stream index, so iteration is oldest first
    pending: BTreeMap<usize, PendingEntry>,
}

impl GroupState {
    /// Lowest index this group may still need
    fn low_water(&self) -> usize {
        self.pending
            .keys()
            .next()
            .copied()
            .map_or(self.cursor, |first| first.min(self.cursor))
    }
}

#[derive(Debug, Default)]
struct Stream {
    /// Retained entries keyed by their append index
    entries: BTreeMap<usize, (MessageId, Fields)>,
    positions: HashMap<MessageId, usize>,
    groups: HashMap<String, GroupState>,
    appended: usize,
    last_millis: i64,
    sequence: u64,
}

impl Stream {
    fn next_id(&mut self) -> MessageId {
        let now = chrono::Utc::now().timestamp_millis();
        if now > self.last_millis {
            self.last_millis = now;
            self.sequence = 0;
        } else {
            self.sequence += 1;
        }
        MessageId::new(format!("{}-{}", self.last_millis, self.sequence))
    }

    fn message_at(&self, index: usize, delivery_count: u32) -> Option<QueueMessage> {
        self.entries.get(&index).map(|(id, fields)| QueueMessage {
            id: id.clone(),
            fields: fields.clone(),
            delivery_count,
        })
    }
}

/// Stream queue held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryStreamQueue {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
}

impl InMemoryStreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently retained in `topic`
    pub async fn len(&self, topic: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(topic)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Copy of every retained entry in `topic`, in order
    pub async fn entries(&self, topic: &str) -> Vec<(MessageId, Fields)> {
        self.streams
            .lock()
            .await
            .get(topic)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn try_read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let appended = stream.appended;
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(topic, group))?;

        if state.cursor >= appended {
            return Ok(None);
        }

        let index = state.cursor;
        state.cursor += 1;
        state.pending.insert(
            index,
            PendingEntry {
                consumer: consumer.to_string(),
                delivery_count: 1,
                last_delivered: Instant::now(),
            },
        );

        // Trimming never passes a group's cursor, so the entry is retained
        Ok(stream.message_at(index, 1))
    }
}

fn no_group(topic: &str, group: &str) -> QueueError {
    QueueError::NoSuchGroup {
        topic: topic.to_string(),
        group: group.to_string(),
    }
}

#[async_trait]
impl StreamQueue for InMemoryStreamQueue {
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), QueueError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(topic.to_string()).or_default();
        if !stream.groups.contains_key(group) {
            // Start at the oldest retained entry
            let cursor = stream.entries.keys().next().copied().unwrap_or(stream.appended);
            stream.groups.insert(
                group.to_string(),
                GroupState {
                    cursor,
                    ..GroupState::default()
                },
            );
            debug!(topic = %topic, group = %group, "Consumer group created");
        }
        Ok(())
    }

    async fn enqueue(&self, topic: &str, fields: Fields) -> Result<MessageId, QueueError> {
        let id = {
            let mut streams = self.streams.lock().await;
            let stream = streams.entry(topic.to_string()).or_default();
            let id = stream.next_id();
            let index = stream.appended;
            stream.appended += 1;
            stream.positions.insert(id.clone(), index);
            stream.entries.insert(index, (id.clone(), fields));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_next(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<QueueMessage, QueueError> {
        loop {
            // Register interest before checking so an append between the
            // check and the await still wakes us.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(message) = self.try_read_new(topic, group, consumer).await? {
                return Ok(message);
            }

            appended.await;
        }
    }

    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&MessageId>,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let start = match after {
            Some(id) => match stream.positions.get(id) {
                Some(&index) => index + 1,
                // Trimmed, so everything still pending sorts after it
                None => 0,
            },
            None => 0,
        };
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(topic, group))?;

        let next = state
            .pending
            .range_mut(start..)
            .find(|(_, entry)| entry.consumer == consumer);
        let Some((&index, entry)) = next else {
            return Ok(None);
        };
        entry.delivery_count += 1;
        entry.last_delivered = Instant::now();
        let count = entry.delivery_count;

        Ok(stream.message_at(index, count))
    }

    async fn claim_idle(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(topic, group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (index, entry) in state.pending.iter_mut() {
            if now.duration_since(entry.last_delivered) >= min_idle {
                if entry.consumer != consumer {
                    debug!(
                        from = %entry.consumer,
                        to = %consumer,
                        "Reassigning idle pending entry"
                    );
                }
                entry.consumer = consumer.to_string();
                entry.delivery_count += 1;
                entry.last_delivered = now;
                claimed.push((*index, entry.delivery_count));
            }
        }

        Ok(claimed
            .into_iter()
            .filter_map(|(index, count)| stream.message_at(index, count))
            .collect())
    }

    async fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<bool, QueueError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let Some(&index) = stream.positions.get(id) else {
            return Ok(false);
        };
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(topic, group))?;

        Ok(state.pending.remove(&index).is_some())
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize, QueueError> {
        let streams = self.streams.lock().await;
        let state = streams
            .get(topic)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(topic, group))?;
        Ok(state.pending.len())
    }

    async fn trim_acknowledged(&self, topic: &str) -> Result<usize, QueueError> {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(topic) else {
            return Ok(0);
        };
        let Some(low_water) = stream.groups.values().map(GroupState::low_water).min() else {
            return Ok(0);
        };

        let retained = stream.entries.split_off(&low_water);
        let trimmed = std::mem::replace(&mut stream.entries, retained);
        for (id, _) in trimmed.values() {
            stream.positions.remove(id);
        }

        if !trimmed.is_empty() {
            debug!(topic = %topic, trimmed = trimmed.len(), "Trimmed acknowledged entries");
        }
        Ok(trimmed.len())
    }
}

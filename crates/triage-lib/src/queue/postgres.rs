//! PostgreSQL-backed stream queue
//!
//! Entries live in `stream_messages` and groups in `stream_groups`. Every
//! entry handed to a group gets a row in `stream_deliveries`, which doubles
//! as the pending-entries list until `acked_at` is set. A new read picks the
//! oldest entry without a delivery row for the group, locking it with
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never receive the same
//! entry. Entries committed out of id order are still delivered.

use super::{Fields, MessageId, QueueError, QueueMessage, StreamQueue};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

/// Stream queue stored in PostgreSQL
#[derive(Clone)]
pub struct PgStreamQueue {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgStreamQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// How long `read_next` sleeps between polls of an empty stream
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn require_group(&self, topic: &str, group: &str) -> Result<(), QueueError> {
        let exists: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM stream_groups WHERE topic = $1 AND group_name = $2",
        )
        .bind(topic)
        .bind(group)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match exists {
            Some(_) => Ok(()),
            None => Err(no_group(topic, group)),
        }
    }

    async fn try_read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<QueueMessage>, QueueError> {
        self.require_group(topic, group).await?;

        loop {
            let mut tx = self.pool.begin().await.map_err(backend)?;

            let candidate: Option<(i64, Json<Fields>)> = sqlx::query_as(
                r#"
                SELECT m.id, m.fields
                FROM   stream_messages m
                WHERE  m.topic = $1
                  AND  NOT EXISTS (
                           SELECT 1 FROM stream_deliveries d
                           WHERE  d.topic = m.topic
                             AND  d.group_name = $2
                             AND  d.message_id = m.id
                       )
                ORDER  BY m.id
                LIMIT  1
                FOR UPDATE OF m SKIP LOCKED
                "#,
            )
            .bind(topic)
            .bind(group)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

            let Some((id, Json(fields))) = candidate else {
                tx.commit().await.map_err(backend)?;
                return Ok(None);
            };

            let recorded = sqlx::query(
                "INSERT INTO stream_deliveries (topic, group_name, message_id, consumer) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            )
            .bind(topic)
            .bind(group)
            .bind(id)
            .bind(consumer)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            tx.commit().await.map_err(backend)?;

            if recorded.rows_affected() == 1 {
                return Ok(Some(QueueMessage {
                    id: MessageId::new(id.to_string()),
                    fields,
                    delivery_count: 1,
                }));
            }
            // Another consumer recorded this entry between our snapshot and the lock
            debug!(message_id = id, "Entry already delivered to the group, reading on");
        }
    }
}

fn backend(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn no_group(topic: &str, group: &str) -> QueueError {
    QueueError::NoSuchGroup {
        topic: topic.to_string(),
        group: group.to_string(),
    }
}

fn row_id(id: &MessageId) -> Option<i64> {
    id.as_str().parse().ok()
}

fn into_message((id, Json(fields), count): (i64, Json<Fields>, i32)) -> QueueMessage {
    QueueMessage {
        id: MessageId::new(id.to_string()),
        fields,
        delivery_count: count.max(0) as u32,
    }
}

#[async_trait]
impl StreamQueue for PgStreamQueue {
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), QueueError> {
        let created = sqlx::query(
            "INSERT INTO stream_groups (topic, group_name) VALUES ($1, $2) \
             ON CONFLICT (topic, group_name) DO NOTHING",
        )
        .bind(topic)
        .bind(group)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if created.rows_affected() > 0 {
            debug!(topic = %topic, group = %group, "Consumer group created");
        }
        Ok(())
    }

    async fn enqueue(&self, topic: &str, fields: Fields) -> Result<MessageId, QueueError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO stream_messages (topic, fields) VALUES ($1, $2) RETURNING id",
        )
        .bind(topic)
        .bind(Json(fields))
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(MessageId::new(id.to_string()))
    }

    async fn read_next(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<QueueMessage, QueueError> {
        loop {
            if let Some(message) = self.try_read_new(topic, group, consumer).await? {
                return Ok(message);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&MessageId>,
    ) -> Result<Option<QueueMessage>, QueueError> {
        self.require_group(topic, group).await?;

        let row: Option<(i64, Json<Fields>, i32)> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT message_id
                FROM   stream_deliveries
                WHERE  topic = $1 AND group_name = $2 AND consumer = $3
                  AND  acked_at IS NULL
                  AND  message_id > $4
                ORDER  BY message_id
                LIMIT  1
                FOR UPDATE SKIP LOCKED
            ),
            redelivered AS (
                UPDATE stream_deliveries d
                SET    delivery_count = d.delivery_count + 1,
                       last_delivered = NOW()
                FROM   next
                WHERE  d.topic = $1 AND d.group_name = $2
                  AND  d.message_id = next.message_id
                RETURNING d.message_id, d.delivery_count
            )
            SELECT m.id, m.fields, r.delivery_count
            FROM   redelivered r
            JOIN   stream_messages m ON m.id = r.message_id
            "#,
        )
        .bind(topic)
        .bind(group)
        .bind(consumer)
        .bind(after.and_then(row_id).unwrap_or(0))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(into_message))
    }

    async fn claim_idle(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.require_group(topic, group).await?;

        let rows: Vec<(i64, Json<Fields>, i32)> = sqlx::query_as(
            r#"
            WITH claimed AS (
                UPDATE stream_deliveries
                SET    consumer = $3,
                       delivery_count = delivery_count + 1,
                       last_delivered = NOW()
                WHERE  topic = $1 AND group_name = $2
                  AND  acked_at IS NULL
                  AND  last_delivered <= NOW() - make_interval(secs => $4)
                RETURNING message_id, delivery_count
            )
            SELECT m.id, m.fields, c.delivery_count
            FROM   claimed c
            JOIN   stream_messages m ON m.id = c.message_id
            ORDER  BY m.id
            "#,
        )
        .bind(topic)
        .bind(group)
        .bind(consumer)
        .bind(min_idle.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(into_message).collect())
    }

    async fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<bool, QueueError> {
        let Some(message_id) = row_id(id) else {
            return Ok(false);
        };

        let result = sqlx::query(
            "UPDATE stream_deliveries SET acked_at = NOW() \
             WHERE topic = $1 AND group_name = $2 AND message_id = $3 AND acked_at IS NULL",
        )
        .bind(topic)
        .bind(group)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize, QueueError> {
        self.require_group(topic, group).await?;

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM stream_deliveries \
             WHERE topic = $1 AND group_name = $2 AND acked_at IS NULL",
        )
        .bind(topic)
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(count.max(0) as usize)
    }

    async fn trim_acknowledged(&self, topic: &str) -> Result<usize, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM stream_messages m
            WHERE  m.topic = $1
              AND  EXISTS (SELECT 1 FROM stream_groups g WHERE g.topic = m.topic)
              AND  NOT EXISTS (
                       SELECT 1 FROM stream_groups g
                       WHERE  g.topic = m.topic
                         AND  NOT EXISTS (
                                  SELECT 1 FROM stream_deliveries d
                                  WHERE  d.topic = g.topic
                                    AND  d.group_name = g.group_name
                                    AND  d.message_id = m.id
                                    AND  d.acked_at IS NOT NULL
                              )
                   )
            "#,
        )
        .bind(topic)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let trimmed = result.rows_affected() as usize;
        if trimmed > 0 {
            debug!(topic = %topic, trimmed = trimmed, "Trimmed acknowledged entries");
        }
        Ok(trimmed)
    }
}

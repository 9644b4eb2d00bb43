//! Cross-process notifier on PostgreSQL LISTEN/NOTIFY
//!
//! A publish stores the payload in `pubsub_messages` and notifies the row id
//! in the same transaction, so subscribers see updates in commit order.
//! Stored payloads older than the retention window are removed on publish.

use super::{Notifier, PubSubError, Subscription};
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

fn backend(e: sqlx::Error) -> PubSubError {
    PubSubError::Backend(e.to_string())
}

/// Notifier shared by every worker connected to the same database
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
    retention: Duration,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retention: DEFAULT_RETENTION,
        }
    }

    /// How long a published payload stays readable
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

struct ListenerSubscription {
    listener: PgListener,
    pool: PgPool,
    /// Notified id whose payload has not been returned yet
    pending: Option<i64>,
}

impl ListenerSubscription {
    async fn next_id(&mut self) -> Result<i64, PubSubError> {
        loop {
            let Some(notification) = self.listener.try_recv().await.map_err(backend)? else {
                // The listener reconnects on the next call; updates sent meanwhile are lost
                warn!("Notification connection dropped, reconnecting");
                continue;
            };
            match notification.payload().parse() {
                Ok(id) => return Ok(id),
                Err(_) => warn!(
                    channel = notification.channel(),
                    payload = notification.payload(),
                    "Ignoring notification without a message id"
                ),
            }
        }
    }
}

#[async_trait]
impl Subscription for ListenerSubscription {
    async fn recv(&mut self) -> Result<Option<String>, PubSubError> {
        loop {
            let id = match self.pending {
                Some(id) => id,
                None => *self.pending.insert(self.next_id().await?),
            };

            let payload: Option<(String,)> =
                sqlx::query_as("SELECT payload FROM pubsub_messages WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
            self.pending = None;

            match payload {
                Some((payload,)) => return Ok(Some(payload)),
                None => warn!(message_id = id, "Update expired before it was read"),
            }
        }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PubSubError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO pubsub_messages (channel, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(channel)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        sqlx::query(
            "DELETE FROM pubsub_messages WHERE created_at < NOW() - make_interval(secs => $1)",
        )
        .bind(self.retention.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        debug!(channel = %channel, message_id = id, "Notified update");
        // NOTIFY does not report how many sessions are listening
        Ok(0)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(backend)?;
        listener.listen(channel).await.map_err(backend)?;

        Ok(Box::new(ListenerSubscription {
            listener,
            pool: self.pool.clone(),
            pending: None,
        }))
    }
}

/// Run with `TRIAGE_TEST_DATABASE_URL` set and `--features postgres -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PgTicketStore;
    use uuid::Uuid;

    async fn scratch_pool() -> PgPool {
        let url = std::env::var("TRIAGE_TEST_DATABASE_URL")
            .expect("TRIAGE_TEST_DATABASE_URL must name a scratch database");
        let pool = PgTicketStore::connect(&url).await.unwrap();
        PgTicketStore::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn next(subscription: &mut Box<dyn Subscription>) -> String {
        tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("no update within 5s")
            .unwrap()
            .expect("subscription closed")
    }

    #[tokio::test]
    #[ignore = "needs TRIAGE_TEST_DATABASE_URL"]
    async fn test_updates_cross_between_workers_in_order() {
        let pool = scratch_pool().await;
        let channel = format!("updates_{}", Uuid::new_v4().simple());
        // Two workers with their own notifier on the same database
        let worker_a = PgNotifier::new(pool.clone());
        let worker_b = PgNotifier::new(pool);

        let mut observer = worker_a.subscribe(&channel).await.unwrap();

        // Larger than a bare NOTIFY payload may be
        let large = "x".repeat(10_000);
        worker_b.publish(&channel, "first").await.unwrap();
        worker_b.publish(&channel, &large).await.unwrap();
        worker_a.publish(&channel, "third").await.unwrap();

        assert_eq!(next(&mut observer).await, "first");
        assert_eq!(next(&mut observer).await, large);
        assert_eq!(next(&mut observer).await, "third");
    }

    #[tokio::test]
    #[ignore = "needs TRIAGE_TEST_DATABASE_URL"]
    async fn test_other_channels_are_not_received() {
        let pool = scratch_pool().await;
        let channel = format!("updates_{}", Uuid::new_v4().simple());
        let notifier = PgNotifier::new(pool);

        let mut observer = notifier.subscribe(&channel).await.unwrap();
        notifier.publish("some_other_channel", "noise").await.unwrap();
        notifier.publish(&channel, "mine").await.unwrap();

        assert_eq!(next(&mut observer).await, "mine");
    }
}

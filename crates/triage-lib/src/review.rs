//! Human review of low-confidence tickets

use crate::models::{ReviewInput, Ticket, TicketStatus};
use crate::observability::{StructuredLogger, TriageMetrics};
use crate::pubsub::Notifier;
use crate::store::{StoreError, TicketStore};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("invalid review: {0}")]
    InvalidInput(String),

    #[error("ticket {0} not found")]
    NotFound(Uuid),

    #[error("ticket {ticket_id} is {status}, not pending review")]
    NotPendingReview {
        ticket_id: Uuid,
        status: TicketStatus,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReviewError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ReviewError::NotFound(id),
            StoreError::InvalidTransition { ticket_id, from, .. } => ReviewError::NotPendingReview {
                ticket_id,
                status: from,
            },
            other => ReviewError::Store(other),
        }
    }
}

/// Completes PENDING_REVIEW tickets with reviewer labels
pub struct ReviewService {
    store: Arc<dyn TicketStore>,
    notifier: Arc<dyn Notifier>,
    channel: String,
    metrics: TriageMetrics,
    logger: StructuredLogger,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn TicketStore>,
        notifier: Arc<dyn Notifier>,
        channel: impl Into<String>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            notifier,
            channel: channel.into(),
            metrics: TriageMetrics::new(),
            logger,
        }
    }

    /// Move a ticket from PENDING_REVIEW to COMPLETED and publish the result.
    ///
    /// The store only applies the transition to a ticket that is still
    /// pending, so a second submission for the same ticket is rejected.
    /// The snapshot is published once the row is committed. A publish
    /// failure does not undo the review; it is logged and counted under the
    /// `publish` error kind.
    pub async fn submit(
        &self,
        ticket_id: Uuid,
        final_category: &str,
        final_priority: &str,
    ) -> Result<Ticket, ReviewError> {
        let review = ReviewInput {
            final_category: final_category.trim().to_string(),
            final_priority: final_priority.trim().to_string(),
        };
        if review.final_category.is_empty() {
            return Err(ReviewError::InvalidInput("final_category must not be empty".into()));
        }
        if review.final_priority.is_empty() {
            return Err(ReviewError::InvalidInput("final_priority must not be empty".into()));
        }

        let ticket = self.store.apply_review(ticket_id, &review, Utc::now()).await?;

        self.metrics.inc_reviews_completed();
        self.logger
            .log_review(&ticket_id, &review.final_category, &review.final_priority);

        match ticket.snapshot_json() {
            Ok(snapshot) => {
                if let Err(e) = self.notifier.publish(&self.channel, &snapshot).await {
                    self.metrics.inc_processing_error("publish");
                    error!(ticket_id = %ticket_id, error = %e, "Failed to publish review update");
                }
            }
            Err(e) => {
                self.metrics.inc_processing_error("publish");
                error!(ticket_id = %ticket_id, error = %e, "Failed to encode review update");
            }
        }

        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Decision, DecisionUpdate};
    use crate::models::NewTicket;
    use crate::pubsub::{InMemoryPubSub, PubSubError, Subscription};
    use crate::store::InMemoryTicketStore;

    async fn pending_ticket(store: &InMemoryTicketStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .insert_processing_ticket(NewTicket {
                ticket_id: id,
                subject: "Billing".into(),
                description: "charged twice".into(),
                category_model_id: 1,
                priority_model_id: 2,
            })
            .await
            .unwrap();
        store
            .record_decision(
                id,
                &DecisionUpdate {
                    predicted_category: "Billing".into(),
                    predicted_priority: "Low".into(),
                    category_confidence: 0.5,
                    priority_confidence: 0.6,
                    decision: Decision::HumanReview,
                },
            )
            .await
            .unwrap();
        id
    }

    fn service(store: Arc<InMemoryTicketStore>, pubsub: Arc<InMemoryPubSub>) -> ReviewService {
        ReviewService::new(store, pubsub, "ticket_updates", StructuredLogger::new("review-test"))
    }

    #[tokio::test]
    async fn test_review_completes_and_publishes_once() {
        let store = Arc::new(InMemoryTicketStore::new());
        let pubsub = Arc::new(InMemoryPubSub::default());
        let mut updates = pubsub.subscribe("ticket_updates").await.unwrap();
        let id = pending_ticket(&store).await;

        let ticket = service(store.clone(), pubsub.clone())
            .submit(id, "Billing", " High ")
            .await
            .unwrap();

        assert_eq!(ticket.status, TicketStatus::Completed);
        assert_eq!(ticket.final_priority.as_deref(), Some("High"));
        assert!(ticket.reviewed_at.is_some());

        let published: Ticket =
            serde_json::from_str(&updates.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(published, ticket);
    }

    #[tokio::test]
    async fn test_second_review_conflicts() {
        let store = Arc::new(InMemoryTicketStore::new());
        let pubsub = Arc::new(InMemoryPubSub::default());
        let id = pending_ticket(&store).await;
        let reviews = service(store, pubsub);

        tokio_test::assert_ok!(reviews.submit(id, "Billing", "High").await);
        let err = tokio_test::assert_err!(reviews.submit(id, "Billing", "Low").await);

        assert!(matches!(
            err,
            ReviewError::NotPendingReview { status: TicketStatus::Completed, .. }
        ));
    }

    struct UnreachableNotifier;

    #[async_trait::async_trait]
    impl Notifier for UnreachableNotifier {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<usize, PubSubError> {
            Err(PubSubError::Backend("connection refused".into()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
            Err(PubSubError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_review_and_is_counted() {
        let store = Arc::new(InMemoryTicketStore::new());
        let id = pending_ticket(&store).await;
        let reviews = ReviewService::new(
            store.clone(),
            Arc::new(UnreachableNotifier),
            "ticket_updates",
            StructuredLogger::new("review-test"),
        );
        let metrics = TriageMetrics::new();
        let before = metrics.processing_errors("publish");

        let ticket = tokio_test::assert_ok!(reviews.submit(id, "Billing", "High").await);

        assert_eq!(ticket.status, TicketStatus::Completed);
        assert_eq!(
            store.get_ticket(id).await.unwrap().unwrap().status,
            TicketStatus::Completed
        );
        // Other tests share the process-wide counter
        assert!(metrics.processing_errors("publish") > before);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_not_found() {
        let reviews = service(
            Arc::new(InMemoryTicketStore::new()),
            Arc::new(InMemoryPubSub::default()),
        );
        let err = reviews.submit(Uuid::new_v4(), "A", "B").await.unwrap_err();
        assert!(matches!(err, ReviewError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_blank_labels_rejected_before_store() {
        let store = Arc::new(InMemoryTicketStore::new());
        let id = pending_ticket(&store).await;
        let reviews = service(store.clone(), Arc::new(InMemoryPubSub::default()));

        let err = reviews.submit(id, "  ", "High").await.unwrap_err();
        assert!(matches!(err, ReviewError::InvalidInput(_)));

        let ticket = store.get_ticket(id).await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::PendingReview);
    }
}

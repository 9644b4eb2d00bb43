//! In-memory ticket store

use super::{transition_error, InsertOutcome, StoreError, TicketStore};
use crate::decision::DecisionUpdate;
use crate::models::{ModelRecord, NewTicket, ReviewInput, Ticket, TicketStats, TicketStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    /// Tickets in insertion order
    tickets: Vec<Ticket>,
    index: HashMap<Uuid, usize>,
    models: Vec<ModelRecord>,
}

impl MemoryState {
    fn ticket_mut(&mut self, ticket_id: Uuid) -> Option<&mut Ticket> {
        let position = *self.index.get(&ticket_id)?;
        self.tickets.get_mut(position)
    }
}

/// Ticket store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    state: RwLock<MemoryState>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ticket rows
    pub async fn ticket_count(&self) -> usize {
        self.state.read().await.tickets.len()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn get_or_create_model_record(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ModelRecord, StoreError> {
        let mut state = self.state.write().await;

        for record in state.models.iter_mut() {
            if record.model_name == name && record.model_version != version {
                record.is_active = false;
            }
        }

        if let Some(record) = state
            .models
            .iter_mut()
            .find(|r| r.model_name == name && r.model_version == version)
        {
            record.is_active = true;
            return Ok(record.clone());
        }

        let record = ModelRecord {
            model_id: state.models.len() as i64 + 1,
            model_name: name.to_string(),
            model_version: version.to_string(),
            deployed_at: Utc::now(),
            is_active: true,
        };
        state.models.push(record.clone());
        Ok(record)
    }

    async fn insert_processing_ticket(&self, new: NewTicket) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.ticket_mut(new.ticket_id) {
            if existing.status == TicketStatus::Processing {
                existing.category_model_id = Some(new.category_model_id);
                existing.priority_model_id = Some(new.priority_model_id);
            }
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let ticket = Ticket {
            ticket_id: new.ticket_id,
            subject: new.subject,
            description: new.description,
            status: TicketStatus::Processing,
            predicted_category: None,
            predicted_priority: None,
            prediction_confidence_category: None,
            prediction_confidence_priority: None,
            category_model_id: Some(new.category_model_id),
            priority_model_id: Some(new.priority_model_id),
            final_category: None,
            final_priority: None,
            created_at: Utc::now(),
            reviewed_at: None,
            used_for_retraining: false,
        };

        let position = state.tickets.len();
        state.index.insert(ticket.ticket_id, position);
        state.tickets.push(ticket.clone());
        Ok(InsertOutcome::Created(ticket))
    }

    async fn record_decision(
        &self,
        ticket_id: Uuid,
        update: &DecisionUpdate,
    ) -> Result<Ticket, StoreError> {
        let mut state = self.state.write().await;
        let ticket = state
            .ticket_mut(ticket_id)
            .ok_or(StoreError::NotFound(ticket_id))?;

        if ticket.status != TicketStatus::Processing {
            return Err(transition_error(
                ticket_id,
                Some(ticket.status),
                TicketStatus::Processing,
            ));
        }

        ticket.status = update.status();
        ticket.predicted_category = Some(update.predicted_category.clone());
        ticket.predicted_priority = Some(update.predicted_priority.clone());
        ticket.prediction_confidence_category = Some(update.category_confidence);
        ticket.prediction_confidence_priority = Some(update.priority_confidence);
        if let Some((category, priority)) = update.final_labels() {
            ticket.final_category = Some(category.to_string());
            ticket.final_priority = Some(priority.to_string());
        }

        Ok(ticket.clone())
    }

    async fn apply_review(
        &self,
        ticket_id: Uuid,
        review: &ReviewInput,
        reviewed_at: DateTime<Utc>,
    ) -> Result<Ticket, StoreError> {
        let mut state = self.state.write().await;
        let ticket = state
            .ticket_mut(ticket_id)
            .ok_or(StoreError::NotFound(ticket_id))?;

        if ticket.status != TicketStatus::PendingReview {
            return Err(transition_error(
                ticket_id,
                Some(ticket.status),
                TicketStatus::PendingReview,
            ));
        }

        ticket.status = TicketStatus::Completed;
        ticket.final_category = Some(review.final_category.clone());
        ticket.final_priority = Some(review.final_priority.clone());
        ticket.reviewed_at = Some(reviewed_at);

        Ok(ticket.clone())
    }

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .index
            .get(&ticket_id)
            .and_then(|&i| state.tickets.get(i))
            .cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let state = self.state.read().await;
        Ok(state.tickets.iter().rev().take(limit).cloned().collect())
    }

    async fn list_pending_review(&self, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tickets
            .iter()
            .filter(|t| t.status == TicketStatus::PendingReview)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<TicketStats, StoreError> {
        let state = self.state.read().await;
        Ok(TicketStats::from_tickets(&state.tickets))
    }

    async fn list_models(&self) -> Result<Vec<ModelRecord>, StoreError> {
        Ok(self.state.read().await.models.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;

    fn new_ticket(id: Uuid) -> NewTicket {
        NewTicket {
            ticket_id: id,
            subject: "Cannot connect to VPN".into(),
            description: "timeout error".into(),
            category_model_id: 1,
            priority_model_id: 2,
        }
    }

    fn update(decision: Decision) -> DecisionUpdate {
        DecisionUpdate {
            predicted_category: "Network".into(),
            predicted_priority: "High".into(),
            category_confidence: 0.6,
            priority_confidence: 0.9,
            decision,
        }
    }

    #[tokio::test]
    async fn test_model_record_is_idempotent_with_single_active() {
        let store = InMemoryTicketStore::new();

        let v1 = store.get_or_create_model_record("category_classifier", "1").await.unwrap();
        let again = store.get_or_create_model_record("category_classifier", "1").await.unwrap();
        assert_eq!(v1.model_id, again.model_id);

        let v2 = store.get_or_create_model_record("category_classifier", "2").await.unwrap();
        store.get_or_create_model_record("priority_classifier", "1").await.unwrap();

        let models = store.list_models().await.unwrap();
        let active: Vec<_> = models
            .iter()
            .filter(|m| m.model_name == "category_classifier" && m.is_active)
            .collect();
        assert_eq!(models.len(), 3);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].model_id, v2.model_id);

        // Rolling back reactivates the old record rather than inserting
        let back = store.get_or_create_model_record("category_classifier", "1").await.unwrap();
        assert_eq!(back.model_id, v1.model_id);
        assert!(back.is_active);
        assert_eq!(store.list_models().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryTicketStore::new();
        let id = Uuid::new_v4();

        let first = store.insert_processing_ticket(new_ticket(id)).await.unwrap();
        assert!(matches!(first, InsertOutcome::Created(_)));

        let mut redelivered = new_ticket(id);
        redelivered.category_model_id = 7;
        let second = store.insert_processing_ticket(redelivered).await.unwrap();

        assert!(matches!(second, InsertOutcome::Existing(_)));
        assert_eq!(second.ticket().category_model_id, Some(7));
        assert_eq!(store.ticket_count().await, 1);
    }

    #[tokio::test]
    async fn test_decided_ticket_keeps_models_on_reinsert() {
        let store = InMemoryTicketStore::new();
        let id = Uuid::new_v4();
        store.insert_processing_ticket(new_ticket(id)).await.unwrap();
        store.record_decision(id, &update(Decision::HumanReview)).await.unwrap();

        let mut redelivered = new_ticket(id);
        redelivered.category_model_id = 9;
        let outcome = store.insert_processing_ticket(redelivered).await.unwrap();

        assert_eq!(outcome.ticket().status, TicketStatus::PendingReview);
        assert_eq!(outcome.ticket().category_model_id, Some(1));
    }

    #[tokio::test]
    async fn test_auto_complete_copies_predictions_to_final() {
        let store = InMemoryTicketStore::new();
        let id = Uuid::new_v4();
        store.insert_processing_ticket(new_ticket(id)).await.unwrap();

        let ticket = store.record_decision(id, &update(Decision::AutoComplete)).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Completed);
        assert_eq!(ticket.final_category.as_deref(), Some("Network"));
        assert_eq!(ticket.final_priority.as_deref(), Some("High"));
        assert!(ticket.reviewed_at.is_none());
        assert!(!ticket.used_for_retraining);
    }

    #[tokio::test]
    async fn test_decision_applies_once() {
        let store = InMemoryTicketStore::new();
        let id = Uuid::new_v4();
        store.insert_processing_ticket(new_ticket(id)).await.unwrap();

        let ticket = store.record_decision(id, &update(Decision::HumanReview)).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::PendingReview);
        assert!(ticket.final_category.is_none());

        let err = store
            .record_decision(id, &update(Decision::AutoComplete))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: TicketStatus::PendingReview, .. }
        ));
    }

    #[tokio::test]
    async fn test_review_completes_pending_ticket_once() {
        let store = InMemoryTicketStore::new();
        let id = Uuid::new_v4();
        store.insert_processing_ticket(new_ticket(id)).await.unwrap();
        store.record_decision(id, &update(Decision::HumanReview)).await.unwrap();

        let review = ReviewInput {
            final_category: "Hardware".into(),
            final_priority: "Low".into(),
        };
        let now = Utc::now();
        let ticket = store.apply_review(id, &review, now).await.unwrap();

        assert_eq!(ticket.status, TicketStatus::Completed);
        assert_eq!(ticket.final_category.as_deref(), Some("Hardware"));
        assert_eq!(ticket.predicted_category.as_deref(), Some("Network"));
        assert_eq!(ticket.reviewed_at, Some(now));

        let err = store.apply_review(id, &review, now).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_review_unknown_ticket() {
        let store = InMemoryTicketStore::new();
        let review = ReviewInput {
            final_category: "A".into(),
            final_priority: "B".into(),
        };
        let err = store
            .apply_review(Uuid::new_v4(), &review, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_listing_order_and_stats() {
        let store = InMemoryTicketStore::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.insert_processing_ticket(new_ticket(*id)).await.unwrap();
        }
        store.record_decision(ids[0], &update(Decision::HumanReview)).await.unwrap();
        store.record_decision(ids[1], &update(Decision::AutoComplete)).await.unwrap();
        store.record_decision(ids[2], &update(Decision::HumanReview)).await.unwrap();

        let recent = store.list_recent(2).await.unwrap();
        assert_eq!(recent[0].ticket_id, ids[3]);
        assert_eq!(recent[1].ticket_id, ids[2]);

        let pending = store.list_pending_review(10).await.unwrap();
        assert_eq!(
            pending.iter().map(|t| t.ticket_id).collect::<Vec<_>>(),
            vec![ids[0], ids[2]]
        );

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.status_breakdown.pending_review, 2);
        assert_eq!(stats.status_breakdown.completed, 1);
        assert_eq!(stats.status_breakdown.processing, 1);
        assert_eq!(stats.category_breakdown.get("Network"), Some(&3));
    }
}

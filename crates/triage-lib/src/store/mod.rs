//! Ticket and model-version persistence
//!
//! All state transitions are guarded by the current status, so a
//! redelivered message or a duplicate review can never move a ticket twice.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryTicketStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTicketStore;

use crate::decision::DecisionUpdate;
use crate::models::{ModelRecord, NewTicket, ReviewInput, Ticket, TicketStats, TicketStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ticket {0} not found")]
    NotFound(Uuid),

    #[error("ticket {ticket_id} is {from}, expected {expected}")]
    InvalidTransition {
        ticket_id: Uuid,
        from: TicketStatus,
        expected: TicketStatus,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Result of inserting a ticket the pipeline has just dequeued
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Ticket),
    /// The row already existed, for example after a redelivery
    Existing(Ticket),
}

impl InsertOutcome {
    pub fn ticket(&self) -> &Ticket {
        match self {
            InsertOutcome::Created(t) | InsertOutcome::Existing(t) => t,
        }
    }

    pub fn into_ticket(self) -> Ticket {
        match self {
            InsertOutcome::Created(t) | InsertOutcome::Existing(t) => t,
        }
    }
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Find or insert the record for `(name, version)` and make it the only
    /// active record for `name`, in one transaction
    async fn get_or_create_model_record(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ModelRecord, StoreError>;

    /// Insert a PROCESSING row keyed by the submission's ticket id.
    ///
    /// An existing row is returned unchanged unless it is still PROCESSING,
    /// in which case its model ids are updated to the ones now in use.
    async fn insert_processing_ticket(&self, ticket: NewTicket) -> Result<InsertOutcome, StoreError>;

    /// Move a PROCESSING ticket to its decided state
    async fn record_decision(
        &self,
        ticket_id: Uuid,
        update: &DecisionUpdate,
    ) -> Result<Ticket, StoreError>;

    /// Complete a PENDING_REVIEW ticket with reviewer labels
    async fn apply_review(
        &self,
        ticket_id: Uuid,
        review: &ReviewInput,
        reviewed_at: DateTime<Utc>,
    ) -> Result<Ticket, StoreError>;

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError>;

    /// Newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<Ticket>, StoreError>;

    /// Oldest first, so reviewers work the queue in arrival order
    async fn list_pending_review(&self, limit: usize) -> Result<Vec<Ticket>, StoreError>;

    async fn stats(&self) -> Result<TicketStats, StoreError>;

    async fn list_models(&self) -> Result<Vec<ModelRecord>, StoreError>;
}

/// Error for a guarded transition that matched no row
pub(crate) fn transition_error(
    ticket_id: Uuid,
    current: Option<TicketStatus>,
    expected: TicketStatus,
) -> StoreError {
    match current {
        Some(from) => StoreError::InvalidTransition {
            ticket_id,
            from,
            expected,
        },
        None => StoreError::NotFound(ticket_id),
    }
}

//! Ticket submission onto the processing stream

use crate::models::TicketSubmission;
use crate::queue::{MessageId, QueueError, StreamQueue};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("subject must not be empty")]
    EmptySubject,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A ticket accepted for asynchronous processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub ticket_id: Uuid,
    pub message_id: MessageId,
}

pub struct TicketIngestor {
    queue: Arc<dyn StreamQueue>,
    topic: String,
}

impl TicketIngestor {
    pub fn new(queue: Arc<dyn StreamQueue>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }

    /// Assign a ticket id and enqueue the submission.
    ///
    /// Returns as soon as the entry is on the stream; classification
    /// happens later in the pipeline.
    pub async fn submit(&self, subject: &str, description: &str) -> Result<Accepted, IngestError> {
        if subject.trim().is_empty() {
            return Err(IngestError::EmptySubject);
        }

        let submission = TicketSubmission::new(subject, description);
        let message_id = self.queue.enqueue(&self.topic, submission.to_fields()).await?;

        info!(
            ticket_id = %submission.ticket_id,
            message_id = %message_id,
            "Ticket enqueued"
        );

        Ok(Accepted {
            ticket_id: submission.ticket_id,
            message_id,
        })
    }
}

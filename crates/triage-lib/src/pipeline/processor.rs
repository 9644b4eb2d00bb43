use super::{PipelineConfig, PipelineError};
use crate::cache::{ModelCache, ModelSlot};
use crate::decision::{average_confidence, decide, Decision, DecisionUpdate};
use crate::models::{ModelRecord, NewTicket, Ticket, TicketStatus, TicketSubmission};
use crate::observability::{StructuredLogger, TriageMetrics};
use crate::preprocess::TextNormalizer;
use crate::pubsub::Notifier;
use crate::queue::QueueMessage;
use crate::registry::{Classifier, Prediction};
use crate::store::{InsertOutcome, TicketStore};
use std::sync::Arc;
use tracing::debug;

/// What a successful pass did with a ticket
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Classified and moved out of PROCESSING on this pass
    Decided {
        ticket: Ticket,
        decision: Decision,
        average_confidence: f64,
    },
    /// A previous delivery already decided the ticket; its snapshot was re-published
    AlreadyDecided { ticket: Ticket },
}

impl ProcessOutcome {
    pub fn ticket(&self) -> &Ticket {
        match self {
            ProcessOutcome::Decided { ticket, .. } | ProcessOutcome::AlreadyDecided { ticket } => {
                ticket
            }
        }
    }
}

/// A champion that is loaded and has a model record
struct BoundModel {
    handle: Arc<dyn Classifier>,
    record: ModelRecord,
}

/// Runs one delivery of a ticket through classification and persistence.
///
/// Every step is safe to repeat: the insert is keyed by the submission's
/// ticket id and the decision write only applies to a PROCESSING row.
pub struct TicketProcessor {
    cache: Arc<ModelCache>,
    store: Arc<dyn TicketStore>,
    notifier: Arc<dyn Notifier>,
    normalizer: Arc<dyn TextNormalizer>,
    config: PipelineConfig,
    metrics: TriageMetrics,
    logger: StructuredLogger,
}

impl TicketProcessor {
    pub fn new(
        cache: Arc<ModelCache>,
        store: Arc<dyn TicketStore>,
        notifier: Arc<dyn Notifier>,
        normalizer: Arc<dyn TextNormalizer>,
        config: PipelineConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cache,
            store,
            notifier,
            normalizer,
            config,
            metrics: TriageMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn process(&self, message: &QueueMessage) -> Result<ProcessOutcome, PipelineError> {
        let submission = TicketSubmission::from_fields(&message.fields)?;
        self.logger.log_ticket_received(
            &submission.ticket_id,
            message.id.as_str(),
            message.delivery_count,
        );

        if let Some(existing) = self.store.get_ticket(submission.ticket_id).await? {
            if existing.status != TicketStatus::Processing {
                return self.republish(existing).await;
            }
        }

        let category = self.bind(ModelSlot::Category).await?;
        let priority = self.bind(ModelSlot::Priority).await?;

        let inserted = self
            .store
            .insert_processing_ticket(NewTicket {
                ticket_id: submission.ticket_id,
                subject: submission.subject.clone(),
                description: submission.description.clone(),
                category_model_id: category.record.model_id,
                priority_model_id: priority.record.model_id,
            })
            .await?;
        // Another consumer may have decided it between the lookup and the insert
        if matches!(&inserted, InsertOutcome::Existing(t) if t.status != TicketStatus::Processing) {
            return self.republish(inserted.into_ticket()).await;
        }
        self.publish(inserted.ticket()).await?;

        let text = self
            .normalizer
            .normalize(&submission.subject, &submission.description);
        debug!(ticket_id = %submission.ticket_id, text = %text, "Normalized ticket text");

        let category_prediction = self
            .predict(ModelSlot::Category, category.handle, text.clone())
            .await?;
        let priority_prediction = self
            .predict(ModelSlot::Priority, priority.handle, text)
            .await?;

        let average = average_confidence(
            category_prediction.confidence,
            priority_prediction.confidence,
        );
        let decision = decide(average, self.config.threshold);

        let update = DecisionUpdate {
            predicted_category: category_prediction.label,
            predicted_priority: priority_prediction.label,
            category_confidence: category_prediction.confidence,
            priority_confidence: priority_prediction.confidence,
            decision,
        };
        let ticket = self
            .store
            .record_decision(submission.ticket_id, &update)
            .await?;
        self.publish(&ticket).await?;

        self.metrics
            .observe_confidence(ModelSlot::Category.as_str(), update.category_confidence);
        self.metrics
            .observe_confidence(ModelSlot::Priority.as_str(), update.priority_confidence);
        self.metrics.inc_processed(decision.metric_label());
        self.logger.log_decision(
            &ticket.ticket_id,
            &update.predicted_category,
            update.category_confidence,
            &update.predicted_priority,
            update.priority_confidence,
            average,
            self.config.threshold.value(),
            ticket.status.as_str(),
        );

        Ok(ProcessOutcome::Decided {
            ticket,
            decision,
            average_confidence: average,
        })
    }

    async fn bind(&self, slot: ModelSlot) -> Result<BoundModel, PipelineError> {
        let resolved = self.cache.resolve(slot).await;
        let (handle, version) = resolved
            .ready()
            .ok_or(PipelineError::ModelUnavailable { slot })?;
        let record = self
            .store
            .get_or_create_model_record(&resolved.model_name, version)
            .await?;

        Ok(BoundModel { handle, record })
    }

    /// Run one model off the async runtime, bounded by the prediction timeout if set
    async fn predict(
        &self,
        slot: ModelSlot,
        handle: Arc<dyn Classifier>,
        text: String,
    ) -> Result<Prediction, PipelineError> {
        let task = tokio::task::spawn_blocking(move || handle.predict_confidence(&text));

        let joined = match self.config.prediction_timeout {
            Some(after) => tokio::time::timeout(after, task)
                .await
                .map_err(|_| PipelineError::PredictionTimeout { slot, after })?,
            None => task.await,
        };

        joined
            .map_err(|e| PipelineError::PredictionTask {
                slot,
                message: e.to_string(),
            })?
            .map_err(|source| PipelineError::Prediction { slot, source })
    }

    async fn republish(&self, ticket: Ticket) -> Result<ProcessOutcome, PipelineError> {
        debug!(
            ticket_id = %ticket.ticket_id,
            status = %ticket.status,
            "Ticket already decided, skipping classification"
        );
        self.publish(&ticket).await?;
        Ok(ProcessOutcome::AlreadyDecided { ticket })
    }

    async fn publish(&self, ticket: &Ticket) -> Result<(), PipelineError> {
        let snapshot = ticket.snapshot_json()?;
        let receivers = self
            .notifier
            .publish(&self.config.updates_channel, &snapshot)
            .await?;
        debug!(ticket_id = %ticket.ticket_id, status = %ticket.status, receivers, "Published ticket snapshot");
        Ok(())
    }
}

use super::{Disposition, PipelineConfig, PipelineError, ProcessOutcome, TicketProcessor};
use crate::health::{components, HealthRegistry};
use crate::observability::{StructuredLogger, TriageMetrics};
use crate::queue::{MessageId, QueueError, QueueMessage, StreamQueue};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the consumer loop did with one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Acked,
    /// Copied to the dead-letter topic and acknowledged
    DeadLettered,
    /// Left pending; it will be redelivered after backoff
    RetryLater,
}

/// At-least-once consumer for the ticket stream.
///
/// A message is acknowledged only after it has been fully processed. A
/// failed message stays pending while the loop moves on to new entries;
/// this consumer's pending entries are redelivered one at a time on
/// startup and again each time the retry backoff elapses after a failure.
pub struct PipelineWorker {
    queue: Arc<dyn StreamQueue>,
    processor: TicketProcessor,
    metrics: TriageMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
    acks_since_trim: AtomicU32,
}

impl PipelineWorker {
    pub fn new(
        queue: Arc<dyn StreamQueue>,
        processor: TicketProcessor,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            queue,
            processor,
            metrics: TriageMetrics::new(),
            logger,
            health: None,
            acks_since_trim: AtomicU32::new(0),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    fn config(&self) -> &PipelineConfig {
        self.processor.config()
    }

    /// Consume until `cancel` fires. A message being processed when
    /// cancellation arrives is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        let config = self.config().clone();
        info!(
            topic = %config.topic,
            group = %config.group,
            consumer = %config.consumer,
            "Pipeline worker starting"
        );

        if !self.join_group(&cancel).await {
            return;
        }

        // Entries left behind by a previous run of this consumer are due at once
        let mut retry_at = Some(Instant::now());

        while !cancel.is_cancelled() {
            if retry_at.is_some_and(|at| at <= Instant::now()) {
                retry_at = match self.retry_pending(&cancel).await {
                    Ok(true) => None,
                    Ok(false) => Some(Instant::now() + config.retry_backoff),
                    Err(e) => {
                        self.queue_failed(&e).await;
                        Some(Instant::now() + config.retry_backoff)
                    }
                };
            }

            if let Some(min_idle) = config.reclaim_idle_after {
                match self
                    .queue
                    .claim_idle(&config.topic, &config.group, &config.consumer, min_idle)
                    .await
                {
                    Ok(claimed) if !claimed.is_empty() => {
                        info!(count = claimed.len(), "Claimed idle pending entries");
                        for message in claimed {
                            if self.handle_message(message).await == HandleOutcome::RetryLater {
                                retry_at = retry_at.or(Some(Instant::now() + config.retry_backoff));
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to claim idle entries"),
                }
            }

            // Wake up for the next pending retry or idle reclaim
            let reclaim_at = config
                .reclaim_idle_after
                .map(|min_idle| Instant::now() + min_idle);
            let wake_at = match (retry_at, reclaim_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let read = self.queue.read_next(&config.topic, &config.group, &config.consumer);
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = async {
                    match wake_at {
                        Some(deadline) => tokio::time::timeout_at(deadline, read).await.ok(),
                        None => Some(read.await),
                    }
                } => next,
            };

            match next {
                None => continue,
                Some(Ok(message)) => {
                    if let Some(health) = &self.health {
                        health.set_healthy(components::QUEUE).await;
                    }
                    if self.handle_message(message).await == HandleOutcome::RetryLater {
                        retry_at = retry_at.or(Some(Instant::now() + config.retry_backoff));
                        if self.backoff(&cancel).await {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    self.queue_failed(&e).await;
                    if self.backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        info!(consumer = %config.consumer, "Pipeline worker stopped");
    }

    /// Redeliver this consumer's pending entries one at a time, oldest first.
    /// Each entry is settled on its own; returns true once none is left to retry.
    async fn retry_pending(&self, cancel: &CancellationToken) -> Result<bool, QueueError> {
        let config = self.config();
        let mut after: Option<MessageId> = None;
        let mut settled = true;
        let mut redelivered = 0usize;

        while !cancel.is_cancelled() {
            let Some(message) = self
                .queue
                .read_pending(&config.topic, &config.group, &config.consumer, after.as_ref())
                .await?
            else {
                break;
            };
            after = Some(message.id.clone());
            redelivered += 1;
            if self.handle_message(message).await == HandleOutcome::RetryLater {
                settled = false;
            }
        }

        if redelivered > 0 {
            debug!(count = redelivered, settled = settled, "Redelivered pending entries");
        }
        Ok(settled)
    }

    /// Process one delivery and settle it against the queue
    pub async fn handle_message(&self, message: QueueMessage) -> HandleOutcome {
        let started = Instant::now();
        let config = self.config();

        if let Some(max) = config.max_deliveries {
            if message.delivery_count > max {
                let reason = format!("exceeded {max} deliveries");
                return self.dead_letter(&message, &reason).await;
            }
        }

        match self.processor.process(&message).await {
            Ok(outcome) => {
                if let Err(e) = self.ack(&message).await {
                    error!(message_id = %message.id, error = %e, "Failed to acknowledge message");
                    return HandleOutcome::RetryLater;
                }
                if matches!(outcome, ProcessOutcome::Decided { .. }) {
                    self.metrics
                        .observe_processing_latency(started.elapsed().as_secs_f64());
                }
                if let Some(health) = &self.health {
                    health.set_healthy(components::PIPELINE).await;
                    health.set_healthy(components::MODEL_CACHE).await;
                }
                HandleOutcome::Acked
            }
            Err(e) => self.failed(&message, e).await,
        }
    }

    async fn failed(&self, message: &QueueMessage, e: PipelineError) -> HandleOutcome {
        self.metrics.inc_processing_error(e.kind());

        if e.disposition() == Disposition::DeadLetterCandidate
            && self.config().max_deliveries.is_some()
        {
            return self.dead_letter(message, &e.to_string()).await;
        }

        error!(
            message_id = %message.id,
            delivery_count = message.delivery_count,
            kind = e.kind(),
            error = %e,
            "Failed to process ticket, leaving it pending"
        );
        if let Some(health) = &self.health {
            health.set_degraded(components::PIPELINE, e.to_string()).await;
            if let PipelineError::ModelUnavailable { .. } = e {
                health.set_degraded(components::MODEL_CACHE, e.to_string()).await;
            }
        }
        HandleOutcome::RetryLater
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> HandleOutcome {
        let config = self.config();
        let mut fields = message.fields.clone();
        fields.insert("original_message_id".into(), message.id.to_string());
        fields.insert("delivery_count".into(), message.delivery_count.to_string());
        fields.insert("error".into(), reason.to_string());

        if let Err(e) = self.queue.enqueue(&config.dead_letter_topic, fields).await {
            error!(message_id = %message.id, error = %e, "Failed to write dead letter");
            return HandleOutcome::RetryLater;
        }
        if let Err(e) = self.ack(message).await {
            // The copy exists; the original will be dead-lettered again on redelivery
            error!(message_id = %message.id, error = %e, "Failed to acknowledge dead-lettered message");
            return HandleOutcome::RetryLater;
        }

        self.metrics.inc_dead_lettered();
        self.logger.log_dead_letter(
            message.id.as_str(),
            message.fields.get("ticket_id").map(String::as_str),
            message.delivery_count,
            reason,
        );
        HandleOutcome::DeadLettered
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let config = self.config();
        let acked = self
            .queue
            .ack(&config.topic, &config.group, &message.id)
            .await?;
        if !acked {
            // Reclaimed by another consumer after we read it
            warn!(message_id = %message.id, "Message was no longer pending at ack");
        }
        self.maybe_trim().await;
        Ok(())
    }

    /// Trim the stream once enough acknowledgements have accumulated
    async fn maybe_trim(&self) {
        let config = self.config();
        let Some(every) = config.trim_every else {
            return;
        };
        if self.acks_since_trim.fetch_add(1, Ordering::Relaxed) + 1 < every {
            return;
        }
        self.acks_since_trim.store(0, Ordering::Relaxed);

        match self.queue.trim_acknowledged(&config.topic).await {
            Ok(trimmed) => debug!(topic = %config.topic, trimmed = trimmed, "Stream trimmed"),
            Err(e) => warn!(error = %e, "Failed to trim stream"),
        }
    }

    /// Create the consumer group, retrying until it succeeds; false if cancelled first
    async fn join_group(&self, cancel: &CancellationToken) -> bool {
        let config = self.config();
        loop {
            match self.queue.ensure_group(&config.topic, &config.group).await {
                Ok(()) => {
                    if let Some(health) = &self.health {
                        health.set_healthy(components::QUEUE).await;
                    }
                    return true;
                }
                Err(e) => {
                    self.queue_failed(&e).await;
                    if self.backoff(cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn queue_failed(&self, e: &QueueError) {
        error!(error = %e, "Queue operation failed");
        self.metrics.inc_processing_error("queue");
        if let Some(health) = &self.health {
            health.set_degraded(components::QUEUE, e.to_string()).await;
        }
    }

    /// Sleep for the retry backoff; true if cancelled meanwhile
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config().retry_backoff) => false,
        }
    }
}

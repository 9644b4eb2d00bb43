//! Ticket processing pipeline
//!
//! This module provides:
//! - [`TicketProcessor`]: one pass over a dequeued ticket, from model
//!   resolution to the post-decision snapshot
//! - [`PipelineWorker`]: the at-least-once consumer loop around it, with
//!   backoff, pending-entry retries, stream trimming and optional
//!   dead-lettering

mod error;
mod processor;
mod worker;

pub use error::{Disposition, PipelineError};
pub use processor::{ProcessOutcome, TicketProcessor};
pub use worker::{HandleOutcome, PipelineWorker};

use crate::decision::ConfidenceThreshold;
use crate::{PROCESSING_GROUP, TICKET_STREAM, TICKET_UPDATES_CHANNEL};
use std::time::Duration;

/// Default pause after a failed attempt
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default number of acknowledgements between stream trims
pub const DEFAULT_TRIM_EVERY: u32 = 100;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topic: String,
    pub group: String,
    /// This worker's name within the consumer group
    pub consumer: String,
    pub dead_letter_topic: String,
    pub updates_channel: String,
    pub threshold: ConfidenceThreshold,
    pub retry_backoff: Duration,
    /// Dead-letter a message once it has been delivered more often than this
    pub max_deliveries: Option<u32>,
    /// Take over other consumers' entries after they sit idle this long
    pub reclaim_idle_after: Option<Duration>,
    /// Upper bound on a single prediction
    pub prediction_timeout: Option<Duration>,
    /// Trim acknowledged entries from the stream after this many acks
    pub trim_every: Option<u32>,
}

impl PipelineConfig {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            topic: TICKET_STREAM.to_string(),
            group: PROCESSING_GROUP.to_string(),
            consumer: consumer.into(),
            dead_letter_topic: format!("{TICKET_STREAM}.dead"),
            updates_channel: TICKET_UPDATES_CHANNEL.to_string(),
            threshold: ConfidenceThreshold::default(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_deliveries: None,
            reclaim_idle_after: None,
            prediction_timeout: None,
            trim_every: Some(DEFAULT_TRIM_EVERY),
        }
    }
}

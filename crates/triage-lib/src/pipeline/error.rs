use crate::cache::ModelSlot;
use crate::models::PayloadError;
use crate::pubsub::PubSubError;
use crate::queue::QueueError;
use crate::registry::PredictionError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// What the consumer loop should do with a message that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave it pending and try again after backoff
    Retry,
    /// Retrying cannot help; dead-letter it if a delivery bound is set
    DeadLetterCandidate,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),

    #[error("no {slot} model available")]
    ModelUnavailable { slot: ModelSlot },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to publish update: {0}")]
    Publish(#[from] PubSubError),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{slot} prediction failed: {source}")]
    Prediction {
        slot: ModelSlot,
        #[source]
        source: PredictionError,
    },

    #[error("{slot} prediction timed out after {after:?}")]
    PredictionTimeout { slot: ModelSlot, after: Duration },

    #[error("{slot} prediction task failed: {message}")]
    PredictionTask { slot: ModelSlot, message: String },
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::MalformedPayload(_) => Disposition::DeadLetterCandidate,
            _ => Disposition::Retry,
        }
    }

    /// Label for the errors counter
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedPayload(_) => "malformed_payload",
            PipelineError::ModelUnavailable { .. } => "model_unavailable",
            PipelineError::Store(_) => "store",
            PipelineError::Queue(_) => "queue",
            PipelineError::Publish(_) => "publish",
            PipelineError::Encode(_) => "encode",
            PipelineError::Prediction { .. } | PipelineError::PredictionTask { .. } => {
                "prediction"
            }
            PipelineError::PredictionTimeout { .. } => "prediction_timeout",
        }
    }
}

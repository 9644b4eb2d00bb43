//! Ticket triage library
//!
//! This crate provides the core functionality for:
//! - Consumer-group stream queue access
//! - Time-cached champion model loading from a model registry
//! - Confidence-gated HITL decisions
//! - Ticket persistence and human review
//! - Real-time fan-out of ticket updates
//! - Health checks and observability

pub mod cache;
pub mod decision;
pub mod health;
pub mod hub;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod preprocess;
pub mod pubsub;
pub mod queue;
pub mod registry;
pub mod review;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, TriageMetrics};

/// Stream topic carrying ticket submissions
pub const TICKET_STREAM: &str = "ticket_stream";

/// Consumer group shared by all pipeline workers
pub const PROCESSING_GROUP: &str = "ml_processing_group";

/// Pub/sub channel carrying ticket snapshots
pub const TICKET_UPDATES_CHANNEL: &str = "ticket_updates";

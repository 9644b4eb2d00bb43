//! Observability for the triage service
//!
//! Provides:
//! - Prometheus metrics (processing outcomes and latency, model confidence, hub size, model versions)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, GaugeVec, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// End-to-end ticket latency buckets (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

const CONFIDENCE_BUCKETS: &[f64] = &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0];

static GLOBAL_METRICS: OnceLock<TriageMetricsInner> = OnceLock::new();

struct TriageMetricsInner {
    tickets_processed: IntCounterVec,
    processing_latency_seconds: Histogram,
    model_confidence: HistogramVec,
    processing_errors: IntCounterVec,
    tickets_dead_lettered: IntCounter,
    reviews_completed: IntCounter,
    hub_connections: IntGauge,
    model_version_info: GaugeVec,
}

impl TriageMetricsInner {
    fn new() -> Self {
        Self {
            tickets_processed: register_int_counter_vec!(
                "tickets_processed_total",
                "Tickets that reached a post-classification state",
                &["final_status"]
            )
            .expect("Failed to register tickets_processed_total"),

            processing_latency_seconds: register_histogram!(
                "ticket_processing_latency_seconds",
                "Time from dequeue to acknowledgement of a ticket",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register ticket_processing_latency_seconds"),

            model_confidence: register_histogram_vec!(
                "model_confidence_score",
                "Confidence of each model prediction",
                &["model_type"],
                CONFIDENCE_BUCKETS.to_vec()
            )
            .expect("Failed to register model_confidence_score"),

            processing_errors: register_int_counter_vec!(
                "ticket_processing_errors_total",
                "Failed processing attempts by error kind",
                &["kind"]
            )
            .expect("Failed to register ticket_processing_errors_total"),

            tickets_dead_lettered: register_int_counter!(
                "tickets_dead_lettered_total",
                "Messages moved to the dead-letter stream"
            )
            .expect("Failed to register tickets_dead_lettered_total"),

            reviews_completed: register_int_counter!(
                "ticket_reviews_completed_total",
                "Tickets completed by a human reviewer"
            )
            .expect("Failed to register ticket_reviews_completed_total"),

            hub_connections: register_int_gauge!(
                "hub_connections",
                "Live observer connections on the broadcast hub"
            )
            .expect("Failed to register hub_connections"),

            model_version_info: register_gauge_vec!(
                "model_version_info",
                "Currently cached model version per slot",
                &["slot", "version"]
            )
            .expect("Failed to register model_version_info"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same registry entries
#[derive(Clone)]
pub struct TriageMetrics {
    _private: (),
}

impl Default for TriageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TriageMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TriageMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TriageMetricsInner {
        GLOBAL_METRICS.get_or_init(TriageMetricsInner::new)
    }

    pub fn inc_processed(&self, final_status: &str) {
        self.inner()
            .tickets_processed
            .with_label_values(&[final_status])
            .inc();
    }

    pub fn observe_processing_latency(&self, duration_secs: f64) {
        self.inner().processing_latency_seconds.observe(duration_secs);
    }

    pub fn observe_confidence(&self, model_type: &str, confidence: f64) {
        self.inner()
            .model_confidence
            .with_label_values(&[model_type])
            .observe(confidence);
    }

    pub fn inc_processing_error(&self, kind: &str) {
        self.inner()
            .processing_errors
            .with_label_values(&[kind])
            .inc();
    }

    /// Failed attempts recorded so far under `kind`
    pub fn processing_errors(&self, kind: &str) -> u64 {
        self.inner()
            .processing_errors
            .with_label_values(&[kind])
            .get()
    }

    pub fn inc_dead_lettered(&self) {
        self.inner().tickets_dead_lettered.inc();
    }

    pub fn inc_reviews_completed(&self) {
        self.inner().reviews_completed.inc();
    }

    pub fn set_hub_connections(&self, count: usize) {
        self.inner().hub_connections.set(count as i64);
    }

    /// Replace the version series for `slot`
    pub fn set_model_version(&self, slot: &str, previous: Option<&str>, version: &str) {
        let gauge = &self.inner().model_version_info;
        if let Some(previous) = previous.filter(|p| *p != version) {
            // Absent series is fine
            let _ = gauge.remove_label_values(&[slot, previous]);
        }
        gauge.with_label_values(&[slot, version]).set(1.0);
    }
}

/// Structured logger for lifecycle events of one worker
#[derive(Clone)]
pub struct StructuredLogger {
    consumer: String,
}

impl StructuredLogger {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn log_ticket_received(&self, ticket_id: &Uuid, message_id: &str, delivery_count: u32) {
        info!(
            event = "ticket_received",
            consumer = %self.consumer,
            ticket_id = %ticket_id,
            message_id = %message_id,
            delivery_count = delivery_count,
            "Received ticket from stream"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_decision(
        &self,
        ticket_id: &Uuid,
        category: &str,
        category_confidence: f64,
        priority: &str,
        priority_confidence: f64,
        average_confidence: f64,
        threshold: f64,
        status: &str,
    ) {
        info!(
            event = "ticket_decided",
            consumer = %self.consumer,
            ticket_id = %ticket_id,
            category = %category,
            category_confidence = category_confidence,
            priority = %priority,
            priority_confidence = priority_confidence,
            average_confidence = average_confidence,
            threshold = threshold,
            status = %status,
            "Ticket classified"
        );
    }

    pub fn log_model_refresh(
        &self,
        slot: &str,
        model_name: &str,
        old_version: Option<&str>,
        new_version: Option<&str>,
        success: bool,
    ) {
        if success {
            info!(
                event = "model_refreshed",
                consumer = %self.consumer,
                slot = %slot,
                model_name = %model_name,
                old_version = ?old_version,
                new_version = ?new_version,
                "Champion model refreshed"
            );
        } else {
            warn!(
                event = "model_refresh_failed",
                consumer = %self.consumer,
                slot = %slot,
                model_name = %model_name,
                cached_version = ?old_version,
                "Model refresh failed, keeping cached entry"
            );
        }
    }

    pub fn log_review(&self, ticket_id: &Uuid, final_category: &str, final_priority: &str) {
        info!(
            event = "ticket_reviewed",
            ticket_id = %ticket_id,
            final_category = %final_category,
            final_priority = %final_priority,
            "Ticket completed by reviewer"
        );
    }

    pub fn log_dead_letter(
        &self,
        message_id: &str,
        ticket_id: Option<&str>,
        delivery_count: u32,
        reason: &str,
    ) {
        error!(
            event = "ticket_dead_lettered",
            consumer = %self.consumer,
            message_id = %message_id,
            ticket_id = ?ticket_id,
            delivery_count = delivery_count,
            reason = %reason,
            "Message moved to dead-letter stream"
        );
    }

    pub fn log_startup(&self, version: &str, threshold: f64, cache_ttl_secs: u64) {
        info!(
            event = "worker_started",
            consumer = %self.consumer,
            worker_version = %version,
            confidence_threshold = threshold,
            cache_ttl_secs = cache_ttl_secs,
            "Triage worker started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "worker_shutdown",
            consumer = %self.consumer,
            reason = %reason,
            "Triage worker shutting down"
        );
    }
}

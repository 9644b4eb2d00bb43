//! Core data models for ticket triage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Inserted by the pipeline, classification not yet decided
    Processing,
    /// Confidence fell below the threshold, waiting for a reviewer
    PendingReview,
    /// Final labels are set, either automatically or by a reviewer
    Completed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Processing => "PROCESSING",
            TicketStatus::PendingReview => "PENDING_REVIEW",
            TicketStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown ticket status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TicketStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(TicketStatus::Processing),
            "PENDING_REVIEW" => Ok(TicketStatus::PendingReview),
            "COMPLETED" => Ok(TicketStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted ticket row.
///
/// This is also the snapshot published on the updates channel: timestamps
/// serialize as RFC 3339 and the ticket id as a hyphenated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: Uuid,
    pub subject: String,
    pub description: String,
    pub status: TicketStatus,
    pub predicted_category: Option<String>,
    pub predicted_priority: Option<String>,
    pub prediction_confidence_category: Option<f64>,
    pub prediction_confidence_priority: Option<f64>,
    pub category_model_id: Option<i64>,
    pub priority_model_id: Option<i64>,
    pub final_category: Option<String>,
    pub final_priority: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub used_for_retraining: bool,
}

impl Ticket {
    /// Serialize the full row for the updates channel
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Fields the pipeline writes when it first sees a ticket
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub ticket_id: Uuid,
    pub subject: String,
    pub description: String,
    pub category_model_id: i64,
    pub priority_model_id: i64,
}

/// Reviewer-supplied final labels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInput {
    pub final_category: String,
    pub final_priority: String,
}

/// A model version seen by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: i64,
    pub model_name: String,
    pub model_version: String,
    pub deployed_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Why a queue payload could not be turned into a submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid ticket_id `{0}`")]
    InvalidTicketId(String),
}

/// A ticket submission as carried on the stream.
///
/// On the wire this is a flat field map with `ticket_id`, `subject` and
/// `description`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSubmission {
    pub ticket_id: Uuid,
    pub subject: String,
    pub description: String,
}

impl TicketSubmission {
    pub fn new(subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            ticket_id: Uuid::new_v4(),
            subject: subject.into(),
            description: description.into(),
        }
    }

    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("ticket_id".to_string(), self.ticket_id.to_string());
        fields.insert("subject".to_string(), self.subject.clone());
        fields.insert("description".to_string(), self.description.clone());
        fields
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, PayloadError> {
        let raw_id = fields
            .get("ticket_id")
            .ok_or(PayloadError::MissingField("ticket_id"))?;
        let ticket_id =
            Uuid::parse_str(raw_id).map_err(|_| PayloadError::InvalidTicketId(raw_id.clone()))?;
        let subject = fields
            .get("subject")
            .ok_or(PayloadError::MissingField("subject"))?;
        let description = fields
            .get("description")
            .ok_or(PayloadError::MissingField("description"))?;

        Ok(Self {
            ticket_id,
            subject: subject.clone(),
            description: description.clone(),
        })
    }
}

/// Ticket counts per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub completed: u64,
    pub pending_review: u64,
    pub processing: u64,
}

impl StatusBreakdown {
    pub fn record(&mut self, status: TicketStatus) {
        match status {
            TicketStatus::Completed => self.completed += 1,
            TicketStatus::PendingReview => self.pending_review += 1,
            TicketStatus::Processing => self.processing += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.pending_review + self.processing
    }
}

/// Aggregate dashboard statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketStats {
    pub status_breakdown: StatusBreakdown,
    /// Counts by final category, or by predicted category while undecided
    pub category_breakdown: HashMap<String, u64>,
    pub total: u64,
}

impl TicketStats {
    pub fn from_tickets<'a>(tickets: impl IntoIterator<Item = &'a Ticket>) -> Self {
        let mut stats = TicketStats::default();
        for ticket in tickets {
            stats.status_breakdown.record(ticket.status);
            if let Some(category) = ticket
                .final_category
                .as_ref()
                .or(ticket.predicted_category.as_ref())
            {
                *stats.category_breakdown.entry(category.clone()).or_insert(0) += 1;
            }
        }
        stats.total = stats.status_breakdown.total();
        stats
    }
}

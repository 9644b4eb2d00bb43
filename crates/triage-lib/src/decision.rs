//! Confidence-gated routing between auto-completion and human review

use crate::models::TicketStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("confidence threshold must be within [0, 1], got {0}")]
pub struct InvalidThreshold(pub f64);

/// Minimum average confidence for a ticket to complete without review
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ConfidenceThreshold(f64);

impl ConfidenceThreshold {
    pub fn new(value: f64) -> Result<Self, InvalidThreshold> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidThreshold(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for ConfidenceThreshold {
    fn default() -> Self {
        Self(0.70)
    }
}

impl TryFrom<f64> for ConfidenceThreshold {
    type Error = InvalidThreshold;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConfidenceThreshold> for f64 {
    fn from(threshold: ConfidenceThreshold) -> Self {
        threshold.0
    }
}

/// Where a classified ticket goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Predictions become the final labels
    AutoComplete,
    /// A reviewer must confirm or correct the predictions
    HumanReview,
}

impl Decision {
    pub fn status(&self) -> TicketStatus {
        match self {
            Decision::AutoComplete => TicketStatus::Completed,
            Decision::HumanReview => TicketStatus::PendingReview,
        }
    }

    /// Label used for the decisions counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            Decision::AutoComplete => "completed_auto",
            Decision::HumanReview => "pending_review",
        }
    }
}

pub fn average_confidence(category_confidence: f64, priority_confidence: f64) -> f64 {
    (category_confidence + priority_confidence) / 2.0
}

/// An average exactly at the threshold auto-completes
pub fn decide(average: f64, threshold: ConfidenceThreshold) -> Decision {
    if average >= threshold.value() {
        Decision::AutoComplete
    } else {
        Decision::HumanReview
    }
}

/// Everything the store needs to record a classification outcome
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionUpdate {
    pub predicted_category: String,
    pub predicted_priority: String,
    pub category_confidence: f64,
    pub priority_confidence: f64,
    pub decision: Decision,
}

impl DecisionUpdate {
    pub fn status(&self) -> TicketStatus {
        self.decision.status()
    }

    /// Final labels written alongside an auto-completion
    pub fn final_labels(&self) -> Option<(&str, &str)> {
        match self.decision {
            Decision::AutoComplete => {
                Some((self.predicted_category.as_str(), self.predicted_priority.as_str()))
            }
            Decision::HumanReview => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(v: f64) -> ConfidenceThreshold {
        ConfidenceThreshold::new(v).unwrap()
    }

    #[test]
    fn test_high_confidence_auto_completes() {
        let avg = average_confidence(0.95, 0.88);
        assert_eq!(decide(avg, threshold(0.85)), Decision::AutoComplete);
    }

    #[test]
    fn test_low_confidence_goes_to_review() {
        let avg = average_confidence(0.60, 0.90);
        assert!((avg - 0.75).abs() < 1e-9);
        assert_eq!(decide(avg, threshold(0.85)), Decision::HumanReview);
    }

    #[test]
    fn test_average_at_threshold_auto_completes() {
        // Both values are exact in binary so the average is exactly 0.75
        let avg = average_confidence(0.5, 1.0);
        assert_eq!(decide(avg, threshold(0.75)), Decision::AutoComplete);
        assert_eq!(decide(0.749_999, threshold(0.75)), Decision::HumanReview);
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(ConfidenceThreshold::new(0.0).is_ok());
        assert!(ConfidenceThreshold::new(1.0).is_ok());
        assert!(ConfidenceThreshold::new(1.01).is_err());
        assert!(ConfidenceThreshold::new(-0.1).is_err());
        assert!(ConfidenceThreshold::new(f64::NAN).is_err());
    }

    #[test]
    fn test_threshold_extremes() {
        assert_eq!(decide(0.0, threshold(0.0)), Decision::AutoComplete);
        assert_eq!(decide(0.999, threshold(1.0)), Decision::HumanReview);
    }

    #[test]
    fn test_final_labels_only_on_auto_complete() {
        let mut update = DecisionUpdate {
            predicted_category: "Network".into(),
            predicted_priority: "High".into(),
            category_confidence: 0.95,
            priority_confidence: 0.88,
            decision: Decision::AutoComplete,
        };
        assert_eq!(update.final_labels(), Some(("Network", "High")));
        assert_eq!(update.status(), TicketStatus::Completed);

        update.decision = Decision::HumanReview;
        assert_eq!(update.final_labels(), None);
        assert_eq!(update.status(), TicketStatus::PendingReview);
    }

    #[test]
    fn test_threshold_deserialize_validates() {
        let ok: ConfidenceThreshold = serde_json::from_str("0.9").unwrap();
        assert_eq!(ok.value(), 0.9);
        assert!(serde_json::from_str::<ConfidenceThreshold>("1.5").is_err());
    }
}

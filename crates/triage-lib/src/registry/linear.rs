//! Bag-of-words linear classifier artifact
//!
//! Stored as JSON:
//!
//! ```json
//! {
//!   "classes": ["Billing", "Network"],
//!   "vocabulary": {"invoice": 0, "vpn": 1},
//!   "coefficients": [[1.2, -0.4], [-0.8, 2.1]],
//!   "intercepts": [0.0, 0.1]
//! }
//! ```

use super::{ClassProbability, Classifier, PredictionError, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearTextModel {
    classes: Vec<String>,
    vocabulary: HashMap<String, usize>,
    /// One row per class, one column per vocabulary index
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

impl LinearTextModel {
    pub fn new(
        classes: Vec<String>,
        vocabulary: HashMap<String, usize>,
        coefficients: Vec<Vec<f64>>,
        intercepts: Vec<f64>,
    ) -> Result<Self, RegistryError> {
        let model = Self {
            classes,
            vocabulary,
            coefficients,
            intercepts,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, RegistryError> {
        let model: Self = serde_json::from_slice(bytes)
            .map_err(|e| RegistryError::InvalidArtifact(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.classes.is_empty() {
            return Err(RegistryError::InvalidArtifact("no classes".into()));
        }
        if self.coefficients.len() != self.classes.len() || self.intercepts.len() != self.classes.len() {
            return Err(RegistryError::InvalidArtifact(format!(
                "expected {} coefficient rows and intercepts, got {} and {}",
                self.classes.len(),
                self.coefficients.len(),
                self.intercepts.len()
            )));
        }

        let features = self.vocabulary.values().max().map_or(0, |max| max + 1);
        if let Some(row) = self.coefficients.iter().find(|row| row.len() < features) {
            return Err(RegistryError::InvalidArtifact(format!(
                "coefficient row has {} columns, vocabulary needs {}",
                row.len(),
                features
            )));
        }
        Ok(())
    }

    fn logits(&self, text: &str) -> Vec<f64> {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in text.split_whitespace() {
            if let Some(&index) = self.vocabulary.get(token) {
                *counts.entry(index).or_insert(0.0) += 1.0;
            }
        }

        self.coefficients
            .iter()
            .zip(&self.intercepts)
            .map(|(row, intercept)| {
                counts
                    .iter()
                    .fold(*intercept, |acc, (index, count)| acc + row[*index] * count)
            })
            .collect()
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

impl Classifier for LinearTextModel {
    fn predict(&self, text: &str) -> Result<String, PredictionError> {
        let logits = self.logits(text);
        let best = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .ok_or_else(|| PredictionError("model has no classes".into()))?;
        Ok(self.classes[best].clone())
    }

    fn predict_proba(&self, text: &str) -> Result<Vec<ClassProbability>, PredictionError> {
        let probabilities = softmax(&self.logits(text));
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(PredictionError("non-finite class probability".into()));
        }

        Ok(self
            .classes
            .iter()
            .zip(probabilities)
            .map(|(label, probability)| ClassProbability {
                label: label.clone(),
                probability,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_model() -> LinearTextModel {
        let vocabulary = HashMap::from([
            ("invoice".to_string(), 0),
            ("vpn".to_string(), 1),
            ("connect".to_string(), 2),
        ]);
        LinearTextModel::new(
            vec!["Billing".into(), "Network".into()],
            vocabulary,
            vec![vec![2.0, -1.0, 0.0], vec![-1.0, 2.0, 1.0]],
            vec![0.0, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn test_predicts_highest_scoring_class() {
        let model = network_model();
        assert_eq!(model.predict("cannot connect vpn").unwrap(), "Network");
        assert_eq!(model.predict("invoice wrong").unwrap(), "Billing");
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let model = network_model();
        let proba = model.predict_proba("vpn vpn invoice").unwrap();
        let total: f64 = proba.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_tokens_fall_back_to_intercepts() {
        let model = network_model();
        let proba = model.predict_proba("printer jammed").unwrap();
        assert!((proba[0].probability - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_matches_max_probability() {
        let model = network_model();
        let prediction = model.predict_confidence("vpn connect").unwrap();
        let max = model
            .predict_proba("vpn connect")
            .unwrap()
            .into_iter()
            .map(|p| p.probability)
            .fold(0.0, f64::max);
        assert_eq!(prediction.label, "Network");
        assert_eq!(prediction.confidence, max);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let err = LinearTextModel::new(
            vec!["A".into(), "B".into()],
            HashMap::from([("x".to_string(), 3)]),
            vec![vec![0.0; 4]],
            vec![0.0, 0.0],
        );
        assert!(matches!(err, Err(RegistryError::InvalidArtifact(_))));

        let err = LinearTextModel::from_json(br#"{"classes":["A"],"vocabulary":{"x":5},"coefficients":[[1.0]],"intercepts":[0.0]}"#);
        assert!(matches!(err, Err(RegistryError::InvalidArtifact(_))));
    }

    #[test]
    fn test_from_json() {
        let model = LinearTextModel::from_json(
            br#"{"classes":["Low","High"],"vocabulary":{"urgent":0},"coefficients":[[-1.0],[1.5]],"intercepts":[0.2,0.0]}"#,
        )
        .unwrap();
        assert_eq!(model.classes(), ["Low", "High"]);
        assert_eq!(model.predict("urgent outage").unwrap(), "High");
    }
}

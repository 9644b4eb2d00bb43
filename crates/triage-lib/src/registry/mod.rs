//! Model registry access and classifier handles
//!
//! The pipeline asks the registry for the version currently aliased
//! `champion` for a model name, then loads the artifact behind it into a
//! [`Classifier`] handle.

mod linear;
mod mlflow;
mod static_registry;

pub use linear::LinearTextModel;
pub use mlflow::MlflowRegistryClient;
pub use static_registry::{FixedClassifier, StaticModelRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Registry alias that marks the production version of a model
pub const CHAMPION_ALIAS: &str = "champion";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model `{name}` has no version aliased `{alias}`")]
    AliasNotFound { name: String, alias: String },

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid registry url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to read model artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("unsupported artifact uri: {0}")]
    UnsupportedUri(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("prediction failed: {0}")]
pub struct PredictionError(pub String);

/// A registry version resolved from an alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredVersion {
    pub name: String,
    pub version: String,
    pub source_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    pub label: String,
    pub probability: f64,
}

/// A label together with its posterior probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

/// A loaded text classification model
pub trait Classifier: Send + Sync {
    fn predict(&self, text: &str) -> Result<String, PredictionError>;

    /// Posterior probability for every class the model knows
    fn predict_proba(&self, text: &str) -> Result<Vec<ClassProbability>, PredictionError>;

    /// Predicted label with the maximum class posterior as its confidence
    fn predict_confidence(&self, text: &str) -> Result<Prediction, PredictionError> {
        let label = self.predict(text)?;
        let confidence = self
            .predict_proba(text)?
            .into_iter()
            .map(|p| p.probability)
            .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
            .ok_or_else(|| PredictionError("model returned no class probabilities".into()))?;

        Ok(Prediction { label, confidence })
    }
}

/// The champion model for a name, loaded and ready to predict
#[derive(Clone)]
pub struct ActiveModel {
    pub handle: Arc<dyn Classifier>,
    pub version: String,
    pub source_uri: String,
}

impl fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModel")
            .field("version", &self.version)
            .field("source_uri", &self.source_uri)
            .finish_non_exhaustive()
    }
}

/// Client for a model registry
#[async_trait]
pub trait ModelRegistryClient: Send + Sync {
    async fn get_model_version_by_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> Result<RegisteredVersion, RegistryError>;

    /// Load the artifact at `source_uri` into a classifier
    async fn load(&self, source_uri: &str) -> Result<Arc<dyn Classifier>, RegistryError>;

    /// Resolve the champion alias and load its artifact
    async fn get_active_model(&self, name: &str) -> Result<ActiveModel, RegistryError> {
        let registered = self.get_model_version_by_alias(name, CHAMPION_ALIAS).await?;
        let handle = self.load(&registered.source_uri).await?;

        Ok(ActiveModel {
            handle,
            version: registered.version,
            source_uri: registered.source_uri,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TwoClass;

    impl Classifier for TwoClass {
        fn predict(&self, _text: &str) -> Result<String, PredictionError> {
            Ok("Network".into())
        }

        fn predict_proba(&self, _text: &str) -> Result<Vec<ClassProbability>, PredictionError> {
            Ok(vec![
                ClassProbability { label: "Network".into(), probability: 0.7 },
                ClassProbability { label: "Billing".into(), probability: 0.3 },
            ])
        }
    }

    struct Empty;

    impl Classifier for Empty {
        fn predict(&self, _text: &str) -> Result<String, PredictionError> {
            Ok("x".into())
        }

        fn predict_proba(&self, _text: &str) -> Result<Vec<ClassProbability>, PredictionError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_confidence_is_max_posterior() {
        let prediction = TwoClass.predict_confidence("vpn down").unwrap();
        assert_eq!(prediction.label, "Network");
        assert_eq!(prediction.confidence, 0.7);
    }

    #[test]
    fn test_confidence_requires_probabilities() {
        assert!(Empty.predict_confidence("anything").is_err());
    }
}

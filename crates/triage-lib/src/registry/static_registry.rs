//! In-memory registry for local runs and tests

use super::{
    ClassProbability, Classifier, ModelRegistryClient, Prediction, PredictionError,
    RegisteredVersion, RegistryError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

struct StaticEntry {
    version: String,
    source_uri: String,
    handle: Arc<dyn Classifier>,
}

/// Registry whose champions are set programmatically.
///
/// Every alias lookup and load is counted, and the whole registry can be
/// switched into a failing mode to simulate an outage.
#[derive(Default)]
pub struct StaticModelRegistry {
    champions: RwLock<HashMap<String, StaticEntry>>,
    lookups: AtomicUsize,
    loads: AtomicUsize,
    failing: AtomicBool,
}

impl StaticModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the champion alias of `name` at a new version
    pub fn set_champion(&self, name: &str, version: &str, handle: Arc<dyn Classifier>) {
        let entry = StaticEntry {
            version: version.to_string(),
            source_uri: format!("static://{name}/{version}"),
            handle,
        };
        if let Ok(mut champions) = self.champions.write() {
            champions.insert(name.to_string(), entry);
        }
    }

    pub fn remove_champion(&self, name: &str) {
        if let Ok(mut champions) = self.champions.write() {
            champions.remove(name);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry is failing".into()));
        }
        Ok(())
    }

    fn poisoned() -> RegistryError {
        RegistryError::Unavailable("registry lock poisoned".into())
    }
}

#[async_trait]
impl ModelRegistryClient for StaticModelRegistry {
    async fn get_model_version_by_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> Result<RegisteredVersion, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let champions = self.champions.read().map_err(|_| Self::poisoned())?;
        let entry = champions
            .get(name)
            .ok_or_else(|| RegistryError::AliasNotFound {
                name: name.to_string(),
                alias: alias.to_string(),
            })?;

        Ok(RegisteredVersion {
            name: name.to_string(),
            version: entry.version.clone(),
            source_uri: entry.source_uri.clone(),
        })
    }

    async fn load(&self, source_uri: &str) -> Result<Arc<dyn Classifier>, RegistryError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let champions = self.champions.read().map_err(|_| Self::poisoned())?;
        champions
            .values()
            .find(|entry| entry.source_uri == source_uri)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| RegistryError::UnsupportedUri(source_uri.to_string()))
    }
}

/// Classifier that answers every text with the same label and confidence
#[derive(Debug, Clone)]
pub struct FixedClassifier {
    label: String,
    confidence: f64,
}

impl FixedClassifier {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    pub fn shared(label: impl Into<String>, confidence: f64) -> Arc<dyn Classifier> {
        Arc::new(Self::new(label, confidence))
    }
}

impl Classifier for FixedClassifier {
    fn predict(&self, _text: &str) -> Result<String, PredictionError> {
        Ok(self.label.clone())
    }

    fn predict_proba(&self, _text: &str) -> Result<Vec<ClassProbability>, PredictionError> {
        Ok(vec![
            ClassProbability {
                label: self.label.clone(),
                probability: self.confidence,
            },
            ClassProbability {
                label: "Other".to_string(),
                probability: 1.0 - self.confidence,
            },
        ])
    }

    fn predict_confidence(&self, _text: &str) -> Result<Prediction, PredictionError> {
        Ok(Prediction {
            label: self.label.clone(),
            confidence: self.confidence,
        })
    }
}

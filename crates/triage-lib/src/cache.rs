//! Time-expiring cache of champion models
//!
//! The cache owns one entry per [`ModelSlot`]. An entry is refreshed from the
//! registry lazily, on the first resolve after its TTL has passed. Each slot
//! has its own lock held for the whole refresh, so concurrent resolvers of
//! the same slot wait for one registry round trip instead of issuing their own.

use crate::observability::{StructuredLogger, TriageMetrics};
use crate::registry::{Classifier, ModelRegistryClient};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSlot {
    Category,
    Priority,
}

impl ModelSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSlot::Category => "category",
            ModelSlot::Priority => "priority",
        }
    }
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Registry name of the category model
    pub category_model: String,
    /// Registry name of the priority model
    pub priority_model: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            category_model: "category_classifier".to_string(),
            priority_model: "priority_classifier".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn model_name(&self, slot: ModelSlot) -> &str {
        match slot {
            ModelSlot::Category => &self.category_model,
            ModelSlot::Priority => &self.priority_model,
        }
    }
}

#[derive(Default)]
struct CacheEntry {
    handle: Option<Arc<dyn Classifier>>,
    version: Option<String>,
    last_refreshed_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.handle.is_some()
            && self
                .last_refreshed_at
                .is_some_and(|refreshed| refreshed.elapsed() <= ttl)
    }
}

/// What a slot currently resolves to; either field may be empty if no
/// refresh has ever succeeded
#[derive(Clone)]
pub struct ResolvedModel {
    pub slot: ModelSlot,
    pub model_name: String,
    pub handle: Option<Arc<dyn Classifier>>,
    pub version: Option<String>,
}

impl fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("slot", &self.slot)
            .field("model_name", &self.model_name)
            .field("loaded", &self.handle.is_some())
            .field("version", &self.version)
            .finish()
    }
}

impl ResolvedModel {
    /// Handle and version, if both are present
    pub fn ready(&self) -> Option<(Arc<dyn Classifier>, &str)> {
        match (&self.handle, &self.version) {
            (Some(handle), Some(version)) => Some((Arc::clone(handle), version.as_str())),
            _ => None,
        }
    }
}

pub struct ModelCache {
    registry: Arc<dyn ModelRegistryClient>,
    config: CacheConfig,
    category: Mutex<CacheEntry>,
    priority: Mutex<CacheEntry>,
    metrics: TriageMetrics,
    logger: StructuredLogger,
}

impl ModelCache {
    pub fn new(
        registry: Arc<dyn ModelRegistryClient>,
        config: CacheConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            registry,
            config,
            category: Mutex::new(CacheEntry::default()),
            priority: Mutex::new(CacheEntry::default()),
            metrics: TriageMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entry(&self, slot: ModelSlot) -> &Mutex<CacheEntry> {
        match slot {
            ModelSlot::Category => &self.category,
            ModelSlot::Priority => &self.priority,
        }
    }

    /// Return the slot's model, refreshing it first if stale or empty.
    ///
    /// A failed refresh leaves the entry untouched, so a stale handle keeps
    /// being served until the registry recovers.
    pub async fn resolve(&self, slot: ModelSlot) -> ResolvedModel {
        let model_name = self.config.model_name(slot);
        let mut entry = self.entry(slot).lock().await;

        if entry.is_fresh(self.config.ttl) {
            debug!(slot = %slot, version = ?entry.version, "Model cache hit");
        } else {
            match self.registry.get_active_model(model_name).await {
                Ok(active) => {
                    let previous = entry.version.take();
                    self.metrics
                        .set_model_version(slot.as_str(), previous.as_deref(), &active.version);
                    self.logger.log_model_refresh(
                        slot.as_str(),
                        model_name,
                        previous.as_deref(),
                        Some(&active.version),
                        true,
                    );

                    *entry = CacheEntry {
                        handle: Some(active.handle),
                        version: Some(active.version),
                        last_refreshed_at: Some(Instant::now()),
                    };
                }
                Err(e) => {
                    self.logger.log_model_refresh(
                        slot.as_str(),
                        model_name,
                        entry.version.as_deref(),
                        None,
                        false,
                    );
                    debug!(slot = %slot, error = %e, "Registry error during refresh");
                }
            }
        }

        ResolvedModel {
            slot,
            model_name: model_name.to_string(),
            handle: entry.handle.clone(),
            version: entry.version.clone(),
        }
    }

    /// Currently cached version of a slot without triggering a refresh
    pub async fn cached_version(&self, slot: ModelSlot) -> Option<String> {
        self.entry(slot).lock().await.version.clone()
    }
}

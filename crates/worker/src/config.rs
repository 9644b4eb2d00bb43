//! Worker configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use triage_lib::cache::CacheConfig;
use triage_lib::decision::ConfidenceThreshold;
use triage_lib::hub::HubConfig;
use triage_lib::pipeline::PipelineConfig;

/// Where tickets and the stream live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

/// Worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    /// Postgres connection string, required for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    /// Port for the HTTP API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_mlflow_tracking_uri")]
    pub mlflow_tracking_uri: String,

    #[serde(default = "default_category_model_name")]
    pub category_model_name: String,

    #[serde(default = "default_priority_model_name")]
    pub priority_model_name: String,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Dead-letter messages delivered more often than this; unbounded if unset
    #[serde(default)]
    pub max_deliveries: Option<u32>,

    /// Reclaim entries other consumers left idle this long
    #[serde(default)]
    pub reclaim_idle_secs: Option<u64>,

    #[serde(default)]
    pub prediction_timeout_secs: Option<u64>,

    /// Trim acknowledged stream entries after this many acks; 0 disables trimming
    #[serde(default = "default_stream_trim_every")]
    pub stream_trim_every: u32,

    /// Name of this worker within the consumer group
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    #[serde(default = "default_hub_poll_interval")]
    pub hub_poll_interval_ms: u64,

    #[serde(default = "default_hub_connection_buffer")]
    pub hub_connection_buffer: usize,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_api_port() -> u16 {
    8000
}

fn default_confidence_threshold() -> f64 {
    0.70
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_mlflow_tracking_uri() -> String {
    "http://mlflow:5000".to_string()
}

fn default_category_model_name() -> String {
    "category_classifier".to_string()
}

fn default_priority_model_name() -> String {
    "priority_classifier".to_string()
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_stream_trim_every() -> u32 {
    100
}

fn default_consumer_name() -> String {
    format!("worker_{}", std::process::id())
}

fn default_hub_poll_interval() -> u64 {
    1000
}

fn default_hub_connection_buffer() -> usize {
    64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            storage_backend: default_storage_backend(),
            database_url: None,
            api_port: default_api_port(),
            confidence_threshold: default_confidence_threshold(),
            cache_ttl_secs: default_cache_ttl(),
            mlflow_tracking_uri: default_mlflow_tracking_uri(),
            category_model_name: default_category_model_name(),
            priority_model_name: default_priority_model_name(),
            retry_backoff_secs: default_retry_backoff(),
            max_deliveries: None,
            reclaim_idle_secs: None,
            prediction_timeout_secs: None,
            stream_trim_every: default_stream_trim_every(),
            consumer_name: default_consumer_name(),
            hub_poll_interval_ms: default_hub_poll_interval(),
            hub_connection_buffer: default_hub_connection_buffer(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from an optional `triage.toml` and `TRIAGE_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("triage").required(false))
            .add_source(config::Environment::with_prefix("TRIAGE"))
            .build()
            .context("failed to read configuration")?;

        let config: WorkerConfig = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ConfidenceThreshold::new(self.confidence_threshold)?;
        if self.cache_ttl_secs == 0 {
            bail!("cache_ttl_secs must be greater than 0");
        }
        if self.hub_connection_buffer == 0 {
            bail!("hub_connection_buffer must be greater than 0");
        }
        if self.max_deliveries == Some(0) {
            bail!("max_deliveries must be at least 1 when set");
        }
        if self.storage_backend == StorageBackend::Postgres && self.database_url.is_none() {
            bail!("database_url is required for the postgres storage backend");
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig {
            threshold: ConfidenceThreshold::new(self.confidence_threshold)?,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            max_deliveries: self.max_deliveries,
            reclaim_idle_after: self.reclaim_idle_secs.map(Duration::from_secs),
            prediction_timeout: self.prediction_timeout_secs.map(Duration::from_secs),
            trim_every: (self.stream_trim_every > 0).then_some(self.stream_trim_every),
            ..PipelineConfig::new(self.consumer_name.clone())
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            category_model: self.category_model_name.clone(),
            priority_model: self.priority_model_name.clone(),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            poll_interval: Duration::from_millis(self.hub_poll_interval_ms),
            connection_buffer: self.hub_connection_buffer,
            ..HubConfig::default()
        }
    }
}

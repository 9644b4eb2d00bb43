//! Component wiring for one worker process

use crate::api::{self, AppState};
use crate::config::{StorageBackend, WorkerConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use triage_lib::{
    cache::ModelCache,
    health::{components, HealthRegistry},
    hub::BroadcastHub,
    ingest::TicketIngestor,
    pipeline::{PipelineWorker, TicketProcessor},
    preprocess::RegexNormalizer,
    pubsub::{InMemoryPubSub, Notifier},
    queue::{InMemoryStreamQueue, StreamQueue},
    registry::{MlflowRegistryClient, ModelRegistryClient},
    review::ReviewService,
    store::{InMemoryTicketStore, TicketStore},
    StructuredLogger, TriageMetrics,
};

/// Storage the pipeline and API share
pub struct Storage {
    pub store: Arc<dyn TicketStore>,
    pub queue: Arc<dyn StreamQueue>,
    /// Carries ticket updates to every worker's broadcast hub
    pub notifier: Arc<dyn Notifier>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryTicketStore::new()),
            queue: Arc::new(InMemoryStreamQueue::new()),
            notifier: Arc::new(InMemoryPubSub::default()),
        }
    }

    pub async fn open(config: &WorkerConfig) -> Result<Self> {
        match config.storage_backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::Postgres => Self::open_postgres(config).await,
        }
    }

    #[cfg(feature = "postgres")]
    async fn open_postgres(config: &WorkerConfig) -> Result<Self> {
        use triage_lib::pubsub::PgNotifier;
        use triage_lib::queue::PgStreamQueue;
        use triage_lib::store::PgTicketStore;

        let url = config
            .database_url
            .as_deref()
            .context("database_url is required for the postgres storage backend")?;
        let pool = PgTicketStore::connect(url)
            .await
            .context("failed to connect to Postgres")?;
        PgTicketStore::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self {
            store: Arc::new(PgTicketStore::new(pool.clone())),
            queue: Arc::new(PgStreamQueue::new(pool.clone())),
            notifier: Arc::new(PgNotifier::new(pool)),
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn open_postgres(_config: &WorkerConfig) -> Result<Self> {
        anyhow::bail!("storage_backend = postgres requires building with the `postgres` feature")
    }
}

/// Everything one worker process runs
pub struct App {
    pub state: Arc<AppState>,
    pub pipeline: PipelineWorker,
    pub notifier: Arc<dyn Notifier>,
    pub api_port: u16,
    updates_channel: String,
    logger: StructuredLogger,
}

impl App {
    pub async fn build(config: &WorkerConfig) -> Result<Self> {
        let registry: Arc<dyn ModelRegistryClient> = Arc::new(
            MlflowRegistryClient::new(&config.mlflow_tracking_uri)
                .context("invalid mlflow_tracking_uri")?,
        );
        let storage = Storage::open(config).await?;
        Self::assemble(config, storage, registry)
    }

    /// Wire the components on top of already-opened storage and registry
    pub fn assemble(
        config: &WorkerConfig,
        storage: Storage,
        registry: Arc<dyn ModelRegistryClient>,
    ) -> Result<Self> {
        let logger = StructuredLogger::new(&config.consumer_name);
        let health_registry = HealthRegistry::new();
        let notifier = Arc::clone(&storage.notifier);
        let pipeline_config = config.pipeline_config()?;
        let updates_channel = pipeline_config.updates_channel.clone();

        let hub = Arc::new(
            BroadcastHub::new(config.hub_config()).with_health(health_registry.clone()),
        );
        let cache = Arc::new(ModelCache::new(registry, config.cache_config(), logger.clone()));
        let normalizer = Arc::new(RegexNormalizer::new().context("failed to build normalizer")?);

        let ingestor = TicketIngestor::new(Arc::clone(&storage.queue), pipeline_config.topic.clone());
        let reviews = ReviewService::new(
            Arc::clone(&storage.store),
            Arc::clone(&notifier),
            updates_channel.clone(),
            logger.clone(),
        );
        let processor = TicketProcessor::new(
            cache,
            Arc::clone(&storage.store),
            Arc::clone(&notifier),
            normalizer,
            pipeline_config,
            logger.clone(),
        );
        let pipeline = PipelineWorker::new(Arc::clone(&storage.queue), processor, logger.clone())
            .with_health(health_registry.clone());

        let state = Arc::new(AppState {
            health_registry,
            metrics: TriageMetrics::new(),
            store: storage.store,
            ingestor,
            reviews,
            hub,
        });

        Ok(Self {
            state,
            pipeline,
            notifier,
            api_port: config.api_port,
            updates_channel,
            logger,
        })
    }

    /// Run the hub listener, the pipeline and the API until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let health = &self.state.health_registry;
        for component in [
            components::PIPELINE,
            components::MODEL_CACHE,
            components::QUEUE,
            components::BROADCAST_HUB,
        ] {
            health.register(component).await;
        }

        let listener = tokio::spawn(Arc::clone(&self.state.hub).run_listener(
            Arc::clone(&self.notifier),
            self.updates_channel.clone(),
            cancel.clone(),
        ));

        let pipeline = self.pipeline;
        let pipeline_cancel = cancel.clone();
        let pipeline_handle = tokio::spawn(async move { pipeline.run(pipeline_cancel).await });

        health.set_started(true).await;

        let served = api::serve(self.api_port, Arc::clone(&self.state), cancel.clone()).await;
        if let Err(e) = &served {
            error!(error = %e, "API server failed");
        }

        // The API only returns early on failure; stop everything else too
        cancel.cancel();
        self.state.health_registry.set_started(false).await;

        if let Err(e) = pipeline_handle.await {
            error!(error = %e, "Pipeline task panicked");
        }
        if let Err(e) = listener.await {
            error!(error = %e, "Broadcast listener task panicked");
        }

        self.logger.log_shutdown("all tasks stopped");
        info!("Worker stopped");
        served
    }
}

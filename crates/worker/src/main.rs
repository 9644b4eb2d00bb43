//! Triage worker - ticket classification pipeline with HTTP API
//!
//! Consumes submitted tickets from the stream, classifies them with the
//! registry's champion models and routes low-confidence tickets to review.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use triage_lib::StructuredLogger;
use triage_worker::{app::App, config::WorkerConfig};

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting triage-worker");

    let config = WorkerConfig::load()?;
    info!(
        consumer = %config.consumer_name,
        storage_backend = ?config.storage_backend,
        "Worker configured"
    );

    let logger = StructuredLogger::new(&config.consumer_name);
    logger.log_startup(WORKER_VERSION, config.confidence_threshold, config.cache_ttl_secs);

    let app = App::build(&config).await?;

    let cancel = CancellationToken::new();
    let mut run = tokio::spawn(app.run(cancel.clone()));

    // Wait for shutdown signal, or for the worker to stop on its own
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
            cancel.cancel();
            run.await??;
        }
        finished = &mut run => finished??,
    }

    Ok(())
}

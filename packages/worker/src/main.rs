//! Standalone queue worker.
//!
//! Environment:
//! - `QUEUE_*` tune the queue (see `QueueConfig::from_env`)
//! - `QUEUE_CONFIG_FILE` reads the queue config from JSON instead
//! - `QUEUE_STORE` is `memory` (default) or `surreal`
//! - `SURREAL_ENDPOINT` picks the SurrealDB engine, e.g. `mem://` or `rocksdb://data/queue`
//! - `QUEUE_DEMO=1` enqueues a few demo jobs on start
//! - `RUST_LOG` overrides the `info` log level

use std::sync::Arc;
use std::time::Duration;

use actors::{EnqueueOptions, JobHandlerRegistry, JobQueue, QueueRuntimeArgs, start_queue};
use db::{DbConfig, JobStore, MemoryStore, SurrealStore};
use queue_core::QueueConfig;
use tracing_subscriber::EnvFilter;

mod handlers;

type BoxError = Box<dyn std::error::Error>;

fn load_config() -> Result<QueueConfig, BoxError> {
    match std::env::var("QUEUE_CONFIG_FILE") {
        Ok(path) => {
            tracing::info!("Loading queue config from {}", path);
            let json = std::fs::read_to_string(&path)?;
            Ok(QueueConfig::from_json(&json)?)
        }
        Err(_) => Ok(QueueConfig::from_env()?),
    }
}

async fn open_store() -> Result<Arc<dyn JobStore>, BoxError> {
    let kind = std::env::var("QUEUE_STORE").unwrap_or_else(|_| "memory".to_string());
    match kind.as_str() {
        "memory" => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        "surreal" => {
            let endpoint =
                std::env::var("SURREAL_ENDPOINT").unwrap_or_else(|_| "mem://".to_string());
            let store = SurrealStore::open(&DbConfig::endpoint(endpoint)).await?;
            Ok(Arc::new(store))
        }
        other => Err(format!("unknown QUEUE_STORE: {}", other).into()),
    }
}

async fn enqueue_demo_jobs(queue: &JobQueue) -> Result<(), BoxError> {
    queue
        .enqueue("echo", "hello from the demo", EnqueueOptions::default())
        .await?;
    queue
        .enqueue(
            "sleep",
            r#"{"millis": 500}"#,
            EnqueueOptions::delayed(Duration::from_secs(2)),
        )
        .await?;
    queue
        .enqueue("noop-fail", "", EnqueueOptions::default())
        .await?;
    tracing::info!("Enqueued demo jobs");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let store = open_store().await?;

    let mut registry = JobHandlerRegistry::new();
    handlers::register_demo_handlers(&mut registry)?;
    tracing::info!("Registered handlers: {:?}", registry.job_types());

    let runtime = start_queue(QueueRuntimeArgs::new(store, registry, config)).await?;

    if std::env::var("QUEUE_DEMO").is_ok_and(|v| v == "1") {
        enqueue_demo_jobs(runtime.queue()).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let stats = runtime.stats().await;
    tracing::info!(
        "Processed {} jobs ({} completed, {} dead-lettered)",
        stats.processed(),
        stats.completed,
        stats.dead_lettered
    );
    runtime.shutdown().await?;
    Ok(())
}

//! News pipeline binary.
//! Loads the pipeline config, starts collectors and enrichment workers,
//! serves `/metrics` + `/stats`, and drains everything on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_pipeline::cache::{CachedStorage, MemoryCache};
use news_pipeline::config::{hot_reload_enabled, start_hot_reload, PipelineConfig};
use news_pipeline::enrich::ai::build_enricher;
use news_pipeline::enrich::dead_letter::{DeadLetterSink, JsonlDeadLetters, MemoryDeadLetters};
use news_pipeline::enrich::queue::EnrichmentQueue;
use news_pipeline::enrich::worker::{WorkerDeps, WorkerPool};
use news_pipeline::ingest::buffer::CollectionBuffer;
use news_pipeline::metrics::{monitor_router, Metrics, MonitorState};
use news_pipeline::storage::{MemoryStorage, StorageAdapter};
use news_pipeline::Orchestrator;

const HOT_RELOAD_POLL: Duration = Duration::from_secs(2);

/// `RUST_LOG` wins; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("news_pipeline=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Local/dev convenience; no-op when .env is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let (cfg, cfg_path) = PipelineConfig::load_default()?;
    let metrics = Metrics::init()?;

    let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn StorageAdapter> = if cfg.cache.enabled {
        Arc::new(CachedStorage::new(store, Arc::new(MemoryCache::new())))
    } else {
        store
    };

    let dead_letters: Arc<dyn DeadLetterSink> = match &cfg.dead_letter.path {
        Some(path) => {
            info!(path = %path.display(), "dead letters go to file");
            Arc::new(JsonlDeadLetters::new(path))
        }
        None => Arc::new(MemoryDeadLetters::default()),
    };

    let buffer = Arc::new(CollectionBuffer::new(cfg.buffer_config()));
    let queue = EnrichmentQueue::new(cfg.queue.capacity);
    let workers = Arc::new(WorkerPool::start(
        cfg.worker_config(),
        WorkerDeps {
            queue: queue.clone(),
            enricher: build_enricher(&cfg.ai),
            storage: storage.clone(),
            buffer: buffer.clone(),
            dead_letters,
            policy: cfg.retry_policy(),
        },
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(cfg.orchestrator_config(), buffer, queue).with_workers(workers),
    );
    let started = orchestrator.start(cfg.sources()).await;
    info!(sources = started.len(), "pipeline running");

    let shutdown = CancellationToken::new();
    if let Some(path) = cfg_path.filter(|_| hot_reload_enabled()) {
        start_hot_reload(path, orchestrator.clone(), HOT_RELOAD_POLL, shutdown.child_token());
    }

    let addr = cfg.metrics_addr()?;
    let app = monitor_router(
        &metrics,
        MonitorState {
            orchestrator: orchestrator.clone(),
            storage,
        },
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding monitoring listener on {addr}"))?;
    info!(%addr, "monitoring endpoint listening");
    let server_stop = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown.cancel();
    orchestrator.shutdown().await;
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "monitoring server exited with error"),
        Err(e) => warn!(error = %e, "monitoring server task failed"),
        Ok(Ok(())) => {}
    }
    info!("bye");
    Ok(())
}

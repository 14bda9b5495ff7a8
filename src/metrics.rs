// src/metrics.rs
//! Prometheus recorder and the polled monitoring router.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;

use crate::ingest::scheduler::Orchestrator;
use crate::model::{ItemFilter, Sentiment};
use crate::storage::StorageAdapter;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already set.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;
        crate::ingest::ensure_metrics_described();
        crate::enrich::ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Recorder that is not installed globally; renders whatever is recorded
    /// through it directly (tests, embedding).
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// `/metrics` only.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

#[derive(Clone)]
pub struct MonitorState {
    pub orchestrator: Arc<Orchestrator>,
    pub storage: Arc<dyn StorageAdapter>,
}

/// Full monitoring surface: `/health`, `/metrics`, `/stats`, `/sources/{id}`,
/// `/runs` and `/items`. Everything is read-only and polled.
pub fn monitor_router(metrics: &Metrics, state: MonitorState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/sources/{id}", get(source_status))
        .route("/runs", get(runs))
        .route("/items", get(items))
        .with_state(state)
        .merge(metrics.router())
}

async fn stats(State(state): State<MonitorState>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot().await)
}

async fn source_status(State(state): State<MonitorState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.collector_status(&id).await {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown source `{id}`")).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    source: Option<String>,
    limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

async fn runs(State(state): State<MonitorState>, Query(q): Query<RunsQuery>) -> impl IntoResponse {
    let runs = state
        .orchestrator
        .buffer()
        .recent_runs(clamp_limit(q.limit), q.source.as_deref());
    Json(runs)
}

#[derive(Debug, Default, Deserialize)]
struct ItemsQuery {
    source: Option<String>,
    category: Option<String>,
    sentiment: Option<String>,
    q: Option<String>,
    limit: Option<usize>,
    skip: Option<usize>,
}

async fn items(State(state): State<MonitorState>, Query(q): Query<ItemsQuery>) -> Response {
    let filter = ItemFilter {
        source_id: q.source,
        category: q.category,
        sentiment: q.sentiment.as_deref().map(Sentiment::from_label),
        text: q.q.filter(|t| !t.trim().is_empty()),
        limit: clamp_limit(q.limit),
        skip: q.skip.unwrap_or(0),
        ..ItemFilter::default()
    };
    match state.storage.query(&filter).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "items query failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

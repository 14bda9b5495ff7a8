// src/enrich/mod.rs
//! Enrichment side of the pipeline: the pluggable [`Enricher`] capability,
//! the bounded task queue, retry policy, dead-letter sinks and the worker pool.

pub mod ai;
pub mod dead_letter;
pub mod lexicon;
pub mod queue;
pub mod retry;
pub mod worker;

use async_trait::async_trait;
use once_cell::sync::OnceCell;

use crate::model::{EnrichedFields, Item};

/// How an enrichment attempt failed. Drives the worker's retry decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichError {
    /// Timeouts, 5xx, connection resets. Retried with backoff.
    #[error("transient enrichment failure: {0}")]
    Transient(String),
    /// The capability itself is down or not configured. Falls back to
    /// local degraded enrichment instead of retrying.
    #[error("enrichment capability unavailable: {0}")]
    Unavailable(String),
    /// The item can never be enriched (rejected input, bad credentials).
    #[error("permanent enrichment failure: {0}")]
    Permanent(String),
}

impl EnrichError {
    pub fn kind(&self) -> &'static str {
        match self {
            EnrichError::Transient(_) => "transient",
            EnrichError::Unavailable(_) => "unavailable",
            EnrichError::Permanent(_) => "permanent",
        }
    }
}

/// Externally supplied enrichment (sentiment, bias, summary, tags).
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str {
        "enricher"
    }

    async fn enrich(&self, item: &Item) -> Result<EnrichedFields, EnrichError>;
}

pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!(
            "enrich_processed_total",
            "Items enriched and handed to storage"
        );
        metrics::describe_counter!(
            "enrich_degraded_total",
            "Items stored with local fallback enrichment"
        );
        metrics::describe_counter!(
            "enrich_retries_total",
            "Enrichment tasks re-enqueued after a transient failure"
        );
        metrics::describe_counter!(
            "enrich_dead_letter_total",
            "Enrichment tasks moved to the dead-letter sink"
        );
        metrics::describe_gauge!("enrich_queue_depth", "Tasks waiting in the enrichment queue");
        metrics::describe_gauge!("enrich_busy_workers", "Workers currently processing a task");
        metrics::describe_histogram!("enrich_task_ms", "Per-task processing time in milliseconds");
    });
}

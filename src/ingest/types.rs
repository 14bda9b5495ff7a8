// src/ingest/types.rs
use std::time::Duration;

use crate::model::{Item, Source};

/// Marker returned by a successful [`Collector::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready;

/// Classified collector failure.
///
/// `Transient` covers timeouts, connection failures, 5xx and malformed payloads;
/// the source keeps its schedule (with backoff). `Permanent` covers bad
/// credentials, unsupported configuration and 4xx other than 429.
/// `RateLimited` carries the server's retry-after hint when one was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("permanent source error: {0}")]
    Permanent(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl SourceError {
    pub fn timeout(after: Duration) -> Self {
        SourceError::Transient(format!("timeout after {}ms", after.as_millis()))
    }

    pub fn unreachable(reason: impl std::fmt::Display) -> Self {
        SourceError::Transient(format!("unreachable: {reason}"))
    }

    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        SourceError::Transient(format!("malformed response: {reason}"))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceError::Permanent(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Transient(_) => "transient",
            SourceError::Permanent(_) => "permanent",
            SourceError::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Capability interface implemented once per source kind.
///
/// An empty `Vec` from `collect` is success ("nothing new"), never an error.
/// The orchestrator guarantees a collector is never invoked concurrently with
/// itself, so implementations need no internal single-flight guard.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    /// The immutable identity of the source this collector serves.
    fn source(&self) -> &Source;

    /// Check that the source is reachable and correctly configured.
    async fn validate(&self) -> Result<Ready, SourceError>;

    /// Fetch the current batch of items (at most `source().max_items`).
    async fn collect(&self) -> Result<Vec<Item>, SourceError>;
}

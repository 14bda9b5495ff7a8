// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod cache;
pub mod config;
pub mod enrich;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod storage;

pub use crate::config::PipelineConfig;
pub use crate::ingest::scheduler::{Orchestrator, PipelineSnapshot};
pub use crate::model::{Item, Source, SourceKind};

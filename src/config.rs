// src/config.rs
//! Pipeline configuration: TOML or JSON file, env overrides, validation, and
//! an optional polling hot-reload of the source list.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::enrich::ai::AiSettings;
use crate::enrich::retry::RetryPolicy;
use crate::enrich::worker::WorkerConfig;
use crate::ingest::backoff::CollectorBackoff;
use crate::ingest::buffer::BufferConfig;
use crate::ingest::providers::http::CollectorSettings;
use crate::ingest::scheduler::{Orchestrator, OrchestratorConfig};
use crate::model::{Source, SourceKind};

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_WORKERS: &str = "PIPELINE_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "PIPELINE_QUEUE_CAPACITY";
pub const ENV_METRICS_ADDR: &str = "METRICS_ADDR";
pub const ENV_HOT_RELOAD: &str = "PIPELINE_HOT_RELOAD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub run_capacity: usize,
    pub item_retention: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            run_capacity: 100,
            item_retention: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub window_secs: u64,
    pub capacity: usize,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            window_secs: 24 * 3600,
            capacity: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub capacity: usize,
    pub push_max_wait_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: 500,
            push_max_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub count: usize,
    pub enrich_timeout_ms: u64,
    pub storage_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            count: 5,
            enrich_timeout_ms: 30_000,
            storage_timeout_ms: 10_000,
            drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSection {
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub user_agent: String,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30 * 60 * 1_000,
            user_agent: CollectorSettings::default().user_agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSection {
    /// JSON-lines file; in-memory only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub addr: String,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9090".to_string(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_items() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<f32>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl SourceConfig {
    pub fn to_source(&self) -> Source {
        let mut s = Source::new(self.id.trim(), self.kind, self.endpoint.trim())
            .with_interval(Duration::from_secs(self.interval_secs))
            .with_max_items(self.max_items);
        if let Some(name) = &self.name {
            s = s.with_name(name.clone());
        }
        if let Some(c) = &self.category {
            s = s.with_category(c.clone());
        }
        s.active = self.active;
        s.priority_hint = self.priority;
        s.api_key_env = self.api_key_env.clone();
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer: BufferSection,
    pub dedup: DedupSection,
    pub queue: QueueSection,
    pub workers: WorkersSection,
    pub retry: RetrySection,
    pub collector: CollectorSection,
    pub cache: CacheSection,
    pub ai: AiSettings,
    pub dead_letter: DeadLetterSection,
    pub metrics: MetricsSection,
    pub sources: Vec<SourceConfig>,
}

impl PipelineConfig {
    /// Parse by extension hint (`toml` / `json`); unknown hints try both.
    pub fn parse(content: &str, hint_ext: &str) -> Result<Self> {
        match hint_ext {
            "toml" => toml::from_str(content).context("parsing TOML pipeline config"),
            "json" => serde_json::from_str(content).context("parsing JSON pipeline config"),
            _ => toml::from_str(content)
                .map_err(anyhow::Error::from)
                .or_else(|_| serde_json::from_str(content).map_err(anyhow::Error::from))
                .map_err(|_| anyhow!("unsupported pipeline config format")),
        }
    }

    /// Read, parse and validate a file. Env overrides are applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = Self::parse(&content, &ext)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// `$PIPELINE_CONFIG_PATH`, else `config/pipeline.toml`, else defaults
    /// (no sources). Returns the path that was read, if any.
    pub fn load_default() -> Result<(Self, Option<PathBuf>)> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
            }
            return Ok((Self::load_from(&pb)?, Some(pb)));
        }
        let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
        if pb.exists() {
            return Ok((Self::load_from(&pb)?, Some(pb)));
        }
        warn!(path = DEFAULT_CONFIG_PATH, "no pipeline config found; running with defaults and no sources");
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok((cfg, None))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var(ENV_WORKERS) {
            self.workers.count = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_WORKERS}={v} is not a number"))?;
        }
        if let Ok(v) = std::env::var(ENV_QUEUE_CAPACITY) {
            self.queue.capacity = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_QUEUE_CAPACITY}={v} is not a number"))?;
        }
        if let Ok(v) = std::env::var(ENV_METRICS_ADDR) {
            self.metrics.addr = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("buffer.run_capacity", self.buffer.run_capacity),
            ("buffer.item_retention", self.buffer.item_retention),
            ("dedup.capacity", self.dedup.capacity),
            ("queue.capacity", self.queue.capacity),
            ("workers.count", self.workers.count),
            ("retry.max_attempts", self.retry.max_attempts as usize),
        ];
        for (name, v) in nonzero {
            if v == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.dedup.capacity < self.buffer.item_retention {
            bail!(
                "dedup.capacity ({}) must be at least buffer.item_retention ({})",
                self.dedup.capacity,
                self.buffer.item_retention
            );
        }
        if self.dedup.window_secs == 0 {
            bail!("dedup.window_secs must be greater than zero");
        }
        self.metrics_addr()?;

        let mut seen = HashSet::new();
        for s in &self.sources {
            let id = s.id.trim();
            if id.is_empty() {
                bail!("source with empty id");
            }
            if !seen.insert(id.to_string()) {
                bail!("duplicate source id `{id}`");
            }
            if s.interval_secs == 0 {
                bail!("source `{id}`: interval_secs must be greater than zero");
            }
            if s.max_items == 0 {
                bail!("source `{id}`: max_items must be greater than zero");
            }
            if s.endpoint.trim().is_empty() {
                bail!("source `{id}`: endpoint is empty");
            }
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics
            .addr
            .parse()
            .with_context(|| format!("invalid metrics address `{}`", self.metrics.addr))
    }

    pub fn sources(&self) -> Vec<Source> {
        self.sources.iter().map(SourceConfig::to_source).collect()
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            run_capacity: self.buffer.run_capacity,
            item_retention: self.buffer.item_retention,
            dedup_window: Duration::from_secs(self.dedup.window_secs),
            dedup_capacity: self.dedup.capacity,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers.count,
            enrich_timeout: Duration::from_millis(self.workers.enrich_timeout_ms),
            storage_timeout: Duration::from_millis(self.workers.storage_timeout_ms),
            drain_timeout: Duration::from_millis(self.workers.drain_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            collector: CollectorSettings {
                timeout: Duration::from_millis(self.collector.timeout_ms.max(1)),
                user_agent: self.collector.user_agent.clone(),
            },
            backoff: CollectorBackoff::new(
                Duration::from_millis(self.collector.backoff_base_ms),
                Duration::from_millis(self.collector.backoff_max_ms),
            ),
            push_max_wait: Duration::from_millis(self.queue.push_max_wait_ms.max(1)),
            ..OrchestratorConfig::default()
        }
    }
}

pub fn hot_reload_enabled() -> bool {
    std::env::var(ENV_HOT_RELOAD).ok().as_deref() == Some("1")
}

/// Poll `path`'s mtime and push a changed source list into the orchestrator.
/// A file that fails to parse or validate is logged and ignored; the running
/// sources stay as they are.
pub fn start_hot_reload(
    path: PathBuf,
    orchestrator: Arc<Orchestrator>,
    poll: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // Baseline taken by the caller, so a write right after this returns is
    // seen as a change.
    let mut last_mtime: Option<SystemTime> = fs::metadata(&path).and_then(|m| m.modified()).ok();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(path = %path.display(), "config hot reload watching");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Ok(mtime) = fs::metadata(&path).and_then(|m| m.modified()) else {
                // Missing or unreadable; keep trying.
                continue;
            };
            if last_mtime.is_some_and(|prev| mtime <= prev) {
                continue;
            }
            last_mtime = Some(mtime);
            match PipelineConfig::load_from(&path) {
                Ok(cfg) => {
                    let summary = orchestrator.apply_sources(cfg.sources()).await;
                    info!(
                        added = ?summary.added,
                        removed = ?summary.removed,
                        updated = ?summary.updated,
                        "pipeline config reloaded"
                    );
                }
                Err(e) => warn!(error = %e, "pipeline config reload rejected"),
            }
        }
    })
}

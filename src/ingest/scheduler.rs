// src/ingest/scheduler.rs
//! Orchestrator: one independent, cancellable periodic task per active source.
//!
//! A source task never runs two collections at once, measures its interval
//! from the end of the previous run, and survives every collector failure.
//! Sources can be added, removed and reconfigured while the pipeline runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::enrich::queue::{EnrichmentQueue, EnrichmentTask, QueueError};
use crate::enrich::worker::{WorkerPool, WorkerStats};
use crate::ingest::backoff::CollectorBackoff;
use crate::ingest::buffer::{BufferStats, CollectionBuffer};
use crate::ingest::providers::{build_collector, http::CollectorSettings};
use crate::ingest::types::{Collector, SourceError};
use crate::model::{CollectionRun, Item, Source, SourceKind};

/// Builds the collector for a source (lets the binary inject API keys and
/// tests inject mocks).
pub type CollectorFactory =
    Arc<dyn Fn(&Source) -> Result<Arc<dyn Collector>, SourceError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub collector: CollectorSettings,
    pub backoff: CollectorBackoff,
    /// Longest a producer waits for a queue slot before reporting backpressure.
    pub push_max_wait: Duration,
    /// How long shutdown waits for source tasks to stop.
    pub stop_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            collector: CollectorSettings::default(),
            backoff: CollectorBackoff::default(),
            push_max_wait: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("source `{0}` is already scheduled")]
    DuplicateSource(String),
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("cannot build collector for `{id}`: {err}")]
    Collector { id: String, err: SourceError },
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    /// Scheduled, not validated yet.
    Pending,
    Healthy,
    /// Recent runs failed; polling with backoff.
    Degraded,
    /// Validation failed or a permanent error was returned. Still polled.
    Disabled,
}

/// Operator view of one source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CollectorStatus {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub endpoint: String,
    pub active: bool,
    pub health: SourceHealth,
    pub in_flight: bool,
    pub interval_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub next_delay_ms: u64,
    pub runs: u64,
    pub items_collected: u64,
    pub items_new: u64,
}

/// Everything the monitoring layer polls.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<CollectorStatus>,
    pub buffer: BufferStats,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub workers: Option<WorkerStats>,
    pub dead_lettered: u64,
    pub degraded: u64,
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug)]
struct StatusInner {
    source: Source,
    health: SourceHealth,
    validated: bool,
    in_flight: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
    next_delay: Duration,
}

/// Per-source state shared between its task and the orchestrator.
struct SourceCtx {
    collector: Arc<dyn Collector>,
    status: Mutex<StatusInner>,
    buffer: Arc<CollectionBuffer>,
    queue: Arc<EnrichmentQueue>,
    cfg: OrchestratorConfig,
}

struct SourceTask {
    ctx: Arc<SourceCtx>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    buffer: Arc<CollectionBuffer>,
    queue: Arc<EnrichmentQueue>,
    workers: Option<Arc<WorkerPool>>,
    factory: CollectorFactory,
    root: CancellationToken,
    tasks: tokio::sync::Mutex<HashMap<String, SourceTask>>,
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        buffer: Arc<CollectionBuffer>,
        queue: Arc<EnrichmentQueue>,
    ) -> Self {
        super::ensure_metrics_described();
        let settings = cfg.collector.clone();
        let factory: CollectorFactory = Arc::new(move |s: &Source| {
            build_collector(s, &settings, s.api_key().as_deref())
        });
        Self {
            cfg,
            buffer,
            queue,
            workers: None,
            factory,
            root: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_factory(mut self, factory: CollectorFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Attach the worker pool so shutdown drains it and snapshots include it.
    pub fn with_workers(mut self, workers: Arc<WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn buffer(&self) -> &Arc<CollectionBuffer> {
        &self.buffer
    }

    pub fn queue(&self) -> &Arc<EnrichmentQueue> {
        &self.queue
    }

    pub fn workers(&self) -> Option<&Arc<WorkerPool>> {
        self.workers.as_ref()
    }

    /// Schedule every active source. Sources whose collector cannot be built
    /// are logged and skipped.
    pub async fn start(&self, sources: Vec<Source>) -> Vec<String> {
        let mut started = Vec::new();
        for s in sources.into_iter().filter(|s| s.active) {
            let id = s.id.clone();
            match self.add_source(s).await {
                Ok(()) => started.push(id),
                Err(e) => error!(target: "ingest", source = %id, error = %e, "source not scheduled"),
            }
        }
        info!(target: "ingest", sources = started.len(), "orchestrator started");
        started
    }

    /// Build the collector through the factory and schedule it.
    pub async fn add_source(&self, source: Source) -> Result<(), OrchestratorError> {
        let collector = (self.factory)(&source).map_err(|err| OrchestratorError::Collector {
            id: source.id.clone(),
            err,
        })?;
        self.add_collector(collector).await
    }

    /// Schedule an already-built collector under its source's id.
    pub async fn add_collector(&self, collector: Arc<dyn Collector>) -> Result<(), OrchestratorError> {
        if self.root.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let source = collector.source().clone();
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&source.id) {
            return Err(OrchestratorError::DuplicateSource(source.id));
        }
        let ctx = Arc::new(SourceCtx {
            collector,
            status: Mutex::new(StatusInner {
                next_delay: source.interval,
                source: source.clone(),
                health: SourceHealth::Pending,
                validated: false,
                in_flight: false,
                last_run_at: None,
                last_success_at: None,
                consecutive_failures: 0,
                last_error: None,
            }),
            buffer: self.buffer.clone(),
            queue: self.queue.clone(),
            cfg: self.cfg.clone(),
        });
        let cancel = self.root.child_token();
        let handle = tokio::spawn(run_source(ctx.clone(), cancel.clone()));
        info!(
            target: "ingest",
            source = %source.id,
            kind = %source.kind,
            interval_secs = source.interval.as_secs(),
            "source scheduled"
        );
        tasks.insert(source.id, SourceTask { ctx, cancel, handle });
        Ok(())
    }

    /// Cancel a source's task and wait for it to stop. An in-flight run is
    /// abandoned at its next await point.
    pub async fn remove_source(&self, id: &str) -> Result<(), OrchestratorError> {
        let task = self
            .tasks
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| OrchestratorError::UnknownSource(id.to_string()))?;
        stop_task(id, task, self.cfg.stop_timeout).await;
        info!(target: "ingest", source = %id, "source removed");
        Ok(())
    }

    /// Change the polling interval of a running source. Takes effect after
    /// the current wait.
    pub async fn set_interval(&self, id: &str, interval: Duration) -> Result<(), OrchestratorError> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(id)
            .ok_or_else(|| OrchestratorError::UnknownSource(id.to_string()))?;
        task.ctx.lock_status().source.interval = interval;
        Ok(())
    }

    /// Reconcile running tasks with a new source list (config reload):
    /// unknown or inactive sources stop, new active ones start, interval
    /// changes apply in place, and identity changes restart the task.
    pub async fn apply_sources(&self, sources: Vec<Source>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let wanted: BTreeMap<String, Source> = sources
            .into_iter()
            .filter(|s| s.active)
            .map(|s| (s.id.clone(), s))
            .collect();

        let current: Vec<(String, Source)> = {
            let tasks = self.tasks.lock().await;
            tasks
                .iter()
                .map(|(id, t)| (id.clone(), t.ctx.lock_status().source.clone()))
                .collect()
        };

        for (id, running) in &current {
            match wanted.get(id) {
                None => {
                    if self.remove_source(id).await.is_ok() {
                        summary.removed.push(id.clone());
                    }
                }
                Some(next) if !running.same_identity(next) => {
                    let _ = self.remove_source(id).await;
                    match self.add_source(next.clone()).await {
                        Ok(()) => summary.updated.push(id.clone()),
                        Err(e) => {
                            warn!(target: "ingest", source = %id, error = %e, "reload: restart failed");
                            summary.failed.push(id.clone());
                        }
                    }
                }
                Some(next) if running.interval != next.interval => {
                    if self.set_interval(id, next.interval).await.is_ok() {
                        summary.updated.push(id.clone());
                    }
                }
                Some(_) => {}
            }
        }

        for (id, source) in wanted {
            if current.iter().any(|(c, _)| *c == id) {
                continue;
            }
            match self.add_source(source).await {
                Ok(()) => summary.added.push(id),
                Err(e) => {
                    warn!(target: "ingest", source = %id, error = %e, "reload: add failed");
                    summary.failed.push(id);
                }
            }
        }
        info!(
            target: "ingest",
            added = summary.added.len(),
            removed = summary.removed.len(),
            updated = summary.updated.len(),
            failed = summary.failed.len(),
            "sources reloaded"
        );
        summary
    }

    pub async fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn collector_status(&self, id: &str) -> Option<CollectorStatus> {
        let tasks = self.tasks.lock().await;
        tasks.get(id).map(|t| t.ctx.status(&self.buffer))
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        let mut sources: Vec<CollectorStatus> = {
            let tasks = self.tasks.lock().await;
            tasks.values().map(|t| t.ctx.status(&self.buffer)).collect()
        };
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        let buffer = self.buffer.stats();
        PipelineSnapshot {
            generated_at: Utc::now(),
            sources,
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            workers: self.workers.as_ref().map(|w| w.stats()),
            dead_lettered: buffer.dead_lettered,
            degraded: buffer.degraded,
            buffer,
        }
    }

    /// Stop every source task, then drain the worker pool.
    pub async fn shutdown(&self) {
        info!(target: "ingest", "orchestrator shutting down");
        self.root.cancel();
        let tasks: Vec<(String, SourceTask)> = self.tasks.lock().await.drain().collect();
        for (id, task) in tasks {
            stop_task(&id, task, self.cfg.stop_timeout).await;
        }
        if let Some(workers) = &self.workers {
            workers.shutdown().await;
        }
        info!(target: "ingest", "orchestrator stopped");
    }
}

async fn stop_task(id: &str, task: SourceTask, timeout: Duration) {
    task.cancel.cancel();
    let mut handle = task.handle;
    if tokio::time::timeout(timeout, &mut handle).await.is_err() {
        warn!(target: "ingest", source = %id, "source task did not stop in time; aborting");
        handle.abort();
    }
}

impl SourceCtx {
    fn lock_status(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn status(&self, buffer: &CollectionBuffer) -> CollectorStatus {
        let s = self.lock_status();
        let counters = buffer.source_counters(&s.source.id).unwrap_or_default();
        CollectorStatus {
            id: s.source.id.clone(),
            name: s.source.name.clone(),
            kind: s.source.kind,
            endpoint: s.source.endpoint.clone(),
            active: s.source.active,
            health: s.health,
            in_flight: s.in_flight,
            interval_secs: s.source.interval.as_secs(),
            last_run_at: s.last_run_at,
            last_success_at: s.last_success_at,
            consecutive_failures: s.consecutive_failures,
            last_error: s.last_error.clone(),
            next_delay_ms: s.next_delay.as_millis() as u64,
            runs: counters.runs,
            items_collected: counters.items_collected,
            items_new: counters.items_new,
        }
    }

    /// One scheduled invocation. Returns how long to wait before the next.
    async fn run_once(&self, cancel: &CancellationToken) -> Duration {
        let (source_id, needs_validation) = {
            let mut s = self.lock_status();
            s.in_flight = true;
            (s.source.id.clone(), !s.validated)
        };
        let started_at = Utc::now();
        let t0 = Instant::now();
        let timeout = self.cfg.collector.timeout;

        if needs_validation {
            let res = match tokio::time::timeout(timeout, self.collector.validate()).await {
                Ok(r) => r,
                Err(_) => Err(SourceError::timeout(timeout)),
            };
            match res {
                Ok(_) => {
                    let mut s = self.lock_status();
                    s.validated = true;
                    s.health = SourceHealth::Healthy;
                    debug!(target: "ingest", source = %source_id, "source validated");
                }
                Err(err) => {
                    let msg = format!("validation failed: {err}");
                    error!(target: "ingest", source = %source_id, error = %err, "source disabled until validation passes");
                    let run = CollectionRun::failed(&source_id, started_at, t0.elapsed(), msg.clone());
                    self.buffer.record_run(run, Vec::new());
                    return self.after_failure(&err, msg, SourceHealth::Disabled);
                }
            }
        }

        let res = match tokio::time::timeout(timeout, self.collector.collect()).await {
            Ok(r) => r,
            Err(_) => Err(SourceError::timeout(timeout)),
        };
        let elapsed = t0.elapsed();
        histogram!("ingest_collect_ms").record(elapsed.as_secs_f64() * 1000.0);
        counter!("ingest_runs_total").increment(1);
        gauge!("ingest_last_run_ts").set(Utc::now().timestamp() as f64);

        match res {
            Ok(items) => {
                let collected = items.len();
                let run = CollectionRun::succeeded(&source_id, started_at, elapsed, collected);
                let (run, fresh) = self.buffer.record_run(run, items);
                counter!("ingest_items_total").increment(collected as u64);
                counter!("ingest_dedup_total").increment((collected - run.items_new) as u64);
                info!(
                    target: "ingest",
                    source = %source_id,
                    collected,
                    new = run.items_new,
                    ms = elapsed.as_millis() as u64,
                    "collection run"
                );
                let interval = {
                    let mut s = self.lock_status();
                    s.consecutive_failures = 0;
                    s.last_error = None;
                    s.health = SourceHealth::Healthy;
                    s.last_run_at = Some(run.finished_at);
                    s.last_success_at = Some(run.finished_at);
                    s.next_delay = s.source.interval;
                    s.source.interval
                };
                self.enqueue(&source_id, fresh, cancel).await;
                self.lock_status().in_flight = false;
                interval
            }
            Err(err) => {
                let msg = err.to_string();
                let run = CollectionRun::failed(&source_id, started_at, elapsed, msg.clone());
                self.buffer.record_run(run, Vec::new());
                let health = if err.is_permanent() {
                    error!(target: "ingest", source = %source_id, error = %err, "permanent collector failure; source disabled");
                    SourceHealth::Disabled
                } else {
                    warn!(target: "ingest", source = %source_id, error = %err, "collection run failed");
                    SourceHealth::Degraded
                };
                self.after_failure(&err, msg, health)
            }
        }
    }

    fn after_failure(&self, err: &SourceError, msg: String, health: SourceHealth) -> Duration {
        counter!("ingest_collector_errors_total", "kind" => err.kind()).increment(1);
        let mut s = self.lock_status();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.health = health;
        s.last_error = Some(msg);
        s.last_run_at = Some(Utc::now());
        s.in_flight = false;
        if err.is_permanent() {
            // Stays disabled until a later run validates again.
            s.validated = false;
        }
        let delay = self
            .cfg
            .backoff
            .next_delay(s.source.interval, s.consecutive_failures, err);
        s.next_delay = delay;
        delay
    }

    /// Push fresh items in order. A full queue never drops an item: each
    /// wait longer than the max wait is reported and the push retried.
    async fn enqueue(&self, source_id: &str, items: Vec<Arc<Item>>, cancel: &CancellationToken) {
        let total = items.len();
        for (i, item) in items.into_iter().enumerate() {
            let mut task = EnrichmentTask::new(item);
            loop {
                let pushed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!(target: "ingest", source = %source_id, unqueued = total - i, "shutdown before items were queued");
                        return;
                    }
                    r = self.queue.push_within(task, self.cfg.push_max_wait) => r,
                };
                match pushed {
                    Ok(()) => break,
                    Err(QueueError::Full { task: t, waited }) => {
                        self.buffer.record_backpressure();
                        counter!("ingest_backpressure_total").increment(1);
                        warn!(
                            target: "ingest",
                            source = %source_id,
                            waited_ms = waited.as_millis() as u64,
                            depth = self.queue.depth(),
                            "enrichment queue full; producer waiting"
                        );
                        task = t;
                    }
                    Err(QueueError::Closed(t)) => {
                        error!(target: "ingest", source = %source_id, item = %t.item.id, "enrichment queue closed");
                        return;
                    }
                }
            }
        }
    }
}

async fn run_source(ctx: Arc<SourceCtx>, cancel: CancellationToken) {
    loop {
        let delay = tokio::select! {
            _ = cancel.cancelled() => break,
            d = ctx.run_once(&cancel) => d,
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    let mut s = ctx.lock_status();
    s.in_flight = false;
    debug!(target: "ingest", source = %s.source.id, "source task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::buffer::BufferConfig;
    use crate::ingest::types::Ready;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        source: Source,
        calls: AtomicUsize,
        fail_validate: bool,
    }

    #[async_trait]
    impl Collector for Counting {
        fn source(&self) -> &Source {
            &self.source
        }
        async fn validate(&self) -> Result<Ready, SourceError> {
            if self.fail_validate {
                Err(SourceError::unreachable("dns"))
            } else {
                Ok(Ready)
            }
        }
        async fn collect(&self) -> Result<Vec<Item>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Item::new(&self.source, format!("t{n}"), "", None)])
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(CollectionBuffer::new(BufferConfig::default())),
            EnrichmentQueue::new(100),
        )
    }

    fn counting(id: &str, fail_validate: bool) -> Arc<Counting> {
        Arc::new(Counting {
            source: Source::new(id, SourceKind::Feed, "mock://").with_interval(Duration::from_secs(60)),
            calls: AtomicUsize::new(0),
            fail_validate,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_until_removed() {
        let orch = orchestrator();
        let c = counting("a", false);
        orch.add_collector(c.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(c.calls.load(Ordering::SeqCst), 2);

        assert!(matches!(
            orch.add_collector(counting("a", false)).await,
            Err(OrchestratorError::DuplicateSource(_))
        ));
        orch.remove_source("a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
        assert_eq!(orch.queue().depth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_validation_disables_but_keeps_polling() {
        let orch = orchestrator();
        orch.add_collector(counting("down", true)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let st = orch.collector_status("down").await.unwrap();
        assert_eq!(st.health, SourceHealth::Disabled);
        assert_eq!(st.consecutive_failures, 1);
        tokio::time::sleep(Duration::from_secs(61)).await;
        let st = orch.collector_status("down").await.unwrap();
        assert_eq!(st.consecutive_failures, 2);
        assert_eq!(orch.buffer().stats().failed_runs, 2);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reload_adds_removes_and_updates() {
        let orch = orchestrator().with_factory(Arc::new(|s: &Source| {
            Ok(Arc::new(Counting {
                source: s.clone(),
                calls: AtomicUsize::new(0),
                fail_validate: false,
            }) as Arc<dyn Collector>)
        }));
        let a = Source::new("a", SourceKind::Feed, "mock://a");
        let b = Source::new("b", SourceKind::Feed, "mock://b");
        orch.start(vec![a.clone(), b.clone()]).await;

        let mut b2 = b.clone();
        b2.interval = Duration::from_secs(30);
        let c = Source::new("c", SourceKind::Social, "mock://c");
        let summary = orch.apply_sources(vec![b2, c]).await;
        assert_eq!(summary.removed, vec!["a".to_string()]);
        assert_eq!(summary.updated, vec!["b".to_string()]);
        assert_eq!(summary.added, vec!["c".to_string()]);
        assert_eq!(orch.source_ids().await, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(orch.collector_status("b").await.unwrap().interval_secs, 30);
        orch.shutdown().await;
    }
}

// src/enrich/worker.rs
//! Fixed-size pool of enrichment workers.
//!
//! Each worker pulls a task, runs the enricher under a timeout and writes the
//! result through the storage adapter. Outcomes per task:
//! - success → stored (full quality)
//! - enricher `Unavailable` → local lexicon fallback, stored as degraded, no retry
//! - `Transient` / timeout / retryable storage error → re-enqueued after backoff
//! - `Permanent` or attempts exhausted → dead letter, exactly once

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::lexicon::LocalEnricher;
use super::queue::{EnrichmentQueue, EnrichmentTask};
use super::retry::{RetryDecision, RetryPolicy};
use super::{EnrichError, Enricher};
use crate::ingest::buffer::CollectionBuffer;
use crate::model::EnrichmentQuality;
use crate::storage::{StorageAdapter, StorageError};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub workers: usize,
    pub enrich_timeout: Duration,
    pub storage_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            enrich_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a worker talks to.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<EnrichmentQueue>,
    pub enricher: Arc<dyn Enricher>,
    pub storage: Arc<dyn StorageAdapter>,
    pub buffer: Arc<CollectionBuffer>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    pub busy: usize,
    pub utilization: f64,
    pub paused: bool,
    pub processed: u64,
    pub degraded: u64,
    pub retries: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    /// Retries still waiting on their delay when the pool shut down.
    pub abandoned: u64,
    pub avg_processing_ms: f64,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    pub queue_capacity: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    degraded: AtomicU64,
    retries: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    busy: AtomicUsize,
    total_micros: AtomicU64,
    timed: AtomicU64,
}

struct Shared {
    cfg: WorkerConfig,
    deps: WorkerDeps,
    fallback: LocalEnricher,
    counters: Counters,
    paused: watch::Sender<bool>,
    /// Stop pulling new work; drain what is queued.
    stop_intake: CancellationToken,
    retries: TaskTracker,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(c: &'a AtomicUsize) -> Self {
        let busy = c.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("enrich_busy_workers").set(busy as f64);
        Self(c)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let busy = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("enrich_busy_workers").set(busy as f64);
    }
}

impl WorkerPool {
    /// Spawn `cfg.workers` workers on the current runtime.
    pub fn start(cfg: WorkerConfig, deps: WorkerDeps) -> Self {
        super::ensure_metrics_described();
        let workers = cfg.workers.max(1);
        let (paused, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cfg: WorkerConfig { workers, ..cfg },
            deps,
            fallback: LocalEnricher::degraded(),
            counters: Counters::default(),
            paused,
            stop_intake: CancellationToken::new(),
            retries: TaskTracker::new(),
        });
        let handles = (0..workers)
            .map(|id| {
                let shared = shared.clone();
                tokio::spawn(async move { shared.run_worker(id).await })
            })
            .collect();
        info!(
            target: "enrich",
            workers,
            enricher = shared.deps.enricher.name(),
            queue_capacity = shared.deps.queue.capacity(),
            "worker pool started"
        );
        Self {
            shared,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<EnrichmentQueue> {
        &self.shared.deps.queue
    }

    /// Workers finish their current task and stop pulling.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
        info!(target: "enrich", "worker pool paused");
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
        info!(target: "enrich", "worker pool resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.shared.counters;
        let workers = self.shared.cfg.workers;
        let busy = c.busy.load(Ordering::SeqCst);
        let timed = c.timed.load(Ordering::Relaxed);
        let q = &self.shared.deps.queue;
        WorkerStats {
            workers,
            busy,
            utilization: busy as f64 / workers as f64,
            paused: self.is_paused(),
            processed: c.processed.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            avg_processing_ms: if timed == 0 {
                0.0
            } else {
                c.total_micros.load(Ordering::Relaxed) as f64 / timed as f64 / 1000.0
            },
            queue_depth: q.depth(),
            max_queue_depth: q.max_depth(),
            queue_capacity: q.capacity(),
        }
    }

    /// Stop intake, let workers drain queued tasks, and wait up to the
    /// configured drain timeout. Workers still running after that are aborted.
    /// Returns `true` if everything finished in time.
    pub async fn shutdown(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return true;
        }
        let shared = &self.shared;
        shared.stop_intake.cancel();
        // Intake stopped: a paused pool must still drain.
        shared.paused.send_replace(false);
        shared.retries.close();

        let mut handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        let drain = async {
            for h in handles.iter_mut() {
                if let Err(e) = h.await {
                    warn!(target: "enrich", error = %e, "worker task ended abnormally");
                }
            }
            shared.retries.wait().await;
        };
        let finished = tokio::time::timeout(shared.cfg.drain_timeout, drain).await.is_ok();
        if !finished {
            let left_in_queue = shared.deps.queue.depth();
            let in_flight = shared.counters.busy.load(Ordering::SeqCst);
            shared
                .counters
                .abandoned
                .fetch_add((left_in_queue + in_flight) as u64, Ordering::Relaxed);
            warn!(
                target: "enrich",
                timeout_ms = shared.cfg.drain_timeout.as_millis() as u64,
                left_in_queue,
                in_flight,
                "worker drain timed out; aborting workers"
            );
            for h in &handles {
                h.abort();
            }
        }
        let stats = self.stats();
        info!(
            target: "enrich",
            processed = stats.processed,
            degraded = stats.degraded,
            dead_lettered = stats.dead_lettered,
            abandoned = stats.abandoned,
            "worker pool stopped"
        );
        finished
    }
}

impl Shared {
    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(target: "enrich", worker = id, "worker started");
        let mut paused = self.paused.subscribe();
        loop {
            if self.stop_intake.is_cancelled() {
                match self.deps.queue.pull_ready().await {
                    Some(task) => {
                        self.process(task).await;
                        continue;
                    }
                    None => break,
                }
            }
            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = self.stop_intake.cancelled() => {}
                    _ = paused.wait_for(|p| !*p) => {}
                }
                continue;
            }
            let next = tokio::select! {
                biased;
                _ = self.stop_intake.cancelled() => continue,
                _ = paused.changed() => continue,
                t = self.deps.queue.pull() => t,
            };
            match next {
                Some(task) => self.process(task).await,
                None => break,
            }
        }
        debug!(target: "enrich", worker = id, "worker stopped");
    }

    async fn process(self: &Arc<Self>, task: EnrichmentTask) {
        if let Some(at) = task.not_before {
            if at > Instant::now() {
                tokio::time::sleep_until(at).await;
            }
        }
        let _busy = BusyGuard::enter(&self.counters.busy);
        let started = Instant::now();
        let item_id = task.item.id.clone();

        let attempt =
            tokio::time::timeout(self.cfg.enrich_timeout, self.deps.enricher.enrich(&task.item))
                .await;
        let (fields, quality) = match attempt {
            Ok(Ok(fields)) => (fields, EnrichmentQuality::Full),
            Ok(Err(EnrichError::Unavailable(reason))) => {
                debug!(target: "enrich", item = %item_id, %reason, "enricher unavailable; local fallback");
                (self.fallback.analyze(&task.item), EnrichmentQuality::Degraded)
            }
            Ok(Err(err)) => return self.fail(task, err).await,
            Err(_) => {
                let err = EnrichError::Transient(format!(
                    "enrichment timed out after {}ms",
                    self.cfg.enrich_timeout.as_millis()
                ));
                return self.fail(task, err).await;
            }
        };

        let enriched = Arc::new(task.item.with_enrichment(fields, quality));
        let stored =
            tokio::time::timeout(self.cfg.storage_timeout, self.deps.storage.upsert(&enriched))
                .await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail(task, storage_to_enrich(e)).await,
            Err(_) => {
                let err = EnrichError::Transient(format!(
                    "storage timed out after {}ms",
                    self.cfg.storage_timeout.as_millis()
                ));
                return self.fail(task, err).await;
            }
        }

        self.deps.buffer.record_enriched(enriched);
        let c = &self.counters;
        c.processed.fetch_add(1, Ordering::Relaxed);
        counter!("enrich_processed_total").increment(1);
        if quality == EnrichmentQuality::Degraded {
            c.degraded.fetch_add(1, Ordering::Relaxed);
            counter!("enrich_degraded_total").increment(1);
        }
        let elapsed = started.elapsed();
        c.total_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        c.timed.fetch_add(1, Ordering::Relaxed);
        histogram!("enrich_task_ms").record(elapsed.as_secs_f64() * 1000.0);
        debug!(
            target: "enrich",
            item = %item_id,
            attempt = task.attempt,
            degraded = quality == EnrichmentQuality::Degraded,
            "item stored"
        );
    }

    async fn fail(self: &Arc<Self>, task: EnrichmentTask, err: EnrichError) {
        self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let msg = err.to_string();
        match self.deps.policy.should_retry(&err, task.attempt) {
            RetryDecision::Retry { delay, attempt } => {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                counter!("enrich_retries_total").increment(1);
                warn!(
                    target: "enrich",
                    item = %task.item.id,
                    failed_attempt = task.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "enrichment failed; retrying"
                );
                let task = task.next_attempt(attempt, delay, err.kind(), &msg);
                self.schedule_retry(task, delay);
            }
            RetryDecision::GiveUp { reason } => {
                let mut task = task;
                task.record_failure(err.kind(), &msg);
                self.dead_letter(task, reason).await;
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, task: EnrichmentTask, delay: Duration) {
        let shared = self.clone();
        self.retries.spawn(async move {
            tokio::select! {
                _ = shared.stop_intake.cancelled() => {
                    shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "enrich", item = %task.item.id, attempt = task.attempt, "pending retry abandoned at shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = shared.deps.queue.push(task).await {
                        let task = e.into_task();
                        shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        warn!(target: "enrich", item = %task.item.id, "enrichment queue closed; retry abandoned");
                    }
                }
            }
        });
    }

    async fn dead_letter(&self, task: EnrichmentTask, reason: String) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        counter!("enrich_dead_letter_total").increment(1);
        self.deps.buffer.record_dead_letter();
        error!(
            target: "enrich",
            item = %task.item.id,
            source = %task.item.source_id,
            attempts = task.attempt,
            %reason,
            "enrichment task dead-lettered"
        );
        let letter = DeadLetter::from_task(task, reason);
        if let Err(e) = self.deps.dead_letters.record(&letter).await {
            warn!(target: "enrich", item = %letter.item.id, error = %e, "dead-letter sink write failed");
        }
    }
}

fn storage_to_enrich(e: StorageError) -> EnrichError {
    match e {
        StorageError::Permanent(m) => EnrichError::Permanent(format!("storage: {m}")),
        StorageError::Transient(m) | StorageError::Unavailable(m) => {
            EnrichError::Transient(format!("storage: {m}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::dead_letter::MemoryDeadLetters;
    use crate::ingest::buffer::BufferConfig;
    use crate::model::{Item, Source, SourceKind};
    use crate::storage::MemoryStorage;

    fn deps(enricher: Arc<dyn Enricher>) -> (WorkerDeps, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let deps = WorkerDeps {
            queue: EnrichmentQueue::new(8),
            enricher,
            storage: storage.clone(),
            buffer: Arc::new(CollectionBuffer::new(BufferConfig::default())),
            dead_letters: Arc::new(MemoryDeadLetters::default()),
            policy: RetryPolicy::default(),
        };
        (deps, storage)
    }

    fn task(title: &str) -> EnrichmentTask {
        let src = Source::new("s", SourceKind::Feed, "https://ex/rss");
        EnrichmentTask::new(Arc::new(Item::new(&src, title, "a good day", None)))
    }

    #[tokio::test]
    async fn local_enricher_stores_full_quality() {
        let (deps, storage) = deps(Arc::new(LocalEnricher::full()));
        let queue = deps.queue.clone();
        let pool = WorkerPool::start(
            WorkerConfig {
                workers: 2,
                ..WorkerConfig::default()
            },
            deps,
        );
        let t = task("a");
        let id = t.item.id.clone();
        queue.push(t).await.unwrap();
        assert!(pool.shutdown().await);
        let stored = storage.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.enrichment_quality, Some(EnrichmentQuality::Full));
        assert_eq!(pool.stats().processed, 1);
    }

    #[tokio::test]
    async fn paused_pool_does_not_pull() {
        let (deps, storage) = deps(Arc::new(LocalEnricher::full()));
        let queue = deps.queue.clone();
        let pool = WorkerPool::start(WorkerConfig::default(), deps);
        pool.pause();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(task("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.len(), 0);
        assert_eq!(queue.depth(), 1);
        pool.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.len(), 1);
        pool.shutdown().await;
    }
}

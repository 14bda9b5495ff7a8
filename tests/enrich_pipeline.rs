// tests/enrich_pipeline.rs
// Worker pool outcomes: degraded fallback, retries, dead letters, backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use news_pipeline::enrich::ai::DisabledEnricher;
use news_pipeline::enrich::dead_letter::MemoryDeadLetters;
use news_pipeline::enrich::queue::{EnrichmentQueue, EnrichmentTask};
use news_pipeline::enrich::retry::RetryPolicy;
use news_pipeline::enrich::worker::{WorkerConfig, WorkerDeps, WorkerPool};
use news_pipeline::enrich::{EnrichError, Enricher};
use news_pipeline::ingest::buffer::{BufferConfig, CollectionBuffer};
use news_pipeline::ingest::scheduler::{Orchestrator, OrchestratorConfig};
use news_pipeline::ingest::types::{Collector, Ready, SourceError};
use news_pipeline::model::{EnrichedFields, EnrichmentQuality, Item, Sentiment, Source, SourceKind};
use news_pipeline::model::ItemFilter;
use news_pipeline::storage::{MemoryStorage, StorageAdapter, StorageError, StorageStats};
use tokio::sync::Semaphore;
use tokio::time::Instant;

fn source() -> Source {
    Source::new("wire", SourceKind::Feed, "mock://wire")
}

fn item(title: &str) -> Arc<Item> {
    Arc::new(Item::new(
        &source(),
        title,
        "Markets rallied after strong earnings and record gains.",
        Some(format!("https://example.com/{title}")),
    ))
}

struct Harness {
    queue: Arc<EnrichmentQueue>,
    storage: Arc<MemoryStorage>,
    buffer: Arc<CollectionBuffer>,
    dead: Arc<MemoryDeadLetters>,
}

impl Harness {
    fn new(capacity: usize) -> Self {
        Self {
            queue: EnrichmentQueue::new(capacity),
            storage: Arc::new(MemoryStorage::new()),
            buffer: Arc::new(CollectionBuffer::new(BufferConfig::default())),
            dead: Arc::new(MemoryDeadLetters::default()),
        }
    }

    fn deps(
        &self,
        enricher: Arc<dyn Enricher>,
        storage: Arc<dyn StorageAdapter>,
        policy: RetryPolicy,
    ) -> WorkerDeps {
        WorkerDeps {
            queue: self.queue.clone(),
            enricher,
            storage,
            buffer: self.buffer.clone(),
            dead_letters: self.dead.clone(),
            policy,
        }
    }

    fn pool(&self, workers: usize, enricher: Arc<dyn Enricher>) -> WorkerPool {
        WorkerPool::start(
            WorkerConfig {
                workers,
                ..WorkerConfig::default()
            },
            self.deps(enricher, self.storage.clone(), RetryPolicy::default()),
        )
    }
}

#[tokio::test(start_paused = true)]
async fn unavailable_enricher_degrades_and_stores_once() {
    let h = Harness::new(16);
    let pool = h.pool(3, Arc::new(DisabledEnricher::new("no api key")));

    let items: Vec<Arc<Item>> = (0..6).map(|n| item(&format!("story-{n}"))).collect();
    for it in &items {
        h.queue.push(EnrichmentTask::new(it.clone())).await.unwrap();
    }
    assert!(pool.shutdown().await);

    for it in &items {
        assert_eq!(h.storage.write_count(&it.id), 1);
        let stored = h.storage.get(&it.id).await.unwrap().unwrap();
        assert_eq!(stored.enrichment_quality, Some(EnrichmentQuality::Degraded));
        assert!(stored.summary.is_none());
        assert!(stored.sentiment.is_some());
    }
    let stats = pool.stats();
    assert_eq!(stats.processed, 6);
    assert_eq!(stats.degraded, 6);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(h.buffer.stats().degraded, 6);
    assert!(h.dead.is_empty());
}

/// Always transient; remembers when it was called.
#[derive(Default)]
struct Flaky {
    calls: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Enricher for Flaky {
    async fn enrich(&self, _item: &Item) -> Result<EnrichedFields, EnrichError> {
        self.calls.lock().unwrap().push(Instant::now());
        Err(EnrichError::Transient("upstream 503".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_dead_letter_once() {
    let h = Harness::new(8);
    let flaky = Arc::new(Flaky::default());
    let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60));
    let pool = WorkerPool::start(
        WorkerConfig {
            workers: 2,
            ..WorkerConfig::default()
        },
        h.deps(flaky.clone(), h.storage.clone(), policy),
    );

    let it = item("flaky");
    h.queue.push(EnrichmentTask::new(it.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let calls = flaky.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1] - calls[0];
    let second_gap = calls[2] - calls[1];
    assert!(first_gap >= Duration::from_secs(1));
    assert!(second_gap > first_gap);

    let letters = h.dead.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].item.id, it.id);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].failures.len(), 3);
    assert!(letters[0].failures.iter().all(|f| f.kind == "transient"));

    // Nothing more happens for that item.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(flaky.calls.lock().unwrap().len(), 3);
    assert_eq!(h.dead.len(), 1);
    assert_eq!(h.storage.len(), 0);

    let stats = pool.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.failed_attempts, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(h.buffer.stats().dead_lettered, 1);
    pool.shutdown().await;
}

/// Permanent refusal for one title, normal fields for everything else.
struct Picky;

#[async_trait]
impl Enricher for Picky {
    async fn enrich(&self, item: &Item) -> Result<EnrichedFields, EnrichError> {
        if item.title == "poison" {
            return Err(EnrichError::Permanent("content rejected".into()));
        }
        Ok(EnrichedFields {
            sentiment: Some(Sentiment::Positive),
            sentiment_score: Some(0.8),
            bias_score: Some(0.2),
            summary: Some("short".into()),
            tags: vec!["markets".into()],
        })
    }
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let h = Harness::new(8);
    let pool = h.pool(2, Arc::new(Picky));
    let poison = item("poison");
    let good = item("good");
    h.queue.push(EnrichmentTask::new(poison.clone())).await.unwrap();
    h.queue.push(EnrichmentTask::new(good.clone())).await.unwrap();
    assert!(pool.shutdown().await);

    assert_eq!(h.dead.len(), 1);
    assert_eq!(h.dead.letters()[0].attempts, 1);
    assert_eq!(pool.stats().retries, 0);

    let stored = h.storage.get(&good.id).await.unwrap().unwrap();
    assert_eq!(stored.enrichment_quality, Some(EnrichmentQuality::Full));
    assert!((stored.credibility_score.unwrap() - 0.8).abs() < 1e-6);
    assert!(h.storage.get(&poison.id).await.unwrap().is_none());
}

/// Fails the first write of every item, then delegates.
struct FlakyStore {
    inner: MemoryStorage,
    failures: AtomicUsize,
}

#[async_trait]
impl StorageAdapter for FlakyStore {
    async fn upsert(&self, item: &Item) -> Result<(), StorageError> {
        if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(StorageError::Transient("write conflict".into()));
        }
        self.inner.upsert(item).await
    }
    async fn get(&self, id: &str) -> Result<Option<Item>, StorageError> {
        self.inner.get(id).await
    }
    async fn query(&self, filter: &ItemFilter) -> Result<Vec<Item>, StorageError> {
        self.inner.query(filter).await
    }
    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete(id).await
    }
    async fn stats(&self) -> Result<StorageStats, StorageError> {
        self.inner.stats().await
    }
}

#[tokio::test(start_paused = true)]
async fn transient_storage_failure_is_retried() {
    let h = Harness::new(8);
    let store = Arc::new(FlakyStore {
        inner: MemoryStorage::new(),
        failures: AtomicUsize::new(0),
    });
    let pool = WorkerPool::start(
        WorkerConfig {
            workers: 1,
            ..WorkerConfig::default()
        },
        h.deps(Arc::new(Picky), store.clone(), RetryPolicy::default().without_jitter()),
    );
    let it = item("retry-me");
    h.queue.push(EnrichmentTask::new(it.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(store.inner.write_count(&it.id), 1);
    assert_eq!(pool.stats().retries, 1);
    assert!(h.dead.is_empty());
    pool.shutdown().await;
}

/// Blocks every call until permits are released.
struct Gated {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Enricher for Gated {
    async fn enrich(&self, _item: &Item) -> Result<EnrichedFields, EnrichError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| EnrichError::Transient(e.to_string()))?;
        Ok(EnrichedFields::default())
    }
}

/// One batch of `n` distinct items, then nothing.
struct Burst {
    source: Source,
    n: usize,
    fired: AtomicUsize,
}

#[async_trait]
impl Collector for Burst {
    fn source(&self) -> &Source {
        &self.source
    }
    async fn validate(&self) -> Result<Ready, SourceError> {
        Ok(Ready)
    }
    async fn collect(&self) -> Result<Vec<Item>, SourceError> {
        if self.fired.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(Vec::new());
        }
        Ok((0..self.n)
            .map(|i| {
                Item::new(
                    &self.source,
                    format!("burst-{i}"),
                    "",
                    Some(format!("https://example.com/burst/{i}")),
                )
            })
            .collect())
    }
}

#[tokio::test(start_paused = true)]
async fn full_queue_applies_backpressure_without_dropping() {
    let h = Harness::new(10);
    let gate = Arc::new(Semaphore::new(0));
    let pool = Arc::new(h.pool(5, Arc::new(Gated { gate: gate.clone() })));
    let orch = Orchestrator::new(
        OrchestratorConfig {
            push_max_wait: Duration::from_millis(100),
            ..OrchestratorConfig::default()
        },
        h.buffer.clone(),
        h.queue.clone(),
    )
    .with_workers(pool.clone());

    orch.add_collector(Arc::new(Burst {
        source: Source::new("burst", SourceKind::Feed, "mock://burst")
            .with_interval(Duration::from_secs(3600)),
        n: 20,
        fired: AtomicUsize::new(0),
    }))
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.queue.depth(), 10);
    assert_eq!(pool.stats().busy, 5);
    assert!(h.buffer.stats().backpressure_events >= 1);
    assert_eq!(h.storage.len(), 0);
    let status = orch.collector_status("burst").await.unwrap();
    assert!(status.in_flight);

    gate.add_permits(1_000);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.storage.len(), 20);
    assert_eq!(h.queue.max_depth(), 10);
    assert_eq!(pool.stats().processed, 20);

    let snap = orch.snapshot().await;
    assert_eq!(snap.queue_capacity, 10);
    assert_eq!(snap.workers.unwrap().processed, 20);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn simultaneous_single_item_sources_wait_for_room() {
    let h = Harness::new(10);
    let gate = Arc::new(Semaphore::new(0));
    let pool = Arc::new(h.pool(5, Arc::new(Gated { gate: gate.clone() })));

    // Five tasks keep every worker busy; ten more fill the queue.
    for n in 0..5 {
        h.queue.push(EnrichmentTask::new(item(&format!("busy-{n}")))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().busy, 5);
    for n in 0..10 {
        h.queue.push(EnrichmentTask::new(item(&format!("queued-{n}")))).await.unwrap();
    }
    assert!(h.queue.is_full());

    let orch = Orchestrator::new(
        OrchestratorConfig {
            push_max_wait: Duration::from_millis(100),
            ..OrchestratorConfig::default()
        },
        h.buffer.clone(),
        h.queue.clone(),
    )
    .with_workers(pool.clone());
    for n in 0..10 {
        orch.add_collector(Arc::new(Burst {
            source: Source::new(format!("desk-{n}"), SourceKind::Feed, format!("mock://desk-{n}"))
                .with_interval(Duration::from_secs(3600)),
            n: 1,
            fired: AtomicUsize::new(0),
        }))
        .await
        .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.buffer.stats().backpressure_events >= 1);
    assert_eq!(h.buffer.stats().items_new, 10);
    assert_eq!(h.storage.len(), 0);

    gate.add_permits(1_000);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.storage.len(), 25);
    assert_eq!(pool.stats().processed, 25);
    assert_eq!(h.queue.max_depth(), 10);
    assert!(h.dead.is_empty());
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_abandons_stuck_tasks() {
    let h = Harness::new(16);
    let gate = Arc::new(Semaphore::new(0));
    let pool = WorkerPool::start(
        WorkerConfig {
            workers: 2,
            enrich_timeout: Duration::from_secs(3600),
            drain_timeout: Duration::from_secs(2),
            ..WorkerConfig::default()
        },
        h.deps(Arc::new(Gated { gate }), h.storage.clone(), RetryPolicy::default()),
    );
    for n in 0..5 {
        h.queue.push(EnrichmentTask::new(item(&format!("stuck-{n}")))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().busy, 2);

    let started = Instant::now();
    assert!(!pool.shutdown().await);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));

    // Two in flight plus three never pulled.
    assert_eq!(pool.stats().abandoned, 5);
    assert_eq!(pool.stats().processed, 0);
    assert_eq!(h.storage.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_queued_tasks() {
    let h = Harness::new(32);
    let pool = h.pool(2, Arc::new(Picky));
    pool.pause();
    for n in 0..12 {
        h.queue.push(EnrichmentTask::new(item(&format!("q{n}")))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.storage.len(), 0);

    assert!(pool.shutdown().await);
    assert_eq!(h.storage.len(), 12);
    assert_eq!(h.queue.depth(), 0);
}

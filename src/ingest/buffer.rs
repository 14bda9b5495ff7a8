//! # Collection Buffer
//! Bounded in-memory record of recent collection runs, the live item set,
//! and running aggregate counters.
//!
//! Every mutation (dedup check + item append + run append + counter update)
//! happens under one mutex, so a reader never observes counters that
//! disagree with the records. The critical section is O(items in the run);
//! nothing scans historical data. Eviction is strict FIFO and happens on
//! every insertion regardless of whether the run succeeded. Counters are
//! never decremented by eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::ingest::dedup::DedupIndex;
use crate::model::{text_matches, CollectionRun, Item};

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Most recent collection runs kept.
    pub run_capacity: usize,
    /// Most recent live items kept.
    pub item_retention: usize,
    /// How long a dedup key stays live.
    pub dedup_window: Duration,
    /// Upper bound on live dedup keys.
    pub dedup_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            run_capacity: 100,
            item_retention: 1_000,
            dedup_window: Duration::from_secs(24 * 3600),
            dedup_capacity: 50_000,
        }
    }
}

/// Per-source running counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SourceCounters {
    pub runs: u64,
    pub failed_runs: u64,
    pub items_collected: u64,
    pub items_new: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Aggregate statistics. Monotonic: eviction never lowers any of these.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BufferStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub items_collected: u64,
    pub items_new: u64,
    pub duplicates_skipped: u64,
    pub runs_evicted: u64,
    pub items_evicted: u64,
    pub enriched: u64,
    pub degraded: u64,
    pub dead_lettered: u64,
    pub backpressure_events: u64,
    pub per_source: HashMap<String, SourceCounters>,
    pub per_sentiment: HashMap<String, u64>,
}

#[derive(Debug)]
struct Inner {
    runs: VecDeque<CollectionRun>,
    item_order: VecDeque<String>,
    items: HashMap<String, Arc<Item>>,
    dedup: DedupIndex,
    stats: BufferStats,
}

#[derive(Debug)]
pub struct CollectionBuffer {
    inner: Mutex<Inner>,
    cfg: BufferConfig,
}

impl CollectionBuffer {
    pub fn new(cfg: BufferConfig) -> Self {
        let cfg = BufferConfig {
            run_capacity: cfg.run_capacity.max(1),
            item_retention: cfg.item_retention.max(1),
            ..cfg
        };
        Self {
            inner: Mutex::new(Inner {
                runs: VecDeque::with_capacity(cfg.run_capacity.min(10_000)),
                item_order: VecDeque::new(),
                items: HashMap::new(),
                dedup: DedupIndex::new(cfg.dedup_window, cfg.dedup_capacity),
                stats: BufferStats::default(),
            }),
            cfg,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic elsewhere must not take the whole pipeline down with it.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Atomically dedup `items`, append the new ones to the live set, append
    /// `run` (with `items_new` filled in) and update the counters.
    ///
    /// Returns the stored run and the items that were not live yet, in
    /// collector order. Duplicates inside the same batch count once.
    pub fn record_run(
        &self,
        mut run: CollectionRun,
        items: Vec<Item>,
    ) -> (CollectionRun, Vec<Arc<Item>>) {
        let now = Instant::now();
        let mut g = self.lock();
        let inner = &mut *g;

        let collected = items.len();
        let mut fresh = Vec::with_capacity(collected);
        for item in items {
            // A key that aged out of the index but is still live is a
            // duplicate too; the insert refreshes its window.
            if !inner.dedup.insert(&item.id, now) || inner.items.contains_key(&item.id) {
                inner.stats.duplicates_skipped += 1;
                continue;
            }
            let item = Arc::new(item);
            inner.items.insert(item.id.clone(), item.clone());
            inner.item_order.push_back(item.id.clone());
            while inner.item_order.len() > self.cfg.item_retention {
                if let Some(old) = inner.item_order.pop_front() {
                    inner.items.remove(&old);
                    inner.stats.items_evicted += 1;
                }
            }
            fresh.push(item);
        }

        run.items_collected = collected;
        run.items_new = fresh.len();

        let s = &mut inner.stats;
        s.total_runs += 1;
        if run.success {
            s.successful_runs += 1;
        } else {
            s.failed_runs += 1;
        }
        s.items_collected += collected as u64;
        s.items_new += fresh.len() as u64;
        let per = s.per_source.entry(run.source_id.clone()).or_default();
        per.runs += 1;
        per.items_collected += collected as u64;
        per.items_new += fresh.len() as u64;
        per.last_run_at = Some(run.finished_at);
        if !run.success {
            per.failed_runs += 1;
            per.last_error = run.error.clone();
        }

        inner.runs.push_back(run.clone());
        while inner.runs.len() > self.cfg.run_capacity {
            inner.runs.pop_front();
            inner.stats.runs_evicted += 1;
        }

        (run, fresh)
    }

    /// Swap in the enriched version of an item (if still live) and count it.
    pub fn record_enriched(&self, item: Arc<Item>) {
        let mut g = self.lock();
        let inner = &mut *g;
        if let Some(slot) = inner.items.get_mut(&item.id) {
            *slot = item.clone();
        }
        inner.stats.enriched += 1;
        if item.is_degraded() {
            inner.stats.degraded += 1;
        }
        if let Some(s) = item.sentiment {
            *inner
                .stats
                .per_sentiment
                .entry(s.as_str().to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn record_dead_letter(&self) {
        self.lock().stats.dead_lettered += 1;
    }

    pub fn record_backpressure(&self) {
        self.lock().stats.backpressure_events += 1;
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats.clone()
    }

    pub fn source_counters(&self, source_id: &str) -> Option<SourceCounters> {
        self.lock().stats.per_source.get(source_id).cloned()
    }

    /// Held runs, oldest first.
    pub fn runs(&self) -> Vec<CollectionRun> {
        self.lock().runs.iter().cloned().collect()
    }

    /// Up to `limit` most recent runs, newest first, optionally for one source.
    pub fn recent_runs(&self, limit: usize, source_id: Option<&str>) -> Vec<CollectionRun> {
        let g = self.lock();
        g.runs
            .iter()
            .rev()
            .filter(|r| source_id.map_or(true, |s| r.source_id == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn live_len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn get_item(&self, id: &str) -> Option<Arc<Item>> {
        self.lock().items.get(id).cloned()
    }

    /// Live items, oldest first.
    pub fn live_items(&self) -> Vec<Arc<Item>> {
        let g = self.lock();
        g.item_order
            .iter()
            .filter_map(|id| g.items.get(id).cloned())
            .collect()
    }

    fn newest_matching<F>(&self, limit: usize, pred: F) -> Vec<Arc<Item>>
    where
        F: Fn(&Item) -> bool,
    {
        let g = self.lock();
        g.item_order
            .iter()
            .rev()
            .filter_map(|id| g.items.get(id))
            .filter(|it| pred(it))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent_items(&self, limit: usize) -> Vec<Arc<Item>> {
        self.newest_matching(limit, |_| true)
    }

    pub fn items_by_source(&self, source_id: &str, limit: usize) -> Vec<Arc<Item>> {
        self.newest_matching(limit, |it| it.source_id == source_id)
    }

    pub fn items_by_category(&self, category: &str, limit: usize) -> Vec<Arc<Item>> {
        self.newest_matching(limit, |it| it.category.as_deref() == Some(category))
    }

    pub fn search(&self, query: &str, limit: usize) -> Vec<Arc<Item>> {
        self.newest_matching(limit, |it| text_matches(it, query))
    }
}

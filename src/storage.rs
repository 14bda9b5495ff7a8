// src/storage.rs
//! Storage adapter boundary. The pipeline only ever calls this trait; the
//! persistent store behind it is somebody else's concern.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Item, ItemFilter};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Worth retrying (timeouts, lost connection).
    #[error("transient storage failure: {0}")]
    Transient(String),
    /// The store is down altogether.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The write can never succeed (schema/validation rejection).
    #[error("permanent storage failure: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, StorageError::Permanent(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Transient(_) => "transient",
            StorageError::Unavailable(_) => "unavailable",
            StorageError::Permanent(_) => "permanent",
        }
    }
}

/// Aggregates over stored items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub items: usize,
    pub by_source: BTreeMap<String, usize>,
    pub by_sentiment: BTreeMap<String, usize>,
    pub degraded: usize,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Insert or replace by `item.id`. Must be idempotent.
    async fn upsert(&self, item: &Item) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<Item>, StorageError>;

    /// Newest first (published-at, else collected-at), then `skip`/`limit`.
    /// `limit == 0` means no limit.
    async fn query(&self, filter: &ItemFilter) -> Result<Vec<Item>, StorageError>;

    /// Returns whether something was removed.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Apply ordering and paging to already-filtered items.
pub fn sort_and_page(mut items: Vec<Item>, filter: &ItemFilter) -> Vec<Item> {
    items.sort_by(|a, b| {
        let ta = a.published_at.unwrap_or(a.collected_at);
        let tb = b.published_at.unwrap_or(b.collected_at);
        tb.cmp(&ta).then_with(|| a.id.cmp(&b.id))
    });
    let it = items.into_iter().skip(filter.skip);
    if filter.limit == 0 {
        it.collect()
    } else {
        it.take(filter.limit).collect()
    }
}

#[derive(Debug, Default)]
struct MemInner {
    items: HashMap<String, Item>,
    writes: HashMap<String, u64>,
}

/// In-process store used by the binary's default wiring and by tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// How many times `id` was written.
    pub fn write_count(&self, id: &str) -> u64 {
        self.lock().writes.get(id).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> u64 {
        self.lock().writes.values().sum()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Item> {
        self.lock().items.values().cloned().collect()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn upsert(&self, item: &Item) -> Result<(), StorageError> {
        let mut g = self.lock();
        g.items.insert(item.id.clone(), item.clone());
        *g.writes.entry(item.id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Item>, StorageError> {
        Ok(self.lock().items.get(id).cloned())
    }

    async fn query(&self, filter: &ItemFilter) -> Result<Vec<Item>, StorageError> {
        let matched: Vec<Item> = self
            .lock()
            .items
            .values()
            .filter(|it| filter.matches(it))
            .cloned()
            .collect();
        Ok(sort_and_page(matched, filter))
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.lock().items.remove(id).is_some())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let g = self.lock();
        let mut out = StorageStats {
            items: g.items.len(),
            ..StorageStats::default()
        };
        for it in g.items.values() {
            *out.by_source.entry(it.source_id.clone()).or_insert(0) += 1;
            if let Some(s) = it.sentiment {
                *out.by_sentiment.entry(s.as_str().to_string()).or_insert(0) += 1;
            }
            if it.is_degraded() {
                out.degraded += 1;
            }
        }
        Ok(out)
    }
}

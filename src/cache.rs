// src/cache.rs
//! Read-through cache in front of the storage adapter.
//!
//! Keys are prefixed by what they hold (`item:`, `items:`, `search:`,
//! `stats:`, `runs:`); each prefix has its own default TTL. List and search
//! entries are tagged with the source they are scoped to, or with
//! [`ALL_SOURCES_TAG`] when they span sources. A write through
//! [`CachedStorage`] drops the item key plus every entry tagged with the
//! item's source or spanning all sources. Any cache failure degrades to a
//! direct storage call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::{Item, ItemFilter};
use crate::storage::{StorageAdapter, StorageError, StorageStats};

pub const ITEM_PREFIX: &str = "item";
pub const ITEMS_PREFIX: &str = "items";
pub const SEARCH_PREFIX: &str = "search";
pub const STATS_PREFIX: &str = "stats";
pub const RUNS_PREFIX: &str = "runs";

/// Keys longer than this are hashed.
pub const MAX_KEY_LEN: usize = 200;

/// Entry bound for [`MemoryCache::new`].
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Tag on entries that are not scoped to one source.
pub const ALL_SOURCES_TAG: &str = "source:*";

pub fn source_tag(source_id: &str) -> String {
    format!("source:{source_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache codec error: {0}")]
    Codec(String),
}

/// Default TTL for a key, by prefix.
pub fn default_ttl(key: &str) -> Duration {
    let prefix = key.split(':').next().unwrap_or_default();
    match prefix {
        ITEM_PREFIX => Duration::from_secs(3600),
        ITEMS_PREFIX => Duration::from_secs(300),
        SEARCH_PREFIX => Duration::from_secs(600),
        STATS_PREFIX => Duration::from_secs(180),
        RUNS_PREFIX => Duration::from_secs(600),
        _ => Duration::from_secs(600),
    }
}

/// `prefix:k1=v1:k2=v2` with params sorted by name; hashed past [`MAX_KEY_LEN`].
pub fn build_key(prefix: &str, params: &[(&str, String)]) -> String {
    let mut params: Vec<&(&str, String)> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    params.sort_by(|a, b| a.0.cmp(b.0));
    let mut key = prefix.to_string();
    for (k, v) in params {
        key.push(':');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    if key.len() > MAX_KEY_LEN {
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{prefix}:{hex}")
    } else {
        key
    }
}

pub fn item_key(id: &str) -> String {
    format!("{ITEM_PREFIX}:{id}")
}

/// List or search key for a storage filter.
pub fn filter_key(f: &ItemFilter) -> String {
    let prefix = if f.text.is_some() {
        SEARCH_PREFIX
    } else {
        ITEMS_PREFIX
    };
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    build_key(
        prefix,
        &[
            ("source", opt(&f.source_id)),
            ("category", opt(&f.category)),
            (
                "sentiment",
                f.sentiment.map(|s| s.as_str().to_string()).unwrap_or_default(),
            ),
            ("since", f.since.map(|t| t.timestamp().to_string()).unwrap_or_default()),
            ("until", f.until.map(|t| t.timestamp().to_string()).unwrap_or_default()),
            ("q", f.text.as_deref().map(str::to_lowercase).unwrap_or_default()),
            ("limit", f.limit.to_string()),
            ("skip", f.skip.to_string()),
        ],
    )
}

pub fn stats_key(scope: &str) -> String {
    format!("{STATS_PREFIX}:{scope}")
}

pub fn runs_key(source_id: Option<&str>, limit: usize) -> String {
    build_key(
        RUNS_PREFIX,
        &[
            ("source", source_id.unwrap_or_default().to_string()),
            ("limit", limit.to_string()),
        ],
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheInfo {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError>;
    /// `ttl: None` uses the prefix default.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    /// `prefix*` glob; returns how many keys went away.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;
    async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError>;
    async fn clear_all(&self) -> Result<usize, CacheError>;
    async fn info(&self) -> Result<CacheInfo, CacheError>;
}

pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!("cache_hits_total", "Cache lookups answered from cache");
        metrics::describe_counter!("cache_misses_total", "Cache lookups that went to storage");
        metrics::describe_counter!("cache_errors_total", "Cache operations that failed");
    });
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    ttl: Duration,
    tags: Arc<[String]>,
}

/// Per-entry TTL; an overwrite restarts the clock with the new entry's TTL.
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-local bounded TTL cache on moka.
pub struct MemoryCache {
    entries: MokaCache<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        ensure_metrics_described();
        let entries = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryTtl)
            .support_invalidation_closures()
            .build();
        Self {
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Invalidate every entry matching `pred`; returns how many were live.
    fn invalidate_where<F>(&self, pred: F) -> Result<usize, CacheError>
    where
        F: Fn(&str, &Entry) -> bool + Send + Sync + 'static,
    {
        let matched = self
            .entries
            .iter()
            .filter(|(k, e)| pred(k.as_str(), e))
            .count();
        if matched > 0 {
            self.entries
                .invalidate_entries_if(move |k, e| pred(k.as_str(), e))
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        }
        Ok(matched)
    }
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let hit = self.entries.get(key).await.map(|e| e.value);
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            ttl: ttl.unwrap_or_else(|| default_ttl(key)),
            tags: tags.into(),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = pattern.to_string();
        self.invalidate_where(move |k, _| pattern_matches(&pattern, k))
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let tag = tag.to_string();
        self.invalidate_where(move |_, e| e.tags.iter().any(|t| *t == tag))
    }

    async fn clear_all(&self) -> Result<usize, CacheError> {
        let live = self.entries.iter().count();
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        Ok(live)
    }

    async fn info(&self) -> Result<CacheInfo, CacheError> {
        self.entries.run_pending_tasks().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        Ok(CacheInfo {
            entries: self.entries.entry_count() as usize,
            hits,
            misses,
            errors: 0,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        })
    }
}

/// Storage adapter that reads through a cache and invalidates on write.
pub struct CachedStorage {
    inner: Arc<dyn StorageAdapter>,
    cache: Arc<dyn Cache>,
    errors: AtomicU64,
    /// Bumped after every storage write; read-through fills taken across a
    /// bump are not kept.
    generation: AtomicU64,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn StorageAdapter>, cache: Arc<dyn Cache>) -> Self {
        ensure_metrics_described();
        Self {
            inner,
            cache,
            errors: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub async fn info(&self) -> CacheInfo {
        let mut info = self.cache.info().await.unwrap_or_default();
        info.errors = self.errors.load(Ordering::Relaxed);
        info
    }

    fn cache_error(&self, op: &str, e: &CacheError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("cache_errors_total").increment(1);
        debug!(target: "cache", op, error = %e, "cache error; using storage");
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(v)) => match serde_json::from_value(v) {
                Ok(t) => {
                    counter!("cache_hits_total").increment(1);
                    Some(t)
                }
                Err(e) => {
                    self.cache_error("decode", &CacheError::Codec(e.to_string()));
                    None
                }
            },
            Ok(None) => {
                counter!("cache_misses_total").increment(1);
                None
            }
            Err(e) => {
                self.cache_error("get", &e);
                None
            }
        }
    }

    /// Fill `key` with a value read from storage at generation `read_gen`.
    /// Skipped if a write landed since; undone if one lands while storing.
    async fn store<T: Serialize>(&self, key: &str, value: &T, tags: &[String], read_gen: u64) {
        if self.generation() != read_gen {
            return;
        }
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => return self.cache_error("encode", &CacheError::Codec(e.to_string())),
        };
        if let Err(e) = self.cache.set(key, value, None, tags).await {
            return self.cache_error("set", &e);
        }
        if self.generation() != read_gen {
            debug!(target: "cache", key, "write raced a cache fill; dropping it");
            if let Err(e) = self.cache.delete(key).await {
                self.cache_error("delete", &e);
            }
        }
    }

    /// Drop the item's own key, the stats, and every list or search entry that
    /// could hold an item from `source_id`.
    pub async fn invalidate_item(&self, id: &str, source_id: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.cache.delete(&item_key(id)).await {
            self.cache_error("delete", &e);
        }
        for tag in [source_tag(source_id), ALL_SOURCES_TAG.to_string()] {
            if let Err(e) = self.cache.invalidate_tag(&tag).await {
                self.cache_error("invalidate_tag", &e);
            }
        }
    }
}

fn filter_tags(filter: &ItemFilter) -> Vec<String> {
    match &filter.source_id {
        Some(s) => vec![source_tag(s)],
        None => vec![ALL_SOURCES_TAG.to_string()],
    }
}

#[async_trait]
impl StorageAdapter for CachedStorage {
    async fn upsert(&self, item: &Item) -> Result<(), StorageError> {
        self.inner.upsert(item).await?;
        self.invalidate_item(&item.id, &item.source_id).await;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Item>, StorageError> {
        let key = item_key(id);
        if let Some(hit) = self.lookup::<Item>(&key).await {
            return Ok(Some(hit));
        }
        let read_gen = self.generation();
        let found = self.inner.get(id).await?;
        if let Some(item) = &found {
            self.store(&key, item, &[], read_gen).await;
        }
        Ok(found)
    }

    async fn query(&self, filter: &ItemFilter) -> Result<Vec<Item>, StorageError> {
        let key = filter_key(filter);
        if let Some(hit) = self.lookup::<Vec<Item>>(&key).await {
            return Ok(hit);
        }
        let read_gen = self.generation();
        let items = self.inner.query(filter).await?;
        self.store(&key, &items, &filter_tags(filter), read_gen).await;
        Ok(items)
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let source_id = self.inner.get(id).await?.map(|it| it.source_id);
        let removed = self.inner.delete(id).await?;
        if let Some(source_id) = source_id {
            self.invalidate_item(id, &source_id).await;
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let key = stats_key("storage");
        if let Some(hit) = self.lookup::<StorageStats>(&key).await {
            return Ok(hit);
        }
        let read_gen = self.generation();
        let stats = self.inner.stats().await?;
        self.store(&key, &stats, &[ALL_SOURCES_TAG.to_string()], read_gen).await;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Source, SourceKind};
    use crate::storage::MemoryStorage;

    #[test]
    fn keys_are_sorted_and_long_keys_hashed() {
        let k = build_key("items", &[("z", "1".into()), ("a", "2".into()), ("e", String::new())]);
        assert_eq!(k, "items:a=2:z=1");

        let long = build_key("search", &[("q", "x".repeat(300))]);
        assert!(long.starts_with("search:"));
        assert_eq!(long.len(), "search:".len() + 64);
        assert_eq!(long, build_key("search", &[("q", "x".repeat(300))]));
    }

    #[test]
    fn ttl_by_prefix() {
        assert_eq!(default_ttl("item:abc"), Duration::from_secs(3600));
        assert_eq!(default_ttl("items:limit=5"), Duration::from_secs(300));
        assert_eq!(default_ttl("stats:storage"), Duration::from_secs(180));
        assert_eq!(default_ttl(&runs_key(Some("feed-A"), 20)), Duration::from_secs(600));
        assert_eq!(runs_key(Some("feed-A"), 20), "runs:limit=20:source=feed-A");
    }

    #[tokio::test]
    async fn entries_expire_and_patterns_match() {
        let c = MemoryCache::new();
        c.set("items:a", serde_json::json!(1), None, &[]).await.unwrap();
        c.set("items:b", serde_json::json!(2), None, &["t".into()]).await.unwrap();
        c.set("item:x", serde_json::json!(3), Some(Duration::from_millis(100)), &[])
            .await
            .unwrap();

        assert_eq!(c.invalidate_tag("t").await.unwrap(), 1);
        assert!(c.get("items:b").await.unwrap().is_none());
        assert_eq!(c.delete_pattern("items:*").await.unwrap(), 1);
        assert!(c.get("items:a").await.unwrap().is_none());
        assert!(c.get("item:x").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(c.get("item:x").await.unwrap().is_none());
        let info = c.info().await.unwrap();
        assert_eq!((info.hits, info.misses), (1, 3));
    }

    #[tokio::test]
    async fn overwrite_takes_the_new_ttl() {
        let c = MemoryCache::new();
        c.set("stats:x", serde_json::json!(1), Some(Duration::from_millis(100)), &[])
            .await
            .unwrap();
        c.set("stats:x", serde_json::json!(2), Some(Duration::from_secs(60)), &[])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(c.get("stats:x").await.unwrap(), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn write_invalidates_cached_lists() {
        let store = CachedStorage::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryCache::new()));
        let src = Source::new("s", SourceKind::Feed, "https://ex/rss");
        let filter = ItemFilter::recent(10);

        store.upsert(&Item::new(&src, "one", "", None)).await.unwrap();
        assert_eq!(store.query(&filter).await.unwrap().len(), 1);
        assert_eq!(store.query(&filter).await.unwrap().len(), 1);
        assert_eq!(store.info().await.hits, 1);

        store.upsert(&Item::new(&src, "two", "", None)).await.unwrap();
        assert_eq!(store.query(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn write_keeps_lists_scoped_to_other_sources() {
        let cache = Arc::new(MemoryCache::new());
        let store = CachedStorage::new(Arc::new(MemoryStorage::new()), cache.clone());
        let a = Source::new("a", SourceKind::Feed, "https://ex/a");
        let b = Source::new("b", SourceKind::Feed, "https://ex/b");
        let only = |s: &str| ItemFilter {
            source_id: Some(s.to_string()),
            ..ItemFilter::recent(10)
        };

        store.upsert(&Item::new(&a, "a1", "", None)).await.unwrap();
        store.upsert(&Item::new(&b, "b1", "", None)).await.unwrap();
        store.query(&only("a")).await.unwrap();
        store.query(&only("b")).await.unwrap();
        store.query(&ItemFilter::recent(10)).await.unwrap();

        store.upsert(&Item::new(&a, "a2", "", None)).await.unwrap();
        assert!(cache.get(&filter_key(&only("a"))).await.unwrap().is_none());
        assert!(cache.get(&filter_key(&ItemFilter::recent(10))).await.unwrap().is_none());
        assert!(cache.get(&filter_key(&only("b"))).await.unwrap().is_some());
        assert_eq!(store.query(&only("a")).await.unwrap().len(), 2);
    }
}

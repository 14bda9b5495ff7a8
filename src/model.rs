//! Data contracts shared by collectors, the orchestrator, workers and storage.
//!
//! Nothing in here performs I/O. Items are handed around as `Arc<Item>`; a
//! worker that enriches an item builds a new value with [`Item::with_enrichment`]
//! instead of mutating an instance other tasks may still hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of external origin. One collector implementation exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Feed,
    RestApi,
    Social,
    Scrape,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::RestApi => "rest-api",
            SourceKind::Social => "social",
            SourceKind::Scrape => "scrape",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured external origin of items.
///
/// Identity, kind and endpoint never change after creation. Only `active`
/// and `interval` are updated, and only through a configuration reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub max_items: usize,
    pub active: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority_hint: Option<f32>,
    /// Environment variable holding the source's API key, if it needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Source {
    pub fn new(id: impl Into<String>, kind: SourceKind, endpoint: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            endpoint: endpoint.into(),
            interval: Duration::from_secs(300),
            max_items: 100,
            active: true,
            category: None,
            priority_hint: None,
            api_key_env: None,
        }
    }

    /// Resolve the API key from the environment, if one is configured and set.
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// True when a reload only touches the mutable fields (interval / active).
    pub fn same_identity(&self, other: &Source) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.endpoint == other.endpoint
            && self.name == other.name
            && self.max_items == other.max_items
            && self.category == other.category
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
            Sentiment::Mixed => "mixed",
        }
    }

    /// Map a free-form label (e.g. a model answer) to a class; unknown → neutral.
    pub fn from_label(label: &str) -> Self {
        match label.trim().trim_end_matches('.').to_ascii_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "negative" => Sentiment::Negative,
            "mixed" => Sentiment::Mixed,
            _ => Sentiment::Neutral,
        }
    }

    /// Polarity in [-1, 1] → class, with a ±0.1 neutral band.
    pub fn from_polarity(score: f32) -> Self {
        if score > 0.1 {
            Sentiment::Positive
        } else if score < -0.1 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentQuality {
    Full,
    Degraded,
}

/// Fields computed by an enricher. Everything is optional so that a partial
/// (degraded) result is representable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnrichedFields {
    pub sentiment: Option<Sentiment>,
    pub sentiment_score: Option<f32>,
    pub bias_score: Option<f32>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
}

/// A single collected content unit, pre- or post-enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Content-derived dedup key (see `ingest::dedup_key`).
    pub id: String,
    pub source_id: String,
    pub collector_kind: SourceKind,
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Raw payload as received (one entry / record), kept for replay.
    #[serde(default)]
    pub raw: serde_json::Value,
    pub collected_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority_hint: Option<f32>,

    // --- enrichment (None until processed) ---
    pub sentiment: Option<Sentiment>,
    pub sentiment_score: Option<f32>,
    pub bias_score: Option<f32>,
    pub credibility_score: Option<f32>,
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub enrichment_quality: Option<EnrichmentQuality>,
}

fn default_language() -> String {
    "en".to_string()
}

impl Item {
    /// Build an un-enriched item. The id is derived from source + title + link.
    pub fn new(
        source: &Source,
        title: impl Into<String>,
        content: impl Into<String>,
        url: Option<String>,
    ) -> Self {
        let title = title.into();
        let id = crate::ingest::dedup_key(&source.id, &title, url.as_deref());
        Self {
            id,
            source_id: source.id.clone(),
            collector_kind: source.kind,
            title,
            content: content.into(),
            url,
            category: source.category.clone(),
            authors: Vec::new(),
            language: default_language(),
            raw: serde_json::Value::Null,
            collected_at: Utc::now(),
            published_at: None,
            priority_hint: source.priority_hint,
            sentiment: None,
            sentiment_score: None,
            bias_score: None,
            credibility_score: None,
            summary: None,
            tags: Vec::new(),
            enrichment_quality: None,
        }
    }

    pub fn with_published_at(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.published_at = ts;
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_authors(mut self, authors: Vec<String>) -> Self {
        self.authors = authors;
        self
    }

    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    pub fn is_enriched(&self) -> bool {
        self.enrichment_quality.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.enrichment_quality == Some(EnrichmentQuality::Degraded)
    }

    /// Copy-on-write enrichment: returns a new item carrying `fields`.
    /// Collector-supplied tags are kept when the enricher produced none.
    pub fn with_enrichment(&self, fields: EnrichedFields, quality: EnrichmentQuality) -> Item {
        let mut out = self.clone();
        out.sentiment = fields.sentiment;
        out.sentiment_score = fields.sentiment_score;
        out.bias_score = fields.bias_score.map(|b| b.clamp(0.0, 1.0));
        out.credibility_score = out.bias_score.map(|b| 1.0 - b);
        out.summary = fields.summary;
        if !fields.tags.is_empty() {
            out.tags = fields.tags;
        }
        out.enrichment_quality = Some(quality);
        out
    }
}

/// Outcome of one collector invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items returned by the collector (before dedup).
    pub items_collected: usize,
    /// Items that passed dedup and were handed to the enrichment queue.
    pub items_new: usize,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl CollectionRun {
    pub fn succeeded(
        source_id: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        items_collected: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            items_collected,
            items_new: 0,
            success: true,
            error: None,
            duration,
        }
    }

    pub fn failed(
        source_id: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            items_collected: 0,
            items_new: 0,
            success: false,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Query filter understood by the storage adapter (and used to build cache keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFilter {
    pub source_id: Option<String>,
    pub category: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub limit: usize,
    pub skip: usize,
}

impl ItemFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn for_source(source_id: impl Into<String>, limit: usize) -> Self {
        Self {
            source_id: Some(source_id.into()),
            limit,
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        if let Some(s) = &self.source_id {
            if &item.source_id != s {
                return false;
            }
        }
        if let Some(c) = &self.category {
            if item.category.as_deref() != Some(c.as_str()) {
                return false;
            }
        }
        if let Some(s) = self.sentiment {
            if item.sentiment != Some(s) {
                return false;
            }
        }
        let ts = item.published_at.unwrap_or(item.collected_at);
        if let Some(since) = self.since {
            if ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ts > until {
                return false;
            }
        }
        if let Some(q) = &self.text {
            if !text_matches(item, q) {
                return false;
            }
        }
        true
    }
}

/// Case-insensitive match across title, content and tags.
pub fn text_matches(item: &Item, query: &str) -> bool {
    let q = query.to_lowercase();
    item.title.to_lowercase().contains(&q)
        || item.content.to_lowercase().contains(&q)
        || item.tags.iter().any(|t| t.to_lowercase().contains(&q))
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

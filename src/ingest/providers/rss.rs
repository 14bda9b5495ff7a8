// src/ingest/providers/rss.rs
use std::sync::Mutex;

use async_trait::async_trait;
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;

use super::http::HttpFetcher;
use crate::ingest::types::{Collector, Ready, SourceError};
use crate::ingest::{normalize_text, parse_published_at, truncate_chars};
use crate::model::{Item, Source};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<String>,
}

/// RSS 2.0 feed collector.
pub struct RssCollector {
    source: Source,
    mode: Mode,
    /// Body fetched by `validate`, consumed by the next `collect`.
    validated_body: Mutex<Option<String>>,
}

enum Mode {
    Http(HttpFetcher),
    // Owned copy so tests don't need 'static fixtures.
    Fixture(String),
}

impl RssCollector {
    pub fn new(source: Source, fetcher: HttpFetcher) -> Self {
        Self {
            source,
            mode: Mode::Http(fetcher),
            validated_body: Mutex::new(None),
        }
    }

    pub fn from_fixture(source: Source, xml: &str) -> Self {
        Self {
            source,
            mode: Mode::Fixture(xml.to_string()),
            validated_body: Mutex::new(None),
        }
    }

    async fn body(&self) -> Result<String, SourceError> {
        match &self.mode {
            Mode::Http(fetcher) => fetcher.get_text(&self.source.endpoint).await,
            Mode::Fixture(s) => Ok(s.clone()),
        }
    }

    fn validated_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.validated_body.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn parse_items(&self, xml: &str) -> Result<Vec<Item>, SourceError> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).map_err(|e| SourceError::malformed(format!("rss: {e}")))?;

        let mut out = Vec::with_capacity(rss.channel.item.len().min(self.source.max_items));
        for it in rss.channel.item {
            if out.len() >= self.source.max_items {
                break;
            }
            let title = normalize_text(it.title.as_deref().unwrap_or_default());
            if title.is_empty() {
                continue;
            }
            let content = truncate_chars(
                &normalize_text(it.description.as_deref().unwrap_or_default()),
                5_000,
            );
            let published_at = it
                .pub_date
                .as_deref()
                .and_then(|d| parse_published_at(d, &self.source.id));

            let raw = serde_json::json!({
                "title": it.title,
                "link": it.link,
                "pubDate": it.pub_date,
                "description": it.description,
            });
            let tags = it
                .categories
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let authors = it.author.map(|a| vec![a]).unwrap_or_default();

            out.push(
                Item::new(&self.source, title, content, it.link.map(|l| l.trim().to_string()))
                    .with_published_at(published_at)
                    .with_tags(tags)
                    .with_authors(authors)
                    .with_raw(raw),
            );
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        Ok(out)
    }
}

#[async_trait]
impl Collector for RssCollector {
    fn source(&self) -> &Source {
        &self.source
    }

    async fn validate(&self) -> Result<Ready, SourceError> {
        let body = self.body().await?;
        // A reachable endpoint that isn't a feed is a configuration problem.
        from_str::<Rss>(&scrub_html_entities_for_xml(&body))
            .map_err(|e| SourceError::Permanent(format!("endpoint is not an rss feed: {e}")))?;
        *self.validated_slot() = Some(body);
        Ok(Ready)
    }

    async fn collect(&self) -> Result<Vec<Item>, SourceError> {
        let prefetched = self.validated_slot().take();
        let body = match prefetched {
            Some(body) => body,
            None => self.body().await?,
        };
        self.parse_items(&body)
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
<item><title>Fed holds rates&nbsp;steady</title><link>https://ex.com/a</link>
<pubDate>Tue, 02 Sep 2025 14:00:00 +0200</pubDate><description>&lt;p&gt;Markets calm.&lt;/p&gt;</description>
<category>economy</category></item>
<item><title></title><link>https://ex.com/empty</link></item>
<item><title>Second</title><link>https://ex.com/b</link></item>
</channel></rss>"#;

    fn source(max: usize) -> Source {
        Source::new("feed-A", SourceKind::Feed, "https://ex.com/rss").with_max_items(max)
    }

    #[tokio::test]
    async fn parses_items_and_skips_untitled() {
        let c = RssCollector::from_fixture(source(10), FEED);
        let items = c.collect().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Fed holds rates steady");
        assert_eq!(items[0].content, "Markets calm");
        assert_eq!(items[0].tags, vec!["economy".to_string()]);
        assert_eq!(
            items[0].published_at.unwrap().to_rfc3339(),
            "2025-09-02T12:00:00+00:00"
        );
        assert!(items[1].published_at.is_none());
    }

    #[tokio::test]
    async fn respects_max_items() {
        let c = RssCollector::from_fixture(source(1), FEED);
        assert_eq!(c.collect().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_channel_is_success() {
        let xml = r#"<rss><channel><title>x</title></channel></rss>"#;
        let c = RssCollector::from_fixture(source(10), xml);
        assert!(c.collect().await.unwrap().is_empty());
        assert_eq!(c.validate().await.unwrap(), Ready);
    }

    #[tokio::test]
    async fn garbage_is_malformed_and_invalid() {
        let c = RssCollector::from_fixture(source(10), "<html>nope");
        assert!(matches!(c.collect().await, Err(SourceError::Transient(_))));
        assert!(matches!(c.validate().await, Err(SourceError::Permanent(_))));
    }

    #[tokio::test]
    async fn first_collect_reuses_the_validated_body() {
        let c = RssCollector::from_fixture(source(10), FEED);
        c.validate().await.unwrap();
        assert!(c.validated_slot().is_some());

        assert_eq!(c.collect().await.unwrap().len(), 2);
        assert!(c.validated_slot().is_none());
        // Later runs fetch again.
        assert_eq!(c.collect().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_validation_keeps_nothing() {
        let c = RssCollector::from_fixture(source(10), "<html>nope");
        assert!(c.validate().await.is_err());
        assert!(c.validated_slot().is_none());
    }
}

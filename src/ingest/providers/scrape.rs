// src/ingest/providers/scrape.rs
//! Scrape collector: pulls headline links out of an HTML index page.
//! Anchors whose visible text is long enough to be a headline become items.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashSet;

use super::http::HttpFetcher;
use crate::ingest::normalize_text;
use crate::ingest::types::{Collector, Ready, SourceError};
use crate::model::{Item, Source};

const MIN_HEADLINE_CHARS: usize = 25;

pub struct ScrapeCollector {
    source: Source,
    mode: Mode,
}

enum Mode {
    Http(HttpFetcher),
    Fixture(String),
}

impl ScrapeCollector {
    pub fn new(source: Source, fetcher: HttpFetcher) -> Self {
        Self {
            source,
            mode: Mode::Http(fetcher),
        }
    }

    pub fn from_fixture(source: Source, html: &str) -> Self {
        Self {
            source,
            mode: Mode::Fixture(html.to_string()),
        }
    }

    async fn page(&self) -> Result<String, SourceError> {
        match &self.mode {
            Mode::Http(fetcher) => fetcher.get_text(&self.source.endpoint).await,
            Mode::Fixture(s) => Ok(s.clone()),
        }
    }

    fn extract(&self, html: &str) -> Vec<Item> {
        static RE_ANCHOR: OnceCell<Regex> = OnceCell::new();
        let re = RE_ANCHOR.get_or_init(|| {
            Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"'#]+)["'][^>]*>(.*?)</a>"#).unwrap()
        });
        let base = reqwest::Url::parse(&self.source.endpoint).ok();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for caps in re.captures_iter(html) {
            if out.len() >= self.source.max_items {
                break;
            }
            let href = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let text = normalize_text(caps.get(2).map(|m| m.as_str()).unwrap_or_default());
            if text.chars().count() < MIN_HEADLINE_CHARS || href.starts_with("javascript:") {
                continue;
            }
            let url = match &base {
                Some(b) => match b.join(href) {
                    Ok(u) => u.to_string(),
                    Err(_) => continue,
                },
                None => href.to_string(),
            };
            if !seen.insert(url.clone()) {
                continue;
            }
            let raw = serde_json::json!({ "href": href, "text": text });
            out.push(Item::new(&self.source, text.clone(), text, Some(url)).with_raw(raw));
        }
        out
    }
}

#[async_trait]
impl Collector for ScrapeCollector {
    fn source(&self) -> &Source {
        &self.source
    }

    async fn validate(&self) -> Result<Ready, SourceError> {
        let page = self.page().await?;
        if page.trim().is_empty() {
            return Err(SourceError::malformed("empty page"));
        }
        Ok(Ready)
    }

    async fn collect(&self) -> Result<Vec<Item>, SourceError> {
        let page = self.page().await?;
        Ok(self.extract(&page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;

    #[tokio::test]
    async fn extracts_headline_links_once() {
        let html = r#"<html><body>
            <a href="/world/storm-2025">Storm makes landfall on the northern coast</a>
            <a href="/world/storm-2025">Storm makes landfall on the northern coast</a>
            <a href="/about">About</a>
            <a href="https://other.site/x"><span>Central bank signals a pause in hikes</span></a>
        </body></html>"#;
        let src = Source::new("site", SourceKind::Scrape, "https://news.example.com/index.html");
        let items = ScrapeCollector::from_fixture(src, html).collect().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].url.as_deref(),
            Some("https://news.example.com/world/storm-2025")
        );
        assert_eq!(items[1].title, "Central bank signals a pause in hikes");
    }
}

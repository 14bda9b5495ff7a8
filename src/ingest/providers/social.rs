// src/ingest/providers/social.rs
//! Social listing collector (Reddit-style JSON listings:
//! `{"data":{"children":[{"data":{...}}]}}`).

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use super::http::HttpFetcher;
use crate::ingest::types::{Collector, Ready, SourceError};
use crate::ingest::{normalize_text, truncate_chars};
use crate::model::{Item, Source};

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    title: Option<String>,
    #[serde(default)]
    selftext: String,
    url: Option<String>,
    permalink: Option<String>,
    created_utc: Option<f64>,
    author: Option<String>,
    subreddit: Option<String>,
    #[serde(default)]
    stickied: bool,
}

pub struct SocialCollector {
    source: Source,
    mode: Mode,
}

enum Mode {
    Http(HttpFetcher),
    Fixture(String),
}

impl SocialCollector {
    pub fn new(source: Source, fetcher: HttpFetcher) -> Self {
        Self {
            source,
            mode: Mode::Http(fetcher),
        }
    }

    pub fn from_fixture(source: Source, json: &str) -> Self {
        Self {
            source,
            mode: Mode::Fixture(json.to_string()),
        }
    }

    async fn listing(&self) -> Result<Listing, SourceError> {
        let body = match &self.mode {
            Mode::Http(fetcher) => fetcher.get_text(&self.source.endpoint).await?,
            Mode::Fixture(s) => s.clone(),
        };
        serde_json::from_str(&body).map_err(|e| SourceError::malformed(format!("listing: {e}")))
    }

    fn permalink_url(&self, post: &Post) -> Option<String> {
        let p = post.permalink.as_deref()?;
        if p.starts_with("http") {
            return Some(p.to_string());
        }
        let base = reqwest::Url::parse(&self.source.endpoint).ok()?;
        base.join(p).ok().map(|u| u.to_string())
    }
}

#[async_trait]
impl Collector for SocialCollector {
    fn source(&self) -> &Source {
        &self.source
    }

    async fn validate(&self) -> Result<Ready, SourceError> {
        self.listing().await.map(|_| Ready)
    }

    async fn collect(&self) -> Result<Vec<Item>, SourceError> {
        let listing = self.listing().await?;
        let mut out = Vec::new();
        for child in listing.data.children {
            if out.len() >= self.source.max_items {
                break;
            }
            let post = child.data;
            if post.stickied {
                continue;
            }
            let title = normalize_text(post.title.as_deref().unwrap_or_default());
            if title.is_empty() {
                continue;
            }
            // Permalinks are stable; external urls may be shared by many posts.
            let link = self.permalink_url(&post).or_else(|| post.url.clone());
            let published_at = post
                .created_utc
                .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single());
            let raw = serde_json::json!({
                "title": post.title,
                "url": post.url,
                "permalink": post.permalink,
                "created_utc": post.created_utc,
                "subreddit": post.subreddit,
            });
            let content = truncate_chars(&normalize_text(&post.selftext), 5_000);
            out.push(
                Item::new(&self.source, title, content, link)
                    .with_published_at(published_at)
                    .with_authors(post.author.into_iter().collect())
                    .with_tags(post.subreddit.into_iter().collect())
                    .with_raw(raw),
            );
        }
        Ok(out)
    }
}

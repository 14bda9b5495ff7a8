// src/ingest/providers/rest_api.rs
//! JSON article API collector (NewsAPI-style payloads):
//! `{"status":"ok","articles":[{"title","description","content","url","publishedAt","author"}]}`.

use async_trait::async_trait;
use serde::Deserialize;

use super::http::HttpFetcher;
use crate::ingest::types::{Collector, Ready, SourceError};
use crate::ingest::{normalize_text, parse_published_at, truncate_chars};
use crate::model::{Item, Source};

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiArticle {
    title: Option<String>,
    description: Option<String>,
    content: Option<String>,
    url: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
    author: Option<String>,
}

pub struct RestApiCollector {
    source: Source,
    mode: Mode,
}

enum Mode {
    Http(HttpFetcher),
    Fixture(String),
}

impl RestApiCollector {
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

    async fn body(&self) -> Result<String, SourceError> {
        match &self.mode {
            Mode::Http(fetcher) => fetcher.get_text(&self.source.endpoint).await,
            Mode::Fixture(s) => Ok(s.clone()),
        }
    }

    fn decode(&self, body: &str) -> Result<ApiResponse, SourceError> {
        let resp: ApiResponse = serde_json::from_str(body)
            .map_err(|e| SourceError::malformed(format!("json: {e}")))?;
        if resp.status.as_deref() == Some("error") {
            let code = resp.code.clone().unwrap_or_default();
            let msg = resp.message.clone().unwrap_or_else(|| "unknown error".into());
            // Key/parameter problems won't fix themselves; anything else might.
            return Err(match code.as_str() {
                "apiKeyInvalid" | "apiKeyMissing" | "apiKeyDisabled" | "parameterInvalid"
                | "parametersMissing" | "sourceDoesNotExist" => {
                    SourceError::Permanent(format!("{code}: {msg}"))
                }
                "rateLimited" => SourceError::RateLimited { retry_after: None },
                _ => SourceError::Transient(format!("{code}: {msg}")),
            });
        }
        Ok(resp)
    }

    fn to_items(&self, resp: ApiResponse) -> Vec<Item> {
        let mut out = Vec::new();
        for raw in resp.articles {
            if out.len() >= self.source.max_items {
                break;
            }
            let Ok(a) = serde_json::from_value::<ApiArticle>(raw.clone()) else {
                tracing::debug!(target: "ingest", source = %self.source.id, "skipping undecodable article");
                continue;
            };
            let title = normalize_text(a.title.as_deref().unwrap_or_default());
            if title.is_empty() || title == "[Removed]" {
                continue;
            }
            let body = a
                .content
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .or(a.description.as_deref())
                .unwrap_or_default();
            let content = truncate_chars(&normalize_text(body), 5_000);
            let published_at = a
                .published_at
                .as_deref()
                .and_then(|d| parse_published_at(d, &self.source.id));
            out.push(
                Item::new(&self.source, title, content, a.url)
                    .with_published_at(published_at)
                    .with_authors(a.author.into_iter().collect())
                    .with_raw(raw),
            );
        }
        out
    }
}

#[async_trait]
impl Collector for RestApiCollector {
    fn source(&self) -> &Source {
        &self.source
    }

    async fn validate(&self) -> Result<Ready, SourceError> {
        let body = self.body().await?;
        self.decode(&body).map(|_| Ready)
    }

    async fn collect(&self) -> Result<Vec<Item>, SourceError> {
        let body = self.body().await?;
        let resp = self.decode(&body)?;
        Ok(self.to_items(resp))
    }
}

// src/enrich/ai.rs
//! Remote enrichment through an OpenAI-compatible chat-completions endpoint.
//!
//! Failures are classified for the worker:
//! - no API key, connection refused, 401/403, 503 → `Unavailable` (local fallback)
//! - timeouts, 429, other 5xx, unparsable answers → `Transient` (retry)
//! - 400/413/422 → `Permanent` (the item itself is rejected)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::lexicon::{self, LocalEnricher};
use super::{EnrichError, Enricher};
use crate::ingest::truncate_chars;
use crate::model::{EnrichedFields, Item, Sentiment};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const MAX_INPUT_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub enabled: bool,
    pub model: String,
    /// Literal key, or `"ENV"` to read `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            model: DEFAULT_MODEL.to_string(),
            api_key: Some("ENV".to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_ms: 20_000,
        }
    }
}

impl AiSettings {
    /// Resolve the key (`"ENV"` → `OPENAI_API_KEY`). Empty keys count as missing.
    pub fn resolved_api_key(&self) -> Option<String> {
        let key = match self.api_key.as_deref() {
            Some("ENV") | None => std::env::var("OPENAI_API_KEY").ok(),
            Some(k) => Some(k.to_string()),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

/// Pick the primary enricher for the pipeline.
///
/// Disabled AI means local enrichment is the primary path (full quality).
/// Enabled AI without a key yields an always-unavailable enricher, so every
/// item goes through the degraded fallback and is counted as such.
pub fn build_enricher(settings: &AiSettings) -> Arc<dyn Enricher> {
    if !settings.enabled {
        info!(target: "enrich", "AI enrichment disabled; using local lexicon enricher");
        return Arc::new(LocalEnricher::full());
    }
    match settings.resolved_api_key() {
        Some(key) => match OpenAiEnricher::new(settings, key) {
            Ok(e) => Arc::new(e),
            Err(err) => {
                warn!(target: "enrich", error = %err, "AI client init failed");
                Arc::new(DisabledEnricher::new(err.to_string()))
            }
        },
        None => {
            warn!(target: "enrich", "AI enabled but OPENAI_API_KEY is missing");
            Arc::new(DisabledEnricher::new("missing api key"))
        }
    }
}

/// Always reports the capability as unavailable.
#[derive(Debug, Clone)]
pub struct DisabledEnricher {
    reason: String,
}

impl DisabledEnricher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Enricher for DisabledEnricher {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn enrich(&self, _item: &Item) -> Result<EnrichedFields, EnrichError> {
        Err(EnrichError::Unavailable(self.reason.clone()))
    }
}

pub struct OpenAiEnricher {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiEnricher {
    pub fn new(settings: &AiSettings, api_key: String) -> Result<Self, EnrichError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("news-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_millis(settings.timeout_ms.max(1)))
            .build()
            .map_err(|e| EnrichError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_key,
            model: settings.model.clone(),
            url: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

/// The JSON object the model is asked to return.
#[derive(Debug, Deserialize)]
struct Answer {
    sentiment: String,
    #[serde(default)]
    sentiment_score: Option<f32>,
    #[serde(default)]
    bias_score: Option<f32>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

const SYSTEM_PROMPT: &str = "You analyze news articles. Answer with ONE JSON object only: \
{\"sentiment\": \"positive|negative|neutral|mixed\", \"sentiment_score\": -1..1, \
\"bias_score\": 0..1 (0 = unbiased), \"summary\": \"at most 3 sentences\", \
\"tags\": [up to 5 lowercase keywords]}";

#[async_trait]
impl Enricher for OpenAiEnricher {
    fn name(&self) -> &str {
        "openai"
    }

    async fn enrich(&self, item: &Item) -> Result<EnrichedFields, EnrichError> {
        let input = format!(
            "Title: {}\n\n{}",
            item.title,
            truncate_chars(&item.content, MAX_INPUT_CHARS)
        );
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &input,
                },
            ],
            temperature: 0.0,
            max_tokens: 400,
        };

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(classify_reqwest)?;

        if let Some(err) = classify_status(resp.status().as_u16()) {
            return Err(err);
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| EnrichError::Transient(format!("response body: {e}")))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        parse_answer(content, item)
    }
}

fn classify_reqwest(e: reqwest::Error) -> EnrichError {
    if e.is_timeout() {
        EnrichError::Transient(format!("timeout: {e}"))
    } else if e.is_connect() {
        EnrichError::Unavailable(format!("connect: {e}"))
    } else {
        EnrichError::Transient(e.to_string())
    }
}

/// Map a non-success HTTP status to an enrichment error.
pub fn classify_status(status: u16) -> Option<EnrichError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(EnrichError::Unavailable(format!("auth rejected ({status})"))),
        503 => Some(EnrichError::Unavailable("service unavailable (503)".into())),
        408 | 429 => Some(EnrichError::Transient(format!("http {status}"))),
        400 | 413 | 422 => Some(EnrichError::Permanent(format!("input rejected ({status})"))),
        500..=599 => Some(EnrichError::Transient(format!("http {status}"))),
        _ => Some(EnrichError::Transient(format!("unexpected http {status}"))),
    }
}

/// Parse the model's answer. Code fences are tolerated; missing tags fall
/// back to local keywords.
fn parse_answer(content: &str, item: &Item) -> Result<EnrichedFields, EnrichError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let ans: Answer = serde_json::from_str(trimmed)
        .map_err(|e| EnrichError::Transient(format!("unparsable answer: {e}")))?;

    let tags: Vec<String> = ans
        .tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .take(lexicon::MAX_TAGS)
        .collect();
    let tags = if tags.is_empty() && item.tags.is_empty() {
        lexicon::keywords(&format!("{} {}", item.title, item.content), lexicon::MAX_TAGS)
    } else {
        tags
    };

    Ok(EnrichedFields {
        sentiment: Some(Sentiment::from_label(&ans.sentiment)),
        sentiment_score: ans.sentiment_score.map(|s| s.clamp(-1.0, 1.0)),
        bias_score: Some(ans.bias_score.unwrap_or(lexicon::NEUTRAL_BIAS)),
        summary: ans.summary.filter(|s| !s.trim().is_empty()),
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Source, SourceKind};
    use serial_test::serial;

    fn item() -> Item {
        let src = Source::new("s", SourceKind::Feed, "https://ex/rss");
        Item::new(&src, "Rates held", "The central bank held rates steady.", None)
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(204), None);
        assert!(matches!(classify_status(401), Some(EnrichError::Unavailable(_))));
        assert!(matches!(classify_status(503), Some(EnrichError::Unavailable(_))));
        assert!(matches!(classify_status(502), Some(EnrichError::Transient(_))));
        assert!(matches!(classify_status(429), Some(EnrichError::Transient(_))));
        assert!(matches!(classify_status(422), Some(EnrichError::Permanent(_))));
    }

    #[test]
    fn parses_fenced_answer() {
        let raw = "```json\n{\"sentiment\":\"Negative\",\"bias_score\":0.3,\"summary\":\"Held.\",\"tags\":[\"Rates\"]}\n```";
        let f = parse_answer(raw, &item()).unwrap();
        assert_eq!(f.sentiment, Some(Sentiment::Negative));
        assert_eq!(f.bias_score, Some(0.3));
        assert_eq!(f.tags, vec!["rates".to_string()]);
    }

    #[test]
    fn garbage_answer_is_transient() {
        assert!(matches!(
            parse_answer("I think it's positive", &item()),
            Err(EnrichError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn disabled_enricher_is_unavailable() {
        let e = DisabledEnricher::new("off");
        assert!(matches!(e.enrich(&item()).await, Err(EnrichError::Unavailable(_))));
    }

    #[test]
    #[serial]
    fn env_key_resolution() {
        std::env::remove_var("OPENAI_API_KEY");
        let s = AiSettings {
            enabled: true,
            ..AiSettings::default()
        };
        assert_eq!(s.resolved_api_key(), None);
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        assert_eq!(s.resolved_api_key().as_deref(), Some("sk-test"));
        std::env::remove_var("OPENAI_API_KEY");
    }
}

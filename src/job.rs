//! The enrichment job: one run of "score this comment and store its tones".
//!
//! A run walks `Pending → Fetching → Parsing → Reconciling → Invalidating →
//! Done`, or ends in `Aborted(reason)`. Transient tone service failures
//! (rate limiting, transport errors) produce [`JobOutcome::Retry`] with an
//! exponential backoff until the retry budget is spent, after which the job is
//! dead-lettered: the comment is marked `failed` and the reason recorded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::cache::ViewCache;
use crate::config::DispatcherConfig;
use crate::dispatcher::JobRunner;
use crate::error::{AbortReason, SentimentError};
use crate::logging::OperationTimer;
use crate::metrics::MetricsCollector;
use crate::models::{Comment, CommentId};
use crate::reconciler::ToneReconciler;
use crate::repository::CommentStore;
use crate::sentiment::ToneAnalyzer;

/// Where a job run currently is
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Fetching,
    Parsing,
    Reconciling,
    Invalidating,
    Done,
    Aborted(AbortReason),
}

impl JobState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Reconciling => "reconciling",
            Self::Invalidating => "invalidating",
            Self::Done => "done",
            Self::Aborted(_) => "aborted",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted(_))
    }
}

/// Result of one job run, as seen by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Tones replaced and views invalidated
    Done { tones: usize },
    /// Run again after `after`; the comment keeps its current state meanwhile
    Retry { after: Duration, error: SentimentError },
    /// Terminal failure for this run
    Aborted(AbortReason),
}

impl JobOutcome {
    /// Metric label
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::Retry { .. } => "retry",
            Self::Aborted(reason) => reason.kind(),
        }
    }
}

/// Backoff schedule for transient tone service failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Never retry: every tone service error ends the run
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Whether a run that failed on `attempt` (0-based) may be retried
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before the run following `attempt`.
    ///
    /// `base * 2^attempt` capped at `max_delay`, plus up to `jitter`. A larger
    /// server-provided `Retry-After` wins, but never beyond `max_delay + jitter`.
    #[must_use]
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if !self.jitter.is_zero() {
            let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }

        retry_after
            .map_or(delay, |server| server.max(delay))
            .min(self.max_delay + self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

/// State of one job run
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    comment_id: CommentId,
    attempt: u32,
    state: JobState,
    history: Vec<JobState>,
    sku: Option<String>,
}

impl EnrichmentJob {
    #[must_use]
    pub fn new(comment_id: CommentId, attempt: u32) -> Self {
        Self {
            comment_id,
            attempt,
            state: JobState::Pending,
            history: vec![JobState::Pending],
            sku: None,
        }
    }

    #[must_use]
    pub const fn comment_id(&self) -> CommentId {
        self.comment_id
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn state(&self) -> &JobState {
        &self.state
    }

    /// Every state visited, in order
    #[must_use]
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    fn transition(&mut self, next: JobState) {
        debug!(
            comment_id = self.comment_id,
            attempt = self.attempt,
            from = self.state.name(),
            to = next.name(),
            "Enrichment job state change"
        );
        self.state = next.clone();
        self.history.push(next);
    }
}

/// Everything a job run needs: store, tone service, reconciler, cache and policy
#[derive(Clone)]
pub struct EnrichmentPipeline {
    store: Arc<dyn CommentStore>,
    analyzer: Arc<dyn ToneAnalyzer>,
    reconciler: ToneReconciler,
    cache: ViewCache,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl EnrichmentPipeline {
    pub fn new(
        store: Arc<dyn CommentStore>,
        analyzer: Arc<dyn ToneAnalyzer>,
        cache: ViewCache,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            reconciler: ToneReconciler::new(Arc::clone(&store)),
            store,
            analyzer,
            cache,
            retry,
            metrics: MetricsCollector::default(),
        }
    }

    /// Execute one run of `job` to a terminal state or a retry request
    pub async fn run_job(&self, job: &mut EnrichmentJob) -> JobOutcome {
        let timer = OperationTimer::new("enrichment_job");
        let outcome = self.drive(job).await;

        match &outcome {
            JobOutcome::Done { tones } => {
                info!(
                    comment_id = job.comment_id,
                    attempt = job.attempt,
                    tones,
                    "Comment tones updated"
                );
            }
            JobOutcome::Retry { after, error } => {
                warn!(
                    comment_id = job.comment_id,
                    attempt = job.attempt,
                    retry_in_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Tone service temporarily unavailable, rescheduling"
                );
            }
            JobOutcome::Aborted(reason) => {
                job.transition(JobState::Aborted(reason.clone()));
                self.record_abort(job, reason).await;
            }
        }

        self.metrics.record_job(outcome.label(), timer.elapsed());
        outcome
    }

    async fn drive(&self, job: &mut EnrichmentJob) -> JobOutcome {
        let comment_id = job.comment_id;

        job.transition(JobState::Fetching);
        let comment = match self.store.get_comment(comment_id).await {
            Ok(Some(comment)) => comment,
            Ok(None) => return JobOutcome::Aborted(AbortReason::CommentNotFound(comment_id)),
            Err(e) => return JobOutcome::Aborted(AbortReason::PersistenceFailure(e)),
        };
        job.sku = Some(comment.sku.clone());

        let scores = match self.analyzer.score(&comment.content).await {
            Ok(scores) => scores,
            Err(err) if err.is_transient() => return self.retry_or_dead_letter(job, err),
            Err(err) => return JobOutcome::Aborted(err.into()),
        };

        job.transition(JobState::Parsing);
        let tones = ToneReconciler::compute(comment_id, &scores);

        job.transition(JobState::Reconciling);
        let count = match self.reconciler.apply(comment_id, tones).await {
            Ok(count) => count,
            Err(e) => return JobOutcome::Aborted(AbortReason::PersistenceFailure(e)),
        };

        job.transition(JobState::Invalidating);
        self.invalidate(&comment);

        job.transition(JobState::Done);
        JobOutcome::Done { tones: count }
    }

    fn retry_or_dead_letter(&self, job: &EnrichmentJob, err: SentimentError) -> JobOutcome {
        if self.retry.allows_retry(job.attempt) {
            let retry_after = match &err {
                SentimentError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            JobOutcome::Retry {
                after: self.retry.backoff(job.attempt, retry_after),
                error: err,
            }
        } else {
            if self.retry.max_retries > 0 {
                error!(
                    comment_id = job.comment_id,
                    attempts = job.attempt + 1,
                    error = %err,
                    "Retries exhausted, dead-lettering enrichment job"
                );
            }
            JobOutcome::Aborted(err.into())
        }
    }

    fn invalidate(&self, comment: &Comment) {
        if let Err(e) = self.cache.invalidate_comment(comment.id, &comment.sku) {
            warn!(comment_id = comment.id, error = %e, "Targeted invalidation failed, clearing cache");
            if let Err(e) = self.cache.clear_all() {
                error!(comment_id = comment.id, error = %e, "Unable to clear view cache");
                return;
            }
            self.metrics.record_cache_invalidation("all");
            return;
        }
        self.metrics.record_cache_invalidation("comment");
    }

    async fn record_abort(&self, job: &EnrichmentJob, reason: &AbortReason) {
        if let AbortReason::CommentNotFound(id) = reason {
            warn!(comment_id = id, "Comment no longer exists, nothing to enrich");
            return;
        }

        error!(
            comment_id = job.comment_id,
            attempt = job.attempt,
            kind = reason.kind(),
            error = %reason,
            "Enrichment job aborted"
        );

        let detail = format!("{}: {reason}", reason.kind());
        if let Err(e) = self.store.mark_failed(job.comment_id, detail).await {
            error!(comment_id = job.comment_id, error = %e, "Unable to record enrichment failure");
            return;
        }

        if let Some(sku) = &job.sku {
            if let Err(e) = self.cache.invalidate_comment(job.comment_id, sku) {
                warn!(comment_id = job.comment_id, error = %e, "Unable to invalidate cached views");
            }
        }
    }
}

#[async_trait]
impl JobRunner for EnrichmentPipeline {
    async fn run(&self, comment_id: CommentId, attempt: u32) -> JobOutcome {
        let mut job = EnrichmentJob::new(comment_id, attempt);
        self.run_job(&mut job).await
    }

    async fn abandon(&self, comment_id: CommentId, reason: AbortReason) {
        let mut job = EnrichmentJob::new(comment_id, 0);
        match self.store.get_comment(comment_id).await {
            Ok(Some(comment)) => job.sku = Some(comment.sku),
            Ok(None) => {}
            Err(e) => warn!(comment_id, error = %e, "Unable to load abandoned comment"),
        }
        job.transition(JobState::Aborted(reason.clone()));
        self.record_abort(&job, &reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::StoreError;
    use crate::models::{
        CategoryScore, CategoryScores, CommentView, NewComment, NewToneScore, ToneCategory,
        ToneScore, ToneStatus,
    };
    use mockall::mock;

    mock! {
        Analyzer {}

        #[async_trait]
        impl ToneAnalyzer for Analyzer {
            async fn score(&self, text: &str) -> Result<CategoryScores, SentimentError>;
        }
    }

    /// Store whose tone writes always fail
    struct BrokenWrites(Database);

    #[async_trait]
    impl CommentStore for BrokenWrites {
        async fn get_comment(&self, id: CommentId) -> Result<Option<Comment>, StoreError> {
            CommentStore::get_comment(&self.0, id).await
        }

        async fn replace_tones(
            &self,
            _id: CommentId,
            _tones: Vec<NewToneScore>,
        ) -> Result<(), StoreError> {
            Err(StoreError::InsertFailed("disk full".into()))
        }

        async fn mark_failed(&self, id: CommentId, reason: String) -> Result<(), StoreError> {
            CommentStore::mark_failed(&self.0, id, reason).await
        }

        async fn tones_for_comment(&self, id: CommentId) -> Result<Vec<ToneScore>, StoreError> {
            CommentStore::tones_for_comment(&self.0, id).await
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        cache: ViewCache,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("temp dir");
            let db = Database::new(dir.path().join("comments.db")).expect("open database");
            let cache = ViewCache::temporary().expect("cache");
            Self { _dir: dir, db, cache }
        }

        fn comment(&self, content: &str) -> Comment {
            self.db
                .create_comment(&NewComment {
                    sku: "TEST0001".into(),
                    content: content.into(),
                })
                .expect("create")
        }

        fn pipeline(&self, analyzer: MockAnalyzer, retry: RetryPolicy) -> EnrichmentPipeline {
            EnrichmentPipeline::new(
                Arc::new(self.db.clone()),
                Arc::new(analyzer),
                self.cache.clone(),
                retry,
            )
        }
    }

    fn joyful_scores() -> CategoryScores {
        vec![
            CategoryScore::new("anger", 0.01),
            CategoryScore::new("disgust", 0.02),
            CategoryScore::new("fear", 0.03),
            CategoryScore::new("joy", 0.88),
            CategoryScore::new("sadness", 0.05),
        ]
    }

    fn no_jitter(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_successful_run_walks_every_state() {
        let fixture = Fixture::new();
        let comment = fixture.comment("I really love this product, it's the best!");
        let view = CommentView::new(comment.clone(), &[]);
        let ticket = fixture.cache.comment_ticket(comment.id).expect("ticket");
        assert!(fixture.cache.cache_comment(&ticket, &view).expect("cache"));

        let mut analyzer = MockAnalyzer::new();
        analyzer
            .expect_score()
            .times(1)
            .returning(|_| Ok(joyful_scores()));
        let pipeline = fixture.pipeline(analyzer, RetryPolicy::none());

        let mut job = EnrichmentJob::new(comment.id, 0);
        let outcome = pipeline.run_job(&mut job).await;

        assert_eq!(outcome, JobOutcome::Done { tones: 5 });
        assert_eq!(
            job.history(),
            &[
                JobState::Pending,
                JobState::Fetching,
                JobState::Parsing,
                JobState::Reconciling,
                JobState::Invalidating,
                JobState::Done,
            ]
        );

        let tones = fixture.db.tones_for_comment(comment.id).expect("tones");
        let stored = fixture.db.get_comment(comment.id).expect("get").expect("exists");
        assert_eq!(CommentView::new(stored, &tones).tone, Some(ToneCategory::Joy));
        assert!(fixture.cache.get_comment(comment.id).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_missing_comment_aborts_without_calling_service() {
        let fixture = Fixture::new();
        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_score().times(0);
        let pipeline = fixture.pipeline(analyzer, RetryPolicy::none());

        let mut job = EnrichmentJob::new(9999, 0);
        let outcome = pipeline.run_job(&mut job).await;

        assert_eq!(outcome, JobOutcome::Aborted(AbortReason::CommentNotFound(9999)));
        assert!(job.state().is_terminal());
    }

    #[tokio::test]
    async fn test_unexpected_schema_keeps_previous_tones() {
        let fixture = Fixture::new();
        let comment = fixture.comment("so so");
        fixture
            .db
            .replace_tones(
                comment.id,
                &[NewToneScore { category: ToneCategory::Sadness, score: 0.4 }],
            )
            .expect("seed tones");

        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_score().returning(|_| {
            Err(SentimentError::UnexpectedSchema {
                detail: "no \"emotion_tone\" category".into(),
                snippet: "{}".into(),
            })
        });
        let pipeline = fixture.pipeline(analyzer, no_jitter(3));

        let outcome = pipeline.run(comment.id, 0).await;
        assert!(matches!(
            outcome,
            JobOutcome::Aborted(AbortReason::UnexpectedSchema(_))
        ));

        let tones = fixture.db.tones_for_comment(comment.id).expect("tones");
        assert_eq!(tones.len(), 1);
        assert_eq!(tones[0].category, ToneCategory::Sadness);

        let stored = fixture.db.get_comment(comment.id).expect("get").expect("exists");
        assert_eq!(stored.tone_status, ToneStatus::Failed);
        assert!(stored
            .tone_error
            .as_deref()
            .is_some_and(|e| e.starts_with("unexpected_schema")));
    }

    #[tokio::test]
    async fn test_rate_limit_requests_retry_then_dead_letters() {
        let fixture = Fixture::new();
        let comment = fixture.comment("hmm");

        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_score().times(3).returning(|_| {
            Err(SentimentError::RateLimited {
                retry_after: Some(Duration::from_millis(600)),
                detail: "slow down".into(),
            })
        });
        let pipeline = fixture.pipeline(analyzer, no_jitter(2));

        for attempt in 0..2 {
            match pipeline.run(comment.id, attempt).await {
                JobOutcome::Retry { after, error } => {
                    assert!(error.is_rate_limited());
                    assert_eq!(after, Duration::from_millis(600));
                }
                other => panic!("expected retry, got {other:?}"),
            }
            let stored = fixture.db.get_comment(comment.id).expect("get").expect("exists");
            assert_eq!(stored.tone_status, ToneStatus::Pending);
        }

        let outcome = pipeline.run(comment.id, 2).await;
        assert_eq!(outcome.label(), "rate_limited");
        let stored = fixture.db.get_comment(comment.id).expect("get").expect("exists");
        assert_eq!(stored.tone_status, ToneStatus::Failed);
    }

    #[tokio::test]
    async fn test_abandoned_run_marks_comment_failed() {
        let fixture = Fixture::new();
        let comment = fixture.comment("this one crashes the worker");
        let view = CommentView::new(comment.clone(), &[]);
        let ticket = fixture.cache.comment_ticket(comment.id).expect("ticket");
        assert!(fixture.cache.cache_comment(&ticket, &view).expect("cache"));

        let pipeline = fixture.pipeline(MockAnalyzer::new(), RetryPolicy::none());
        pipeline
            .abandon(comment.id, AbortReason::WorkerPanic("boom".into()))
            .await;

        let stored = fixture.db.get_comment(comment.id).expect("get").expect("exists");
        assert_eq!(stored.tone_status, ToneStatus::Failed);
        assert!(stored
            .tone_error
            .as_deref()
            .is_some_and(|detail| detail.starts_with("worker_panic")));
        assert!(fixture.cache.get_comment(comment.id).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_service_error_is_not_retried() {
        let fixture = Fixture::new();
        let comment = fixture.comment("hmm");

        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_score().times(1).returning(|_| {
            Err(SentimentError::ServiceError {
                status: 500,
                detail: "boom".into(),
            })
        });
        let pipeline = fixture.pipeline(analyzer, no_jitter(5));

        let outcome = pipeline.run(comment.id, 0).await;
        assert_eq!(outcome.label(), "sentiment_unavailable");
    }

    #[tokio::test]
    async fn test_store_failure_aborts_with_persistence_failure() {
        let fixture = Fixture::new();
        let comment = fixture.comment("I really love this product, it's the best!");

        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_score().returning(|_| Ok(joyful_scores()));
        let pipeline = EnrichmentPipeline::new(
            Arc::new(BrokenWrites(fixture.db.clone())),
            Arc::new(analyzer),
            fixture.cache.clone(),
            RetryPolicy::none(),
        );

        let mut job = EnrichmentJob::new(comment.id, 0);
        let outcome = pipeline.run_job(&mut job).await;

        assert_eq!(
            outcome,
            JobOutcome::Aborted(AbortReason::PersistenceFailure(StoreError::InsertFailed(
                "disk full".into()
            )))
        );
        assert!(!job.history().contains(&JobState::Invalidating));
        assert!(fixture.db.tones_for_comment(comment.id).expect("tones").is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let fixture = Fixture::new();
        let comment = fixture.comment("I really love this product, it's the best!");

        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_score().times(2).returning(|_| Ok(joyful_scores()));
        let pipeline = fixture.pipeline(analyzer, RetryPolicy::none());

        let snapshot = |tones: Vec<ToneScore>| -> Vec<(ToneCategory, f64)> {
            tones.into_iter().map(|t| (t.category, t.score)).collect()
        };

        pipeline.run(comment.id, 0).await;
        let first = snapshot(fixture.db.tones_for_comment(comment.id).expect("tones"));
        pipeline.run(comment.id, 0).await;
        let second = snapshot(fixture.db.tones_for_comment(comment.id).expect("tones"));

        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = no_jitter(5);
        assert_eq!(policy.backoff(0, None), Duration::from_millis(100));
        assert_eq!(policy.backoff(1, None), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, None), Duration::from_millis(800));
        assert_eq!(policy.backoff(4, None), Duration::from_secs(1));
        assert_eq!(policy.backoff(40, None), Duration::from_secs(1));
        assert_eq!(
            policy.backoff(0, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
    }

    #[test]
    fn test_server_retry_after_is_capped() {
        let policy = no_jitter(5);
        assert_eq!(
            policy.backoff(0, Some(Duration::from_secs(86_400))),
            Duration::from_secs(1)
        );

        let jittered = RetryPolicy {
            jitter: Duration::from_millis(50),
            ..no_jitter(5)
        };
        let delay = jittered.backoff(2, Some(Duration::from_secs(86_400)));
        assert!(delay <= Duration::from_millis(1_050));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(50),
            ..no_jitter(1)
        };
        for _ in 0..20 {
            let delay = policy.backoff(0, None);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}

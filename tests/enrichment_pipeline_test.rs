//! End-to-end enrichment tests: service, dispatcher, pipeline and a mock tone service

use std::sync::Arc;
use std::time::Duration;

use comment_tone::config::SentimentConfig;
use comment_tone::job::{EnrichmentPipeline, RetryPolicy};
use comment_tone::models::{CommentUpdate, NewComment, NewToneScore};
use comment_tone::{
    CommentService, Database, JobDispatcher, SentimentClient, ToneCategory, ToneError, ToneStatus,
    ViewCache,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TONE_PATH: &str = "/tone";
const LOVE: &str = "I really love this product, it's the best!";

struct Harness {
    _dir: TempDir,
    db: Database,
    cache: ViewCache,
    service: CommentService,
}

impl Harness {
    fn new(server: &MockServer, retry: RetryPolicy) -> Self {
        Self::open(server, retry, tempfile::tempdir().expect("temp dir"))
    }

    /// Build on a directory that may already hold a database
    fn open(server: &MockServer, retry: RetryPolicy, dir: TempDir) -> Self {
        let db = Database::new(dir.path().join("comments.db")).expect("database");
        let cache = ViewCache::temporary().expect("cache");

        let client = SentimentClient::new(&SentimentConfig {
            url: format!("{}{TONE_PATH}", server.uri()),
            timeout_secs: 5,
            ..SentimentConfig::default()
        })
        .expect("client");

        let pipeline = EnrichmentPipeline::new(
            Arc::new(db.clone()),
            Arc::new(client),
            cache.clone(),
            retry,
        );
        let dispatcher = JobDispatcher::new(Arc::new(pipeline), 4);
        let service = CommentService::new(db.clone(), cache.clone(), dispatcher);

        Self {
            _dir: dir,
            db,
            cache,
            service,
        }
    }

    async fn settle(&self) {
        timeout(Duration::from_secs(10), self.service.dispatcher().wait_idle())
            .await
            .expect("enrichment should finish");
    }

    async fn add(&self, sku: &str, content: &str) -> i64 {
        self.service
            .create_comment(NewComment {
                sku: sku.to_string(),
                content: content.to_string(),
            })
            .await
            .expect("create comment")
            .id
    }
}

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: Duration::ZERO,
    }
}

fn emotion_body(dominant: &str) -> serde_json::Value {
    let tones: Vec<_> = ["anger", "disgust", "fear", "joy", "sadness"]
        .into_iter()
        .map(|tone_id| {
            let score = if tone_id == dominant { 0.9 } else { 0.05 };
            json!({"tone_id": tone_id, "score": score})
        })
        .collect();

    json!({
        "document_tone": {
            "tone_categories": [{"category_id": "emotion_tone", "tones": tones}]
        }
    })
}

async fn mount_tone(server: &MockServer, text: &str, dominant: &str, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .and(query_param("text", text))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(emotion_body(dominant))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_created_comment_gets_dominant_tone() {
    let server = MockServer::start().await;
    mount_tone(&server, LOVE, "joy", Duration::ZERO).await;
    let harness = Harness::new(&server, RetryPolicy::none());

    let id = harness.add("TEST0001", LOVE).await;
    harness.settle().await;

    let view = harness.service.get_comment(id).await.expect("view");
    assert_eq!(view.tone, Some(ToneCategory::Joy));
    assert_eq!(view.tone_status, ToneStatus::Enriched);

    let tones = harness.service.comment_tones(id).await.expect("tones");
    assert_eq!(tones.len(), 5);
}

#[tokio::test]
async fn test_latest_edit_wins() {
    let server = MockServer::start().await;
    mount_tone(&server, "First draft", "joy", Duration::from_millis(300)).await;
    mount_tone(&server, "Second thoughts", "sadness", Duration::ZERO).await;
    let harness = Harness::new(&server, RetryPolicy::none());

    let id = harness.add("TEST0001", "First draft").await;
    harness
        .service
        .update_comment(
            id,
            CommentUpdate {
                content: Some("Second thoughts".to_string()),
                ..CommentUpdate::default()
            },
        )
        .await
        .expect("update");
    harness.settle().await;

    let view = harness.service.get_comment(id).await.expect("view");
    assert_eq!(view.content, "Second thoughts");
    assert_eq!(view.tone, Some(ToneCategory::Sadness));
    assert_eq!(view.tone_status, ToneStatus::Enriched);
}

#[tokio::test]
async fn test_enrichment_invalidates_cached_views() {
    let server = MockServer::start().await;
    mount_tone(&server, LOVE, "joy", Duration::from_millis(100)).await;
    let harness = Harness::new(&server, RetryPolicy::none());

    let id = harness.add("TEST0001", LOVE).await;

    // Served and cached before the run lands
    let early = harness.service.get_comment(id).await.expect("view");
    assert_eq!(early.tone, None);
    let listing = harness
        .service
        .list_comments(Some("TEST0001".to_string()))
        .await
        .expect("listing");
    assert_eq!(listing.len(), 1);

    harness.settle().await;

    assert!(harness.cache.get_comment(id).expect("cache").is_none());
    let listing = harness
        .service
        .list_comments(Some("TEST0001".to_string()))
        .await
        .expect("listing");
    assert_eq!(listing[0].tone, Some(ToneCategory::Joy));
}

#[tokio::test]
async fn test_rate_limit_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_tone(&server, LOVE, "joy", Duration::ZERO).await;
    let harness = Harness::new(&server, fast_retries(3));

    let id = harness.add("TEST0001", LOVE).await;
    harness.settle().await;

    let view = harness.service.get_comment(id).await.expect("view");
    assert_eq!(view.tone, Some(ToneCategory::Joy));
    assert_eq!(view.tone_status, ToneStatus::Enriched);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_the_comment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;
    let harness = Harness::new(&server, fast_retries(2));

    let id = harness.add("TEST0001", LOVE).await;
    harness.settle().await;

    let comment = harness.db.get_comment(id).expect("get").expect("exists");
    assert_eq!(comment.tone_status, ToneStatus::Failed);
    assert!(comment
        .tone_error
        .as_deref()
        .is_some_and(|reason| reason.starts_with("rate_limited")));
    assert!(harness.db.tones_for_comment(id).expect("tones").is_empty());
}

#[tokio::test]
async fn test_schema_failure_keeps_previous_tones() {
    let server = MockServer::start().await;
    mount_tone(&server, LOVE, "joy", Duration::ZERO).await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .and(query_param("text", "Changed my mind"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"document_tone": {}})))
        .mount(&server)
        .await;
    let harness = Harness::new(&server, fast_retries(3));

    let id = harness.add("TEST0001", LOVE).await;
    harness.settle().await;
    harness
        .service
        .update_comment(
            id,
            CommentUpdate {
                content: Some("Changed my mind".to_string()),
                ..CommentUpdate::default()
            },
        )
        .await
        .expect("update");
    harness.settle().await;

    let view = harness.service.get_comment(id).await.expect("view");
    assert_eq!(view.tone, Some(ToneCategory::Joy));
    assert_eq!(view.tone_status, ToneStatus::Failed);
}

#[tokio::test]
async fn test_deleted_comment_is_not_scored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(emotion_body("joy")))
        .expect(0)
        .mount(&server)
        .await;
    let harness = Harness::new(&server, RetryPolicy::none());

    harness
        .service
        .dispatcher()
        .enqueue(4242)
        .expect("enqueue");
    harness.settle().await;

    assert!(matches!(
        harness.service.get_comment(4242).await,
        Err(ToneError::CommentNotFound(4242))
    ));
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_enqueue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(emotion_body("joy")))
        .expect(0)
        .mount(&server)
        .await;
    let harness = Harness::new(&server, RetryPolicy::none());

    let too_long = harness
        .service
        .create_comment(NewComment {
            sku: "TOOLONGSKU".to_string(),
            content: LOVE.to_string(),
        })
        .await;
    assert!(matches!(too_long, Err(ToneError::Validation(_))));

    let blank = harness
        .service
        .create_comment(NewComment {
            sku: "TEST0001".to_string(),
            content: "   ".to_string(),
        })
        .await;
    assert!(matches!(blank, Err(ToneError::Validation(_))));

    harness.settle().await;
    assert!(harness.db.list_comments(None).expect("list").is_empty());
}

#[tokio::test]
async fn test_pending_comments_are_resumed_after_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (pending, settled) = {
        // A previous process stored these, then exited before enriching the first
        let db = Database::new(dir.path().join("comments.db")).expect("database");
        let pending = db
            .create_comment(&NewComment {
                sku: "TEST0001".to_string(),
                content: LOVE.to_string(),
            })
            .expect("create");
        let settled = db
            .create_comment(&NewComment {
                sku: "TEST0001".to_string(),
                content: "Already scored".to_string(),
            })
            .expect("create");
        db.replace_tones(
            settled.id,
            &[NewToneScore {
                category: ToneCategory::Fear,
                score: 0.6,
            }],
        )
        .expect("replace");
        (pending.id, settled.id)
    };

    let server = MockServer::start().await;
    mount_tone(&server, LOVE, "joy", Duration::ZERO).await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .and(query_param("text", "Already scored"))
        .respond_with(ResponseTemplate::new(200).set_body_json(emotion_body("joy")))
        .expect(0)
        .mount(&server)
        .await;
    let harness = Harness::open(&server, RetryPolicy::none(), dir);

    assert_eq!(harness.service.resume_pending().await.expect("resume"), 1);
    harness.settle().await;

    let view = harness.service.get_comment(pending).await.expect("view");
    assert_eq!(view.tone, Some(ToneCategory::Joy));
    assert_eq!(view.tone_status, ToneStatus::Enriched);
    let view = harness.service.get_comment(settled).await.expect("view");
    assert_eq!(view.tone, Some(ToneCategory::Fear));
}

#[tokio::test]
async fn test_long_retry_after_does_not_stall_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TONE_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "86400"))
        .mount(&server)
        .await;
    let harness = Harness::new(&server, fast_retries(2));

    let id = harness.add("TEST0001", LOVE).await;
    timeout(Duration::from_secs(10), harness.service.dispatcher().shutdown())
        .await
        .expect("shutdown should not wait for the server's Retry-After");

    let comment = harness.db.get_comment(id).expect("get").expect("exists");
    assert_eq!(comment.tone_status, ToneStatus::Failed);
}

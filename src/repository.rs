//! Async access to the comment store used by the enrichment pipeline.
//!
//! The pipeline only depends on [`CommentStore`]; [`Database`] implements it by
//! moving the blocking rusqlite work onto tokio's blocking pool.

use async_trait::async_trait;

use crate::db::Database;
use crate::error::StoreError;
use crate::models::{Comment, CommentId, NewToneScore, ToneScore};

type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CommentStore: Send + Sync {
    /// Load a comment, `None` if it does not exist
    async fn get_comment(&self, id: CommentId) -> StoreResult<Option<Comment>>;

    /// Atomically replace all tone scores of a comment and mark it enriched
    async fn replace_tones(&self, id: CommentId, tones: Vec<NewToneScore>) -> StoreResult<()>;

    /// Record a failed enrichment without touching tone scores
    async fn mark_failed(&self, id: CommentId, reason: String) -> StoreResult<()>;

    /// Current tone scores of a comment
    async fn tones_for_comment(&self, id: CommentId) -> StoreResult<Vec<ToneScore>>;
}

#[async_trait]
impl CommentStore for Database {
    async fn get_comment(&self, id: CommentId) -> StoreResult<Option<Comment>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.get_comment(id)).await?
    }

    async fn replace_tones(&self, id: CommentId, tones: Vec<NewToneScore>) -> StoreResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.replace_tones(id, &tones)).await?
    }

    async fn mark_failed(&self, id: CommentId, reason: String) -> StoreResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.mark_failed(id, &reason)).await?
    }

    async fn tones_for_comment(&self, id: CommentId) -> StoreResult<Vec<ToneScore>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.tones_for_comment(id)).await?
    }
}

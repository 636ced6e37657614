//! CRUD entry point for comments.
//!
//! Writes go to the database, evict the affected cached views and schedule an
//! enrichment run; they return before the run completes. Reads are served from
//! the view cache when possible.

use tracing::{debug, info, warn};

use crate::cache::ViewCache;
use crate::db::Database;
use crate::dispatcher::JobDispatcher;
use crate::error::{Result, StoreError, ToneError};
use crate::metrics::MetricsCollector;
use crate::models::{Comment, CommentId, CommentUpdate, CommentView, NewComment, ToneScore};
use crate::validation::InputValidator;

pub struct CommentService {
    db: Database,
    cache: ViewCache,
    dispatcher: JobDispatcher,
    metrics: MetricsCollector,
}

impl CommentService {
    pub fn new(db: Database, cache: ViewCache, dispatcher: JobDispatcher) -> Self {
        Self {
            db,
            cache,
            dispatcher,
            metrics: MetricsCollector::default(),
        }
    }

    pub const fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Run a blocking store call on tokio's blocking pool
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> std::result::Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(StoreError::from)?;
        Ok(result?)
    }

    /// Create a comment and schedule its enrichment
    pub async fn create_comment(&self, new_comment: NewComment) -> Result<Comment> {
        let new_comment = InputValidator::validate_new_comment(&new_comment)
            .map_err(|e| ToneError::Validation(e.to_string()))?;

        let comment = self
            .with_db(move |db| db.create_comment(&new_comment))
            .await?;
        info!(comment_id = comment.id, sku = %comment.sku, "Comment created");

        self.evict(&comment, None);
        self.dispatcher.enqueue(comment.id)?;
        Ok(comment)
    }

    /// Apply a partial update and schedule re-enrichment
    pub async fn update_comment(&self, id: CommentId, update: CommentUpdate) -> Result<Comment> {
        let update = InputValidator::validate_update(&update)
            .map_err(|e| ToneError::Validation(e.to_string()))?;

        let (previous_sku, comment) = self
            .with_db(move |db| db.update_comment(id, &update))
            .await?
            .ok_or(ToneError::CommentNotFound(id))?;
        info!(comment_id = id, sku = %comment.sku, "Comment updated");

        self.evict(&comment, Some(&previous_sku));
        self.dispatcher.enqueue(comment.id)?;
        Ok(comment)
    }

    /// Delete a comment together with its tone scores
    pub async fn delete_comment(&self, id: CommentId) -> Result<Comment> {
        let comment = self
            .with_db(move |db| db.delete_comment(id))
            .await?
            .ok_or(ToneError::CommentNotFound(id))?;
        info!(comment_id = id, sku = %comment.sku, "Comment deleted");

        self.evict(&comment, None);
        Ok(comment)
    }

    /// Rendered view of one comment
    pub async fn get_comment(&self, id: CommentId) -> Result<CommentView> {
        match self.cache.get_comment(id) {
            Ok(Some(view)) => {
                debug!(comment_id = id, "Comment view served from cache");
                return Ok(view);
            }
            Ok(None) => {}
            Err(e) => warn!(comment_id = id, error = %e, "Unable to read cached comment view"),
        }

        let ticket = self
            .cache
            .comment_ticket(id)
            .map_err(|e| warn!(comment_id = id, error = %e, "Unable to read cache generation"))
            .ok();
        let view = self
            .with_db(move |db| {
                let Some(comment) = db.get_comment(id)? else {
                    return Ok(None);
                };
                let tones = db.tones_for_comment(id)?;
                Ok(Some(CommentView::new(comment, &tones)))
            })
            .await?
            .ok_or(ToneError::CommentNotFound(id))?;

        if let Some(ticket) = ticket {
            if let Err(e) = self.cache.cache_comment(&ticket, &view) {
                warn!(comment_id = id, error = %e, "Unable to cache comment view");
            }
        }
        Ok(view)
    }

    /// Rendered views of every comment, or of one SKU, newest first
    pub async fn list_comments(&self, sku: Option<String>) -> Result<Vec<CommentView>> {
        match self.cache.get_listing(sku.as_deref()) {
            Ok(Some(views)) => {
                debug!(sku = ?sku, "Comment listing served from cache");
                return Ok(views);
            }
            Ok(None) => {}
            Err(e) => warn!(sku = ?sku, error = %e, "Unable to read cached listing"),
        }

        let ticket = self
            .cache
            .listing_ticket(sku.as_deref())
            .map_err(|e| warn!(sku = ?sku, error = %e, "Unable to read cache generation"))
            .ok();
        let filter = sku.clone();
        let views = self
            .with_db(move |db| {
                let comments = db.list_comments(filter.as_deref())?;
                let mut views = Vec::with_capacity(comments.len());
                for comment in comments {
                    let tones = db.tones_for_comment(comment.id)?;
                    views.push(CommentView::new(comment, &tones));
                }
                Ok(views)
            })
            .await?;

        if let Some(ticket) = ticket {
            if let Err(e) = self.cache.cache_listing(&ticket, &views) {
                warn!(sku = ?sku, error = %e, "Unable to cache comment listing");
            }
        }
        Ok(views)
    }

    /// Stored tone scores of a comment
    pub async fn comment_tones(&self, id: CommentId) -> Result<Vec<ToneScore>> {
        let tones = self
            .with_db(move |db| {
                if db.get_comment(id)?.is_none() {
                    return Ok(None);
                }
                db.tones_for_comment(id).map(Some)
            })
            .await?
            .ok_or(ToneError::CommentNotFound(id))?;
        Ok(tones)
    }

    /// Schedule an enrichment run for an existing comment
    pub async fn enrich(&self, id: CommentId) -> Result<()> {
        if self.with_db(move |db| db.get_comment(id)).await?.is_none() {
            return Err(ToneError::CommentNotFound(id));
        }
        self.dispatcher.enqueue(id)
    }

    /// Schedule every comment left `pending` by a previous process.
    ///
    /// The dispatcher queue lives in memory only, so call this once at startup.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.with_db(Database::pending_comment_ids).await?;
        for id in &pending {
            self.dispatcher.enqueue(*id)?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Resumed pending enrichment jobs");
        }
        Ok(pending.len())
    }

    /// Evict cached views of `comment`, including the listing of the SKU it
    /// moved away from
    fn evict(&self, comment: &Comment, previous_sku: Option<&str>) {
        if let Err(e) = self.cache.invalidate_comment(comment.id, &comment.sku) {
            warn!(comment_id = comment.id, error = %e, "Targeted invalidation failed, clearing cache");
            if let Err(e) = self.cache.clear_all() {
                warn!(error = %e, "Unable to clear view cache");
                return;
            }
            self.metrics.record_cache_invalidation("all");
            return;
        }
        self.metrics.record_cache_invalidation("comment");

        if let Some(previous) = previous_sku.filter(|previous| *previous != comment.sku) {
            if let Err(e) = self.cache.invalidate_sku(previous) {
                warn!(sku = previous, error = %e, "Unable to invalidate previous SKU listing");
            }
        }
    }
}

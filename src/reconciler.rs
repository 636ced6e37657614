use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::models::{CategoryScore, CommentId, NewToneScore, ToneCategory};
use crate::repository::CommentStore;

/// Turns raw category scores into a comment's replacement tone set
#[derive(Clone)]
pub struct ToneReconciler {
    store: Arc<dyn CommentStore>,
    metrics: MetricsCollector,
}

impl ToneReconciler {
    pub fn new(store: Arc<dyn CommentStore>) -> Self {
        Self {
            store,
            metrics: MetricsCollector::default(),
        }
    }

    /// Map service scores to tone records.
    ///
    /// Unknown tone ids are skipped. A category appearing twice keeps its first
    /// score so the set never violates the one-score-per-category rule.
    pub fn compute(comment_id: CommentId, scores: &[CategoryScore]) -> Vec<NewToneScore> {
        let mut seen = HashSet::new();
        let mut tones = Vec::with_capacity(scores.len());

        for entry in scores {
            let category = match entry.category_id.parse::<ToneCategory>() {
                Ok(category) => category,
                Err(e) => {
                    warn!(comment_id, tone_id = %entry.category_id, "{e}");
                    continue;
                }
            };

            if !seen.insert(category) {
                warn!(
                    comment_id,
                    tone = %category,
                    score = entry.score,
                    "Duplicate tone in response, keeping the first score"
                );
                continue;
            }

            tones.push(NewToneScore {
                category,
                score: entry.score,
            });
        }

        tones
    }

    /// Atomically replace the comment's tones with `tones`
    pub async fn apply(
        &self,
        comment_id: CommentId,
        tones: Vec<NewToneScore>,
    ) -> Result<usize, StoreError> {
        let count = tones.len();
        self.store.replace_tones(comment_id, tones).await?;
        self.metrics.record_reconciliation(count);
        debug!(comment_id, count, "Reconciled comment tones");
        Ok(count)
    }

    /// Compute and apply in one step; returns the number of tones written
    pub async fn reconcile(
        &self,
        comment_id: CommentId,
        scores: &[CategoryScore],
    ) -> Result<usize, StoreError> {
        let tones = Self::compute(comment_id, scores);
        self.apply(comment_id, tones).await
    }
}

//! Data models for comments and their tone scores
//!
//! This module contains the structures shared by the store, the enrichment
//! pipeline and the view cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comment identifier (SQLite rowid)
pub type CommentId = i64;

/// Maximum SKU length accepted for a comment
pub const SKU_MAX_LENGTH: usize = 8;

/// Number of characters of content shown in a comment's short name
pub const NAME_MAX_LENGTH: usize = 32;

/// Emotion categories scored by the tone service.
///
/// The integer codes are what gets persisted and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToneCategory {
    /// anger
    Anger,
    /// disgust
    Disgust,
    /// fear
    Fear,
    /// joy
    Joy,
    /// sadness
    Sadness,
}

impl ToneCategory {
    /// Every category, in code order
    pub const ALL: [Self; 5] = [
        Self::Anger,
        Self::Disgust,
        Self::Fear,
        Self::Joy,
        Self::Sadness,
    ];

    /// Persisted integer code
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Anger => 0,
            Self::Disgust => 1,
            Self::Fear => 2,
            Self::Joy => 3,
            Self::Sadness => 4,
        }
    }

    /// Inverse of [`ToneCategory::code`]
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Anger),
            1 => Some(Self::Disgust),
            2 => Some(Self::Fear),
            3 => Some(Self::Joy),
            4 => Some(Self::Sadness),
            _ => None,
        }
    }

    /// Name as used by the tone service `tone_id` field
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anger => "anger",
            Self::Disgust => "disgust",
            Self::Fear => "fear",
            Self::Joy => "joy",
            Self::Sadness => "sadness",
        }
    }
}

impl fmt::Display for ToneCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToneCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| format!("Invalid tone name: {s}"))
    }
}

/// Enrichment status of a comment.
///
/// Makes "not processed yet" distinguishable from "processing failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToneStatus {
    /// Created or edited, enrichment not finished
    #[default]
    Pending,
    /// Tone scores reflect the current content
    Enriched,
    /// The last enrichment run failed
    Failed,
}

impl ToneStatus {
    /// Persisted name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enriched => "enriched",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ToneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToneStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "enriched" => Ok(Self::Enriched),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Invalid tone status: {other}")),
        }
    }
}

/// A stored comment
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    /// Primary key
    pub id: CommentId,
    /// Associated product SKU
    pub sku: String,
    /// Textual content
    pub content: String,
    /// Enrichment status
    pub tone_status: ToneStatus,
    /// Reason of the last failed enrichment, if any
    pub tone_error: Option<String>,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Most recent modification timestamp
    pub modified: DateTime<Utc>,
}

impl Comment {
    /// Content truncated to [`NAME_MAX_LENGTH`] characters
    #[must_use]
    pub fn name(&self) -> String {
        if self.content.chars().count() > NAME_MAX_LENGTH {
            let truncated: String = self.content.chars().take(NAME_MAX_LENGTH).collect();
            format!("{truncated}..")
        } else {
            self.content.clone()
        }
    }
}

/// Data for inserting a comment
#[derive(Debug, Clone)]
pub struct NewComment {
    pub sku: String,
    pub content: String,
}

/// Partial update of a comment; `None` leaves the field as is
#[derive(Debug, Clone, Default)]
pub struct CommentUpdate {
    pub sku: Option<String>,
    pub content: Option<String>,
}

/// A stored tone score
#[derive(Debug, Clone, PartialEq)]
pub struct ToneScore {
    pub id: i64,
    pub comment_id: CommentId,
    pub category: ToneCategory,
    pub score: f64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl fmt::Display for ToneScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.category.as_str();
        let mut chars = name.chars();
        if let Some(first) = chars.next() {
            write!(f, "{}{}: {}", first.to_ascii_uppercase(), chars.as_str(), self.score)
        } else {
            write!(f, ": {}", self.score)
        }
    }
}

/// Tone score to be written by a reconciliation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewToneScore {
    pub category: ToneCategory,
    pub score: f64,
}

/// One `(tone_id, score)` pair exactly as returned by the tone service
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub category_id: String,
    pub score: f64,
}

impl CategoryScore {
    pub fn new(category_id: impl Into<String>, score: f64) -> Self {
        Self {
            category_id: category_id.into(),
            score,
        }
    }
}

/// Ordered scores for the emotion category, unfiltered
pub type CategoryScores = Vec<CategoryScore>;

/// Pick the dominant tone among `(category, score)` pairs.
///
/// Highest score wins; equal scores resolve to the lowest category code.
/// NaN scores are ignored. Returns `None` when nothing qualifies.
pub fn dominant_tone<I>(scores: I) -> Option<ToneCategory>
where
    I: IntoIterator<Item = (ToneCategory, f64)>,
{
    scores
        .into_iter()
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best: Option<(ToneCategory, f64)>, (category, score)| match best {
            Some((best_category, best_score))
                if best_score > score || (best_score == score && best_category <= category) =>
            {
                best
            }
            _ => Some((category, score)),
        })
        .map(|(category, _)| category)
}

/// Rendered comment as served to readers and stored in the view cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentView {
    pub id: CommentId,
    pub sku: String,
    pub content: String,
    /// Dominant tone, `None` when there are no scores
    pub tone: Option<ToneCategory>,
    pub tone_status: ToneStatus,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl CommentView {
    /// Build the view of a comment from its current tone scores
    #[must_use]
    pub fn new(comment: Comment, tones: &[ToneScore]) -> Self {
        let tone = dominant_tone(tones.iter().map(|t| (t.category, t.score)));
        Self {
            id: comment.id,
            sku: comment.sku,
            content: comment.content,
            tone,
            tone_status: comment.tone_status,
            created: comment.created,
            modified: comment.modified,
        }
    }
}

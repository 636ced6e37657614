//! Error types for the comment-tone library.
//!
//! The enrichment pipeline has its own narrow taxonomies (`SentimentError`,
//! `StoreError`, `AbortReason`) so each stage can be matched on precisely.
//! `ToneError` wraps everything for the service and CLI layers.

use std::time::Duration;

use thiserror::Error;

use crate::models::CommentId;

/// Failures talking to the external tone-scoring service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SentimentError {
    /// Connection error, timeout or other transport-level failure
    #[error("Tone service request failed: {0}")]
    RequestFailed(String),

    /// The service answered 429 Too Many Requests
    #[error("Tone service rate limited the request: {detail}")]
    RateLimited {
        /// Delay requested through the `Retry-After` header, if any
        retry_after: Option<Duration>,
        /// Response body, truncated
        detail: String,
    },

    /// Any other non-2xx status
    #[error("Tone service returned HTTP {status}: {detail}")]
    ServiceError {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        detail: String,
    },

    /// 2xx response whose body is not JSON
    #[error("Unable to parse tone service response ({detail}): {snippet}")]
    MalformedResponse {
        /// Parser error
        detail: String,
        /// Response body, truncated
        snippet: String,
    },

    /// Valid JSON without the expected emotion category layout
    #[error("Unexpected tone service response format ({detail}): {snippet}")]
    UnexpectedSchema {
        /// What was missing
        detail: String,
        /// Response body, truncated
        snippet: String,
    },
}

impl SentimentError {
    /// Whether this is the distinguished 429 sub-kind
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Errors worth retrying after a delay: rate limiting and transport failures
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::RequestFailed(_))
    }
}

/// Failures of the comment store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Removing the previous tone records failed
    #[error("Error deleting existing comment tones: {0}")]
    DeleteFailed(String),

    /// Inserting the replacement tone records failed
    #[error("Error adding comment tones: {0}")]
    InsertFailed(String),

    /// Connection, query or transaction failure outside delete/insert
    #[error("Comment store unavailable: {0}")]
    Unavailable(String),
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Unavailable(format!("store task failed: {err}"))
    }
}

/// Why an enrichment job run ended without reaching `Done`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The comment was deleted before the job could load it
    #[error("Unknown comment object in enrichment job: {0}")]
    CommentNotFound(CommentId),

    /// Transport failure or non-2xx from the tone service
    #[error("Tone service unavailable: {0}")]
    SentimentUnavailable(SentimentError),

    /// The tone service answered with something that is not JSON
    #[error("{0}")]
    MalformedResponse(SentimentError),

    /// The tone service JSON lacks the emotion categories
    #[error("{0}")]
    UnexpectedSchema(SentimentError),

    /// The atomic tone replacement failed
    #[error("Persisting comment tones failed: {0}")]
    PersistenceFailure(StoreError),

    /// The job task itself panicked
    #[error("Enrichment worker panicked: {0}")]
    WorkerPanic(String),
}

impl AbortReason {
    /// Short stable label, used for metrics and the stored failure reason
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CommentNotFound(_) => "comment_not_found",
            Self::SentimentUnavailable(SentimentError::RateLimited { .. }) => "rate_limited",
            Self::SentimentUnavailable(_) => "sentiment_unavailable",
            Self::MalformedResponse(_) => "malformed_response",
            Self::UnexpectedSchema(_) => "unexpected_schema",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::WorkerPanic(_) => "worker_panic",
        }
    }
}

impl From<SentimentError> for AbortReason {
    fn from(err: SentimentError) -> Self {
        match err {
            SentimentError::MalformedResponse { .. } => Self::MalformedResponse(err),
            SentimentError::UnexpectedSchema { .. } => Self::UnexpectedSchema(err),
            other => Self::SentimentUnavailable(other),
        }
    }
}

/// Errors surfaced by the comment service and CLI.
#[derive(Error, Debug)]
pub enum ToneError {
    /// Store-level failure
    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    /// Comment does not exist
    #[error("Comment not found: {0}")]
    CommentNotFound(CommentId),

    /// Rejected input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP client construction
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization errors
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// The dispatcher is no longer accepting jobs
    #[error("Job dispatcher is shut down")]
    DispatcherClosed,
}

/// Convenience type alias for Result with `ToneError`
pub type Result<T> = std::result::Result<T, ToneError>;

impl From<sled::Error> for ToneError {
    fn from(err: sled::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<rusqlite::Error> for ToneError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl From<r2d2::Error> for ToneError {
    fn from(err: r2d2::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

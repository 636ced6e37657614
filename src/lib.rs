//! Comment Tone - emotion enrichment for product comments
//!
//! Stores short comments attached to product SKUs and enriches each one with
//! emotion scores from an external tone-scoring service.
//!
//! # Features
//!
//! - Comment CRUD on SQLite with pooled connections
//! - Asynchronous enrichment, at most one run in flight per comment
//! - Atomic replacement of a comment's tone scores
//! - Bounded retries with backoff for rate limiting and transport failures
//! - Targeted invalidation of cached comment views

/// Cached rendered comment views
pub mod cache;
/// Configuration management
pub mod config;
/// Database operations and connection pooling
pub mod db;
/// Per-comment job scheduling
pub mod dispatcher;
/// Error types
pub mod error;
/// Enrichment job state machine and retry policy
pub mod job;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Tone score reconciliation
pub mod reconciler;
/// Async store access for the enrichment pipeline
pub mod repository;
/// Database schema definitions
pub mod schema;
/// Tone service client
pub mod sentiment;
/// Comment CRUD service
pub mod service;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use cache::{ViewCache, ViewTicket};
pub use db::Database;
pub use dispatcher::{JobDispatcher, JobRunner};
pub use error::{AbortReason, Result, SentimentError, StoreError, ToneError};
pub use job::{EnrichmentJob, EnrichmentPipeline, JobOutcome, JobState, RetryPolicy};
pub use models::{Comment, CommentId, CommentView, ToneCategory, ToneScore, ToneStatus};
pub use reconciler::ToneReconciler;
pub use sentiment::{SentimentClient, ToneAnalyzer};
pub use service::CommentService;

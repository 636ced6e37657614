//! Database schema definitions
//!
//! This module provides constants for table and column names used with rusqlite,
//! along with the migration SQL applied when the database is opened.

/// Comments table schema
pub mod comments {
    /// Table name
    pub const TABLE: &str = "comments";
    /// Primary key column
    pub const ID: &str = "id";
    /// Product SKU column
    pub const SKU: &str = "sku";
    /// Textual content column
    pub const CONTENT: &str = "content";
    /// Enrichment status column (pending, enriched, failed)
    pub const TONE_STATUS: &str = "tone_status";
    /// Last enrichment failure reason column
    pub const TONE_ERROR: &str = "tone_error";
    /// Creation timestamp column
    pub const CREATED: &str = "created";
    /// Modification timestamp column
    pub const MODIFIED: &str = "modified";
}

/// Comment tones table schema
pub mod comment_tones {
    /// Table name
    pub const TABLE: &str = "comment_tones";
    /// Primary key column
    pub const ID: &str = "id";
    /// Foreign key to comments table
    pub const COMMENT_ID: &str = "comment_id";
    /// Tone category code column
    pub const TONE_TYPE: &str = "tone_type";
    /// Score column
    pub const SCORE: &str = "score";
    /// Creation timestamp column
    pub const CREATED: &str = "created";
    /// Modification timestamp column
    pub const MODIFIED: &str = "modified";
}

/// Initial schema: comments and their tone scores
pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sku VARCHAR(8) NOT NULL,
    content TEXT NOT NULL,
    tone_status TEXT NOT NULL DEFAULT 'pending',
    tone_error TEXT,
    created TEXT NOT NULL,
    modified TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_comments_sku ON comments (sku);

CREATE TABLE IF NOT EXISTS comment_tones (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    comment_id INTEGER NOT NULL REFERENCES comments (id) ON DELETE CASCADE,
    tone_type INTEGER NOT NULL CHECK (tone_type BETWEEN 0 AND 4),
    score REAL NOT NULL,
    created TEXT NOT NULL,
    modified TEXT NOT NULL,
    UNIQUE (comment_id, tone_type)
);
";

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use r2d2::{ManageConnection, Pool};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::models::{
    Comment, CommentId, CommentUpdate, NewComment, NewToneScore, ToneCategory, ToneScore,
    ToneStatus,
};
use crate::schema::{comment_tones, comments, CREATE_TABLES};

type StoreResult<T> = std::result::Result<T, StoreError>;

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// r2d2 manager opening rusqlite connections with foreign keys enforced
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    path: PathBuf,
}

impl SqliteConnectionManager {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

impl ToSql for ToneStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ToneStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for ToneCategory {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for ToneCategory {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_i64()?;
        Self::from_code(code).ok_or(FromSqlError::OutOfRange(code))
    }
}

/// Database manager for handling connections and operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the database described by `config`
    pub fn open(config: &DatabaseConfig) -> StoreResult<Self> {
        let path = config.url.strip_prefix("sqlite:").unwrap_or(&config.url);
        let path = path.strip_prefix("//").unwrap_or(path);

        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)?;

        let conn = pool.get()?;
        Self::run_migrations(&conn)?;
        info!(path, "Comment database ready");

        Ok(Self { pool })
    }

    /// Open a database file with default pool settings
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let config = DatabaseConfig {
            url: path.as_ref().to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        Self::open(&config)
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> StoreResult<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Insert a new comment with status `pending`
    pub fn create_comment(&self, new_comment: &NewComment) -> StoreResult<Comment> {
        let conn = self.get_connection()?;
        let now = Utc::now();

        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?)",
                comments::TABLE,
                comments::SKU,
                comments::CONTENT,
                comments::TONE_STATUS,
                comments::CREATED,
                comments::MODIFIED
            ),
            params![new_comment.sku, new_comment.content, ToneStatus::Pending, now, now],
        )?;

        let id = conn.last_insert_rowid();
        debug!(comment_id = id, sku = %new_comment.sku, "Inserted comment");

        Ok(Comment {
            id,
            sku: new_comment.sku.clone(),
            content: new_comment.content.clone(),
            tone_status: ToneStatus::Pending,
            tone_error: None,
            created: now,
            modified: now,
        })
    }

    /// Get a comment by ID
    pub fn get_comment(&self, id: CommentId) -> StoreResult<Option<Comment>> {
        let conn = self.get_connection()?;
        Self::find_comment(&conn, id)
    }

    fn find_comment(conn: &Connection, id: CommentId) -> StoreResult<Option<Comment>> {
        let comment = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", comments::TABLE, comments::ID),
                params![id],
                Self::map_comment,
            )
            .optional()?;
        Ok(comment)
    }

    /// Apply a partial update and reset the enrichment status to `pending`.
    ///
    /// Returns the SKU the comment had before the update together with the
    /// updated comment, or `None` if the comment does not exist. Existing tone
    /// scores stay until the next enrichment replaces them.
    pub fn update_comment(
        &self,
        id: CommentId,
        update: &CommentUpdate,
    ) -> StoreResult<Option<(String, Comment)>> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(previous) = Self::find_comment(&tx, id)? else {
            return Ok(None);
        };

        let sku = update.sku.clone().unwrap_or_else(|| previous.sku.clone());
        let content = update
            .content
            .clone()
            .unwrap_or_else(|| previous.content.clone());
        let now = Utc::now();

        tx.execute(
            &format!(
                "UPDATE {} SET {} = ?, {} = ?, {} = ?, {} = NULL, {} = ? WHERE {} = ?",
                comments::TABLE,
                comments::SKU,
                comments::CONTENT,
                comments::TONE_STATUS,
                comments::TONE_ERROR,
                comments::MODIFIED,
                comments::ID
            ),
            params![sku, content, ToneStatus::Pending, now, id],
        )?;
        tx.commit()?;

        let updated = Comment {
            sku,
            content,
            tone_status: ToneStatus::Pending,
            tone_error: None,
            modified: now,
            ..previous.clone()
        };
        Ok(Some((previous.sku, updated)))
    }

    /// Delete a comment; its tone scores go with it
    pub fn delete_comment(&self, id: CommentId) -> StoreResult<Option<Comment>> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = Self::find_comment(&tx, id)?;
        if existing.is_some() {
            tx.execute(
                &format!("DELETE FROM {} WHERE {} = ?", comments::TABLE, comments::ID),
                params![id],
            )?;
        }
        tx.commit()?;

        Ok(existing)
    }

    /// List comments, newest first, optionally restricted to one SKU
    pub fn list_comments(&self, sku: Option<&str>) -> StoreResult<Vec<Comment>> {
        let conn = self.get_connection()?;

        let mut query = format!("SELECT * FROM {}", comments::TABLE);
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(sku) = sku {
            query.push_str(&format!(" WHERE {} = ?", comments::SKU));
            params.push(Box::new(sku.to_string()));
        }
        query.push_str(&format!(
            " ORDER BY {} DESC, {} DESC",
            comments::CREATED,
            comments::ID
        ));

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), Self::map_comment)?;

        let mut results = Vec::new();
        for comment in rows {
            results.push(comment?);
        }
        Ok(results)
    }

    /// Ids of comments still waiting for enrichment, oldest first
    pub fn pending_comment_ids(&self) -> StoreResult<Vec<CommentId>> {
        let conn = self.get_connection()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY {} ASC",
            comments::ID,
            comments::TABLE,
            comments::TONE_STATUS,
            comments::ID
        ))?;
        let rows = stmt.query_map(params![ToneStatus::Pending], |row| row.get(0))?;

        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Current tone scores of a comment, in category order
    pub fn tones_for_comment(&self, id: CommentId) -> StoreResult<Vec<ToneScore>> {
        let conn = self.get_connection()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} = ? ORDER BY {} ASC",
            comment_tones::TABLE,
            comment_tones::COMMENT_ID,
            comment_tones::TONE_TYPE
        ))?;
        let rows = stmt.query_map(params![id], Self::map_tone_score)?;

        let mut results = Vec::new();
        for tone in rows {
            results.push(tone?);
        }
        Ok(results)
    }

    /// Replace all tone scores of a comment in a single transaction.
    ///
    /// Marks the comment `enriched` in the same transaction. On any error the
    /// transaction rolls back and the previous tone set is left intact.
    pub fn replace_tones(&self, id: CommentId, tones: &[NewToneScore]) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?",
                comment_tones::TABLE,
                comment_tones::COMMENT_ID
            ),
            params![id],
        )
        .map_err(|e| StoreError::DeleteFailed(e.to_string()))?;

        let now = Utc::now();
        {
            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO {} ({}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?)",
                    comment_tones::TABLE,
                    comment_tones::COMMENT_ID,
                    comment_tones::TONE_TYPE,
                    comment_tones::SCORE,
                    comment_tones::CREATED,
                    comment_tones::MODIFIED
                ))
                .map_err(|e| StoreError::InsertFailed(e.to_string()))?;

            for tone in tones {
                insert
                    .execute(params![id, tone.category, tone.score, now, now])
                    .map_err(|e| StoreError::InsertFailed(e.to_string()))?;
            }
        }

        tx.execute(
            &format!(
                "UPDATE {} SET {} = ?, {} = NULL WHERE {} = ?",
                comments::TABLE,
                comments::TONE_STATUS,
                comments::TONE_ERROR,
                comments::ID
            ),
            params![ToneStatus::Enriched, id],
        )?;

        tx.commit()?;
        debug!(comment_id = id, count = tones.len(), "Replaced comment tones");
        Ok(())
    }

    /// Record a failed enrichment; tone scores are left untouched
    pub fn mark_failed(&self, id: CommentId, reason: &str) -> StoreResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?, {} = ? WHERE {} = ?",
                comments::TABLE,
                comments::TONE_STATUS,
                comments::TONE_ERROR,
                comments::ID
            ),
            params![ToneStatus::Failed, reason, id],
        )?;
        Ok(())
    }

    /// Map a database row to a Comment
    fn map_comment(row: &Row) -> rusqlite::Result<Comment> {
        Ok(Comment {
            id: row.get(comments::ID)?,
            sku: row.get(comments::SKU)?,
            content: row.get(comments::CONTENT)?,
            tone_status: row.get(comments::TONE_STATUS)?,
            tone_error: row.get(comments::TONE_ERROR)?,
            created: row.get(comments::CREATED)?,
            modified: row.get(comments::MODIFIED)?,
        })
    }

    /// Map a database row to a ToneScore
    fn map_tone_score(row: &Row) -> rusqlite::Result<ToneScore> {
        Ok(ToneScore {
            id: row.get(comment_tones::ID)?,
            comment_id: row.get(comment_tones::COMMENT_ID)?,
            category: row.get(comment_tones::TONE_TYPE)?,
            score: row.get(comment_tones::SCORE)?,
            created: row.get(comment_tones::CREATED)?,
            modified: row.get(comment_tones::MODIFIED)?,
        })
    }
}

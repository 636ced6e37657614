use anyhow::{anyhow, Result};

use crate::models::{CommentUpdate, NewComment, SKU_MAX_LENGTH};

/// Maximum accepted comment length, in characters
pub const CONTENT_MAX_LENGTH: usize = 10_000;

/// Validation utilities for comment input
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a product SKU
    pub fn validate_sku(sku: &str) -> Result<()> {
        if sku.trim().is_empty() {
            return Err(anyhow!("SKU: This field may not be blank."));
        }

        if sku.chars().count() > SKU_MAX_LENGTH {
            return Err(anyhow!(
                "SKU: Ensure this field has no more than {SKU_MAX_LENGTH} characters."
            ));
        }

        if sku.chars().any(char::is_control) {
            return Err(anyhow!("SKU: contains invalid characters"));
        }

        Ok(())
    }

    /// Validate comment text
    pub fn validate_content(content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(anyhow!("Content: This field may not be blank."));
        }

        if content.chars().count() > CONTENT_MAX_LENGTH {
            return Err(anyhow!(
                "Content: Ensure this field has no more than {CONTENT_MAX_LENGTH} characters."
            ));
        }

        Self::reject_null_bytes(content)
    }

    /// NUL is refused outright rather than stripped by `sanitize_text`
    fn reject_null_bytes(content: &str) -> Result<()> {
        if content.contains('\0') {
            return Err(anyhow!("Content: contains invalid characters"));
        }
        Ok(())
    }

    /// Validate and normalize a new comment
    pub fn validate_new_comment(comment: &NewComment) -> Result<NewComment> {
        let sku = comment.sku.trim().to_string();
        Self::reject_null_bytes(&comment.content)?;
        let content = Self::sanitize_text(&comment.content);
        Self::validate_sku(&sku)?;
        Self::validate_content(&content)?;
        Ok(NewComment { sku, content })
    }

    /// Validate and normalize the fields present in a partial update
    pub fn validate_update(update: &CommentUpdate) -> Result<CommentUpdate> {
        if update.sku.is_none() && update.content.is_none() {
            return Err(anyhow!("Nothing to update"));
        }

        let sku = match &update.sku {
            Some(sku) => {
                let sku = sku.trim().to_string();
                Self::validate_sku(&sku)?;
                Some(sku)
            }
            None => None,
        };
        let content = match &update.content {
            Some(content) => {
                Self::reject_null_bytes(content)?;
                let content = Self::sanitize_text(content);
                Self::validate_content(&content)?;
                Some(content)
            }
            None => None,
        };

        Ok(CommentUpdate { sku, content })
    }

    /// Strip control characters other than line breaks and tabs, then trim
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Validate database URL
    pub fn validate_database_url(url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(anyhow!("Database URL cannot be empty"));
        }

        if !url.starts_with("sqlite:") {
            return Err(anyhow!("Only SQLite databases are supported"));
        }

        if url.len() > 1000 {
            return Err(anyhow!("Database URL too long"));
        }

        Ok(())
    }
}

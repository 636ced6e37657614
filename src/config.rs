use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::validation::InputValidator;

/// Application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub sentiment: SentimentConfig,
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

/// Tone service endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    pub url: String,
    /// API version date sent as the `version` query parameter
    pub version: String,
    /// Sent as basic auth `apikey:<key>` when set
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// Worker pool and retry settings for enrichment jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of jobs running at once
    pub workers: usize,
    /// Retries for rate-limited or transport failures before dead-lettering
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of random delay added to each backoff
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/comments.db".to_string(),
            max_connections: 10,
            connection_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    }
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            url: "https://gateway.watsonplatform.net/tone-analyzer/api/v3/tone".to_string(),
            version: "2017-09-21".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_ms: 250,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: ".comment_cache".to_string(),
        }
    }
}

impl SentimentConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&Self::default())?)
            // Add config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("config").required(false))
            // COMMENT_TONE_SENTIMENT__API_KEY=... overrides sentiment.api_key
            .add_source(
                Environment::with_prefix("COMMENT_TONE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize configuration: {}", e))?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate database config
        InputValidator::validate_database_url(&self.database.url)?;
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be greater than 0"));
        }
        if self.database.connection_timeout_secs == 0 {
            return Err(anyhow::anyhow!("connection_timeout_secs must be greater than 0"));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        // Validate sentiment config
        if !(self.sentiment.url.starts_with("http://") || self.sentiment.url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "Invalid tone service url: {}",
                self.sentiment.url
            ));
        }
        if self.sentiment.version.trim().is_empty() {
            return Err(anyhow::anyhow!("sentiment version must not be empty"));
        }
        if self.sentiment.timeout_secs == 0 {
            return Err(anyhow::anyhow!("sentiment timeout_secs must be greater than 0"));
        }

        // Validate dispatcher config
        if self.dispatcher.workers == 0 {
            return Err(anyhow::anyhow!("workers must be greater than 0"));
        }
        if self.dispatcher.base_backoff_ms == 0 {
            return Err(anyhow::anyhow!("base_backoff_ms must be greater than 0"));
        }
        if self.dispatcher.max_backoff_ms < self.dispatcher.base_backoff_ms {
            return Err(anyhow::anyhow!(
                "max_backoff_ms must not be smaller than base_backoff_ms"
            ));
        }

        if self.cache.path.trim().is_empty() {
            return Err(anyhow::anyhow!("cache path must not be empty"));
        }

        Ok(())
    }

    /// Get log level from environment or config
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}

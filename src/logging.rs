use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

const DEFAULT_LOG_FILE: &str = "comment-tone.log";

/// Initialize structured logging from the `logging` config section.
///
/// `RUST_LOG` takes precedence over the configured level. Keep the returned
/// guard alive for as long as the file layer should flush.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("Failed to create log filter: {}", e))?;

    let registry = Registry::default().with(env_filter);

    // stderr keeps stdout free for command output
    let console_layer = if config.format == "json" {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
            .compact()
            .boxed()
    };

    let guard = match config.file_path.as_deref().map(Path::new) {
        Some(log_path) => {
            let directory = log_path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = log_path
                .file_name()
                .map_or_else(|| DEFAULT_LOG_FILE.into(), |name| name.to_string_lossy());
            let (writer, guard) = non_blocking(rolling::daily(directory, &*file_name));

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .json();

            registry.with(console_layer).with(file_layer).try_init()?;
            Some(guard)
        }
        None => {
            registry.with(console_layer).try_init()?;
            None
        }
    };

    info!(level = %config.level, format = %config.format, "Logging system initialized");
    Ok(guard)
}

/// Measures one named operation and logs its duration once
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
    reported: bool,
}

impl OperationTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
            reported: false,
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log the duration at info level and return it
    pub fn finish(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.reported = true;
        info!(
            operation = self.operation,
            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Operation completed"
        );
        elapsed
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        if !self.reported && !std::thread::panicking() {
            tracing::debug!(
                operation = self.operation,
                duration_ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Operation finished"
            );
        }
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use comment_tone::config::AppConfig;
use comment_tone::job::{EnrichmentPipeline, RetryPolicy};
use comment_tone::logging::{init_logging, OperationTimer};
use comment_tone::models::{CommentUpdate, CommentView, NewComment};
use comment_tone::{CommentService, Database, JobDispatcher, SentimentClient, ViewCache};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a comment and score its tone
    Add {
        /// Product SKU (at most 8 characters)
        #[arg(short, long)]
        sku: String,

        /// Comment text
        #[arg(short, long)]
        content: String,
    },
    /// Edit a comment and score it again
    Update {
        /// Comment ID
        id: i64,

        /// New product SKU
        #[arg(short, long)]
        sku: Option<String>,

        /// New comment text
        #[arg(short, long)]
        content: Option<String>,
    },
    /// Delete a comment and its tone scores
    Delete {
        /// Comment ID
        id: i64,
    },
    /// Show one comment with its dominant tone and scores
    Show {
        /// Comment ID
        id: i64,
    },
    /// List comments, newest first
    List {
        /// Only comments of this SKU
        #[arg(short, long)]
        sku: Option<String>,
    },
    /// Score an existing comment again
    Enrich {
        /// Comment ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    let _log_guard = init_logging(&config.logging)?;
    info!("Starting comment-tone");

    let db = Database::open(&config.database).context("Failed to open comment database")?;
    let cache = ViewCache::open(&config.cache.path).context("Failed to open view cache")?;
    let client = SentimentClient::new(&config.sentiment).context("Failed to build tone client")?;

    let pipeline = EnrichmentPipeline::new(
        Arc::new(db.clone()),
        Arc::new(client),
        cache.clone(),
        RetryPolicy::from_config(&config.dispatcher),
    );
    let dispatcher = JobDispatcher::new(Arc::new(pipeline), config.dispatcher.workers);
    let service = CommentService::new(db, cache, dispatcher.clone());
    if let Err(e) = service.resume_pending().await {
        warn!(error = %e, "Unable to resume pending enrichment jobs");
    }

    let result = run(&service, &cli).await;

    // Enrichment runs in the background; let it finish before exiting
    let timer = OperationTimer::new("drain_dispatcher");
    dispatcher.shutdown().await;
    timer.finish();

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn run(service: &CommentService, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Add { sku, content } => {
            let comment = service
                .create_comment(NewComment {
                    sku: sku.clone(),
                    content: content.clone(),
                })
                .await?;
            println!("Created comment {} ({})", comment.id, comment.name());
        }
        Commands::Update { id, sku, content } => {
            let comment = service
                .update_comment(
                    *id,
                    CommentUpdate {
                        sku: sku.clone(),
                        content: content.clone(),
                    },
                )
                .await?;
            println!("Updated comment {} ({})", comment.id, comment.name());
        }
        Commands::Delete { id } => {
            let comment = service.delete_comment(*id).await?;
            println!("Deleted comment {} ({})", comment.id, comment.name());
        }
        Commands::Show { id } => {
            // Let a pending run land before reading
            service.dispatcher().wait_idle().await;
            let view = service.get_comment(*id).await?;
            let tones = service.comment_tones(*id).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "comment": view,
                        "tones": tones
                            .iter()
                            .map(|t| (t.category.as_str(), t.score))
                            .collect::<std::collections::BTreeMap<_, _>>(),
                    }))?
                );
            } else {
                print_view(&view);
                for tone in &tones {
                    println!("    {tone}");
                }
            }
        }
        Commands::List { sku } => {
            let views = service.list_comments(sku.clone()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if views.is_empty() {
                println!("No comments");
            } else {
                views.iter().for_each(print_view);
            }
        }
        Commands::Enrich { id } => {
            service.enrich(*id).await?;
            println!("Scheduled enrichment of comment {id}");
        }
    }

    Ok(())
}

fn print_view(view: &CommentView) {
    let tone = view.tone.map_or("none", |tone| tone.as_str());
    println!(
        "[{}] {} {} tone={} status={}",
        view.id,
        view.created.format("%Y-%m-%d %H:%M:%S"),
        view.sku,
        tone,
        view.tone_status
    );
    println!("    {}", view.content);
}

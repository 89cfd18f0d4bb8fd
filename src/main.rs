//! CLI entry point for the tunepool tool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use tunepool::{
    Database, EndpointResolver, LibraryStore, QueueManager, QueueManagerConfig, QueueStatus,
    QueueStore, ResolverConfig, SettingsStore, TrackPipeline, TrackRequest,
};

mod cli;

use cli::{Args, ClearTarget, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let db = Database::new(&args.db).await?;
    let store = Arc::new(QueueStore::new(db.clone()));
    let library = Arc::new(LibraryStore::new(db.clone()));
    let settings = SettingsStore::new(db.clone());

    let state_dir = args.output.join(".tunepool");
    let resolver = Arc::new(EndpointResolver::new(ResolverConfig::new(
        &args.manifest_url,
        state_dir.join("endpoints.json"),
    ))?);
    let pipeline = Arc::new(TrackPipeline::new(Arc::clone(&resolver), &args.output)?);

    let queue_settings = settings.queue_settings().await?;
    let manager = QueueManager::new(
        store,
        library,
        pipeline,
        QueueManagerConfig::from_settings(&queue_settings),
    );

    let recovered = manager.recover_interrupted().await?;
    if recovered > 0 {
        info!(recovered, "returned interrupted downloads to the queue");
    }

    match args.command {
        Command::Add {
            track_id,
            title,
            artist,
            album,
            quality,
            convert_to,
            auto_clean,
        } => {
            let mut request = TrackRequest::new(track_id, title, artist);
            request.album = album;
            request.quality = quality;
            request.convert_to = convert_to;
            request.auto_clean = auto_clean;

            if manager.add(&request).await? {
                info!(track_id, "track enqueued");
            } else {
                info!(track_id, "track already queued or downloading, skipped");
            }
        }
        Command::Run => run_until_drained(&manager).await?,
        Command::Status => print_status(&manager).await?,
        Command::Retry { track_id } => match track_id {
            Some(track_id) => {
                if manager.retry_one(track_id).await? {
                    info!(track_id, "track returned to queue");
                } else {
                    info!(track_id, "track has no failed attempt to retry");
                }
            }
            None => {
                let requeued = manager.retry_all_failed().await?;
                info!(requeued, "failed tracks returned to queue");
            }
        },
        Command::Clear { target } => {
            let status = match target {
                ClearTarget::Queued => QueueStatus::Queued,
                ClearTarget::Completed => QueueStatus::Completed,
                ClearTarget::Failed => QueueStatus::Failed,
            };
            let cleared = manager.clear(status).await?;
            info!(cleared, status = %status, "items cleared");
        }
    }

    Ok(())
}

/// Drives the processing loop to completion, showing live progress.
async fn run_until_drained(manager: &Arc<QueueManager>) -> Result<()> {
    let state = manager.get_state().await?;
    if state.queued.is_empty() && state.active.is_empty() {
        info!("queue is empty, nothing to do");
        return Ok(());
    }

    manager.start_processing();

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(120));

    loop {
        let state = manager.get_state().await?;
        bar.set_message(format!(
            "{} active, {} queued, {} completed, {} failed",
            state.active.len(),
            state.queued.len(),
            state.completed_total,
            state.failed.len(),
        ));

        if !state.processing && state.queued.is_empty() && state.active.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    bar.finish_and_clear();

    let state = manager.get_state().await?;
    info!(
        completed = state.completed_total,
        failed = state.failed.len(),
        "queue drained"
    );
    for item in &state.failed {
        info!(
            track_id = item.track_id,
            error = item.error.as_deref().unwrap_or("unknown"),
            "failed: {} - {}",
            item.artist,
            item.title
        );
    }
    Ok(())
}

/// Prints a one-screen queue summary.
async fn print_status(manager: &Arc<QueueManager>) -> Result<()> {
    let state = manager.get_state().await?;

    println!(
        "queue: {} queued, {} active, {} completed, {} failed (concurrency {})",
        state.queued.len(),
        state.active.len(),
        state.completed_total,
        state.failed.len(),
        state.max_concurrency,
    );
    for entry in &state.active {
        println!(
            "  active  {:>3}% [{}] {} - {}",
            entry.progress, entry.stage, entry.item.artist, entry.item.title
        );
    }
    for item in &state.queued {
        println!("  queued       {} - {}", item.artist, item.title);
    }
    for item in &state.failed {
        println!(
            "  failed       {} - {} ({})",
            item.artist,
            item.title,
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Durable download queue and mirror failover for a personal music library.
#[derive(Parser, Debug)]
#[command(name = "tunepool")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the queue database
    #[arg(long, default_value = "tunepool.db", global = true)]
    pub db: PathBuf,

    /// Directory downloads are written into
    #[arg(short, long, default_value = ".", global = true)]
    pub output: PathBuf,

    /// URL of the mirror manifest
    #[arg(
        long,
        default_value = "https://mirrors.tunepool.example/manifest.json",
        global = true
    )]
    pub manifest_url: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue one track for download
    Add {
        /// Catalog track ID
        track_id: i64,
        /// Track title
        title: String,
        /// Artist name
        artist: String,
        /// Album title
        #[arg(long)]
        album: Option<String>,
        /// Quality selector passed to the stream endpoint
        #[arg(long)]
        quality: Option<String>,
        /// Target transcode format
        #[arg(long)]
        convert_to: Option<String>,
        /// Purge the completed record immediately after completion
        #[arg(long)]
        auto_clean: bool,
    },
    /// Process the queue until it drains
    Run,
    /// Show queue state
    Status,
    /// Return failed items to the queue
    Retry {
        /// Retry only this track (all failed items when omitted)
        track_id: Option<i64>,
    },
    /// Remove all items with a status
    Clear {
        /// Which set to clear
        target: ClearTarget,
    },
}

/// Clearable status sets. Active items cannot be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClearTarget {
    /// Items waiting to be processed.
    Queued,
    /// Finished downloads.
    Completed,
    /// Failed downloads.
    Failed,
}

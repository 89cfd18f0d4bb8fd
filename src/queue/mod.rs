//! Queue module: persistent download queue and its in-process coordinator.
//!
//! This module tracks download items through their lifecycle
//! (`queued` → `active` → `completed`/`failed`).
//!
//! # Overview
//!
//! - [`QueueStore`] - SQLite-backed persistence with atomic claim/transition ops
//! - [`QueueManager`] - singleton coordinator: dedup, bounded-concurrency
//!   scheduling, live progress, terminal bookkeeping
//! - [`QueueItem`] / [`TrackRequest`] - persisted row and enqueue payload
//! - [`QueueStatus`] / [`ActiveStage`] - lifecycle states
//! - [`QueueError`] - operation error types
//!
//! # Example
//!
//! ```ignore
//! use tunepool::{Database, QueueStore, TrackRequest};
//!
//! let db = Database::new(Path::new("tunepool.db")).await?;
//! let store = QueueStore::new(db);
//!
//! let accepted = store.add(&TrackRequest::new(42, "Song", "Artist A")).await?;
//! let claimed = store.pop_n(3).await?;
//! ```

mod error;
mod item;
mod manager;
mod store;

pub use error::{QueueDbErrorKind, QueueError};
pub use item::{ActiveStage, QueueItem, QueueStatus, TrackRequest};
pub use manager::{
    ActiveDownload, AddOutcome, DEFAULT_MAX_CONCURRENCY, QueueManager, QueueManagerConfig,
    QueueState,
};
pub use store::QueueStore;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

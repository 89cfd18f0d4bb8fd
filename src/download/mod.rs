//! Per-track download pipeline and the processor seam.
//!
//! The queue manager drives downloads through the [`TrackProcessor`]
//! trait: one call per claimed item, which must report progress and
//! exactly one terminal outcome back into the manager. The production
//! implementation is [`TrackPipeline`]; tests substitute mock
//! processors.

mod error;
mod pipeline;

pub use error::PipelineError;
pub use pipeline::TrackPipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::queue::{QueueItem, QueueManager};

/// Executes the download+post-process pipeline for one claimed item.
///
/// # Contract
///
/// Implementations must call
/// [`update_active_progress`](QueueManager::update_active_progress)
/// during the transfer and exactly one of
/// [`mark_completed`](QueueManager::mark_completed) /
/// [`mark_failed`](QueueManager::mark_failed) before returning. The
/// manager supervises the task boundary: a panic or a return without a
/// terminal report is converted into a failure.
#[async_trait]
pub trait TrackProcessor: Send + Sync {
    /// Processes one claimed queue item to a terminal state.
    async fn process(&self, item: QueueItem, manager: Arc<QueueManager>);
}

/// Transcode/tag/organize seam invoked after the raw transfer.
///
/// The pipeline treats this as an opaque collaborator: it hands over the
/// downloaded file and receives the path to use from then on.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Runs post-processing on a downloaded file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PostProcess`] (or any pipeline error)
    /// when the file cannot be processed; the attempt then fails.
    async fn run(&self, path: &Path, item: &QueueItem) -> Result<PathBuf, PipelineError>;
}

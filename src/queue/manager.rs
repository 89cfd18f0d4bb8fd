//! In-process queue coordinator.
//!
//! [`QueueManager`] is the single authoritative coordinator of enqueue,
//! scheduling, concurrency limiting, and progress/outcome bookkeeping.
//! Exactly one instance exists per process; it is constructed once at
//! startup and shared as an `Arc` by every caller.
//!
//! # Concurrency Model
//!
//! - The processing loop runs as one background task; each claimed item
//!   gets its own worker task (fire-and-forget, supervised for panics).
//! - The in-memory active set is the authoritative source of live
//!   progress; only terminal states reach the store.
//! - `stop_processing` stops launching new workers but never cancels
//!   in-flight ones.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::item::{ActiveStage, QueueItem, QueueStatus, TrackRequest};
use super::store::QueueStore;
use super::{QueueError, Result};
use crate::download::TrackProcessor;
use crate::library::LibraryStore;
use crate::settings::QueueSettings;

/// Default concurrent download ceiling.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// How many completed items a state snapshot carries.
const COMPLETED_SNAPSHOT_LIMIT: i64 = 50;

/// Fixed pause between scheduling loop iterations.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Queue manager configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    /// Concurrent download ceiling; excess items stay queued.
    pub max_concurrency: usize,
    /// Start the processing loop automatically on enqueue/retry.
    pub auto_process: bool,
    /// Pause between scheduling loop iterations.
    pub poll_interval: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            auto_process: true,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl QueueManagerConfig {
    /// Builds a config from the persisted settings record.
    #[must_use]
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            auto_process: settings.auto_process,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// One in-flight download, mirrored in memory while `active`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveDownload {
    /// The claimed queue row.
    pub item: QueueItem,
    /// Live progress, 0-100. Written only by the owning worker.
    pub progress: u8,
    /// Fine-grained sub-status. Written only by the owning worker.
    pub stage: ActiveStage,
}

/// Outcome of a bulk enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    /// Requests accepted into the queue.
    pub added: usize,
    /// Requests rejected as duplicates.
    pub skipped: usize,
}

/// Read-only snapshot of the whole queue, assembled best-effort.
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    /// Persisted queued items, FIFO.
    pub queued: Vec<QueueItem>,
    /// In-flight items with live progress.
    pub active: Vec<ActiveDownload>,
    /// Most recent completed items (up to 50).
    pub completed: Vec<QueueItem>,
    /// Total completed count, including rows beyond the snapshot page.
    pub completed_total: i64,
    /// All failed items.
    pub failed: Vec<QueueItem>,
    /// Configured concurrency ceiling.
    pub max_concurrency: usize,
    /// Whether enqueue/retry trigger processing automatically.
    pub auto_process: bool,
    /// Whether the processing loop is currently running.
    pub processing: bool,
}

/// Singleton coordinator for the download queue.
///
/// Construct once with [`QueueManager::new`] and share the returned
/// `Arc` with every caller; the processing loop and worker tasks hold
/// clones of the same instance.
pub struct QueueManager {
    store: Arc<QueueStore>,
    library: Arc<LibraryStore>,
    processor: Arc<dyn TrackProcessor>,
    config: QueueManagerConfig,
    /// Live progress mirror for `active` rows. The lock also guards the
    /// check-duplicate-then-insert sequence in [`add`](Self::add).
    active: Mutex<HashMap<i64, ActiveDownload>>,
    processing: AtomicBool,
    /// Self-handle so `&self` methods can hand an owned clone to the
    /// background loop and worker tasks they spawn.
    weak_self: Weak<QueueManager>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.config)
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates the process-wide queue manager.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        library: Arc<LibraryStore>,
        processor: Arc<dyn TrackProcessor>,
        config: QueueManagerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            library,
            processor,
            config,
            active: Mutex::new(HashMap::new()),
            processing: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Returns the configured concurrency ceiling.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    /// Returns true while the processing loop is running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Enqueues one track.
    ///
    /// Rejected (returns `false`) when the track is already in the
    /// in-memory active set or the store reports a live duplicate.
    /// Acceptance triggers the processing loop when `auto_process` is on.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store insert fails.
    #[instrument(skip(self, request), fields(track_id = request.track_id))]
    pub async fn add(&self, request: &TrackRequest) -> Result<bool> {
        // Lock held across the store insert: the duplicate check and the
        // insert form one critical section against concurrent enqueues.
        let active = self.active.lock().await;
        if active.contains_key(&request.track_id) {
            warn!(track_id = request.track_id, "rejected duplicate enqueue: track is active");
            return Ok(false);
        }
        let inserted = self.store.add(request).await?;
        drop(active);

        match inserted {
            Some(id) => {
                debug!(track_id = request.track_id, queue_id = id, "track enqueued");
                if self.config.auto_process {
                    self.start_processing();
                }
                Ok(true)
            }
            None => {
                warn!(track_id = request.track_id, "rejected duplicate enqueue: track is queued");
                Ok(false)
            }
        }
    }

    /// Enqueues a batch of tracks sequentially.
    ///
    /// Not atomic across items: earlier requests stay accepted when a
    /// later one fails or is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] on the first store failure.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn add_many(&self, requests: &[TrackRequest]) -> Result<AddOutcome> {
        let mut outcome = AddOutcome::default();
        for request in requests {
            if self.add(request).await? {
                outcome.added += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        Ok(outcome)
    }

    /// Starts the background processing loop.
    ///
    /// Idempotent: when the loop is already running this returns
    /// immediately. The loop exits on its own once both the persisted
    /// queue and the active set are empty.
    pub fn start_processing(&self) {
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!("processing loop already running");
            return;
        }
        let Some(manager) = self.weak_self.upgrade() else {
            // Only reachable during teardown; nothing left to schedule.
            self.processing.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            manager.run_loop().await;
        });
    }

    /// Asks the processing loop to stop launching new workers.
    ///
    /// In-flight workers run to their terminal state.
    pub fn stop_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }

    /// Scheduling loop body. Runs until the queue drains or
    /// [`stop_processing`](Self::stop_processing) clears the flag.
    async fn run_loop(self: Arc<Self>) {
        info!(max_concurrency = self.config.max_concurrency, "queue processing started");

        loop {
            if !self.processing.load(Ordering::SeqCst) {
                info!("queue processing stopped on request");
                return;
            }

            let slots = {
                let active = self.active.lock().await;
                self.config.max_concurrency.saturating_sub(active.len())
            };

            if slots > 0 {
                match self.store.pop_n(slots).await {
                    Ok(items) => {
                        for item in items {
                            self.launch_worker(item).await;
                        }
                    }
                    Err(error) => {
                        // The loop outlives transient store failures.
                        warn!(error = %error, "failed to claim queued items");
                    }
                }
            }

            match self.drained().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(error) => warn!(error = %error, "failed to check queue depth"),
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.processing.store(false, Ordering::SeqCst);
        info!("queue drained, processing loop exiting");

        // An enqueue that raced the shutdown saw the flag still set and
        // skipped its trigger; pick that work up instead of stranding it.
        if self.config.auto_process {
            match self.store.count_by_status(QueueStatus::Queued).await {
                Ok(count) if count > 0 => self.start_processing(),
                Ok(_) => {}
                Err(error) => warn!(error = %error, "failed post-drain queue check"),
            }
        }
    }

    /// True when both the persisted queued set and the in-memory active
    /// set are empty.
    async fn drained(&self) -> Result<bool> {
        let queued = self.store.count_by_status(QueueStatus::Queued).await?;
        let active_len = self.active.lock().await.len();
        Ok(queued == 0 && active_len == 0)
    }

    /// Registers a claimed item and spawns its supervised worker task.
    async fn launch_worker(&self, item: QueueItem) {
        let track_id = item.track_id;
        {
            let mut active = self.active.lock().await;
            active.insert(
                track_id,
                ActiveDownload {
                    item: item.clone(),
                    progress: 0,
                    stage: ActiveStage::Starting,
                },
            );
        }
        debug!(track_id, "worker launched");

        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let processor = Arc::clone(&manager.processor);
            let outcome = AssertUnwindSafe(processor.process(item, Arc::clone(&manager)))
                .catch_unwind()
                .await;

            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(track_id, %message, "worker panicked");
                if let Err(mark_error) = manager
                    .mark_failed(track_id, &format!("worker panicked: {message}"))
                    .await
                {
                    warn!(track_id, error = %mark_error, "failed to record worker panic");
                }
            }

            // The processor must report exactly one terminal state; an
            // entry still in the active set here means it reported none.
            let leaked = manager.active.lock().await.contains_key(&track_id);
            if leaked {
                warn!(track_id, "worker exited without reporting a result");
                if let Err(mark_error) = manager
                    .mark_failed(track_id, "worker exited without reporting a result")
                    .await
                {
                    warn!(track_id, error = %mark_error, "failed to fail abandoned item");
                }
            }
        });
    }

    /// Updates live progress for an in-flight item. In-memory only;
    /// stale callbacks after completion are no-ops.
    pub async fn update_active_progress(&self, track_id: i64, progress: u8, stage: ActiveStage) {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get_mut(&track_id) {
            entry.progress = progress.min(100);
            entry.stage = stage;
        } else {
            debug!(track_id, "ignored progress update for inactive track");
        }
    }

    /// Records a successful download.
    ///
    /// Must be called by the owning worker exactly once. Persists the
    /// terminal state, performs the best-effort library write, honors
    /// the item's `auto_clean` flag, and removes the track from the
    /// active set.
    ///
    /// # Returns
    ///
    /// `false` when the item was no longer in a transitionable state
    /// (a stale duplicate call).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the terminal write fails.
    #[instrument(skip(self, metadata), fields(track_id))]
    pub async fn mark_completed(
        &self,
        track_id: i64,
        filename: &str,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        let item = {
            let active = self.active.lock().await;
            active.get(&track_id).map(|entry| entry.item.clone())
        };

        let transitioned = self
            .store
            .update_status(track_id, QueueStatus::Completed, None, Some(filename), Some(&metadata))
            .await?;

        self.active.lock().await.remove(&track_id);

        if !transitioned {
            warn!(track_id, "stale completion ignored: item not transitionable");
            return Ok(false);
        }

        info!(track_id, filename, "download completed");

        if let Some(item) = &item {
            // Secondary normalized write; failures never affect queue state.
            if let Err(error) = self.library.record_download(item, filename).await {
                warn!(track_id, error = %error, "library record write failed");
            }

            if item.auto_clean {
                match self.store.clear(QueueStatus::Completed).await {
                    Ok(purged) => debug!(track_id, purged, "auto-clean purged completed history"),
                    Err(error) => warn!(track_id, error = %error, "auto-clean purge failed"),
                }
            }
        }

        Ok(true)
    }

    /// Records a failed download. Persists the error string and removes
    /// the track from the active set. Never retried automatically.
    ///
    /// # Returns
    ///
    /// `false` when the item was no longer in a transitionable state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the terminal write fails.
    #[instrument(skip(self), fields(track_id, error = %error))]
    pub async fn mark_failed(&self, track_id: i64, error: &str) -> Result<bool> {
        let transitioned = self
            .store
            .update_status(track_id, QueueStatus::Failed, Some(error), None, None)
            .await?;

        self.active.lock().await.remove(&track_id);

        if transitioned {
            warn!(track_id, error, "download failed");
        } else {
            warn!(track_id, "stale failure ignored: item not transitionable");
        }

        Ok(transitioned)
    }

    /// Assembles a read-only snapshot of the queue.
    ///
    /// Never blocks on in-flight network calls; the active list merges
    /// persisted rows with the in-memory progress mirror.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if a store read fails.
    #[instrument(skip(self))]
    pub async fn get_state(&self) -> Result<QueueState> {
        let queued = self.store.list_by_status(QueueStatus::Queued).await?;
        let completed = self.store.recent_completed(COMPLETED_SNAPSHOT_LIMIT).await?;
        let completed_total = self.store.count_by_status(QueueStatus::Completed).await?;
        let failed = self.store.list_by_status(QueueStatus::Failed).await?;

        let active: Vec<ActiveDownload> = {
            let guard = self.active.lock().await;
            let mut entries: Vec<ActiveDownload> = guard.values().cloned().collect();
            entries.sort_by_key(|entry| entry.item.id);
            entries
        };

        Ok(QueueState {
            queued,
            active,
            completed,
            completed_total,
            failed,
            max_concurrency: self.config.max_concurrency,
            auto_process: self.config.auto_process,
            processing: self.is_processing(),
        })
    }

    /// Removes a queued item before it is claimed.
    ///
    /// Active items cannot be removed; they run to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove(&self, track_id: i64) -> Result<bool> {
        self.store.delete(track_id).await
    }

    /// Clears all items with the given status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidStatus`] for `Active` (in-flight
    /// items cannot be cleared), or [`QueueError::Database`] if the
    /// delete fails.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn clear(&self, status: QueueStatus) -> Result<u64> {
        if status == QueueStatus::Active {
            return Err(QueueError::invalid_status(
                status.as_str(),
                "in-flight items cannot be cleared",
            ));
        }
        self.store.clear(status).await
    }

    /// Requeues every failed item and re-triggers processing.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn retry_all_failed(&self) -> Result<u64> {
        let requeued = self.store.requeue_failed().await?;
        if requeued > 0 {
            info!(requeued, "failed items returned to queue");
            if self.config.auto_process {
                self.start_processing();
            }
        }
        Ok(requeued)
    }

    /// Requeues one failed item and re-triggers processing.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn retry_one(&self, track_id: i64) -> Result<bool> {
        let requeued = self.store.requeue_one(track_id).await?;
        if requeued && self.config.auto_process {
            self.start_processing();
        }
        Ok(requeued)
    }

    /// Crash recovery: returns rows stranded in `active` by a previous
    /// process to `queued`. Call once at startup, before processing.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let reset = self.store.reset_active().await?;
        if reset > 0 {
            info!(reset, "recovered interrupted downloads from previous run");
        }
        Ok(reset)
    }
}

/// Extracts a readable message from a worker panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

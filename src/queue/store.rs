//! SQLite-backed persistent store for queue items.
//!
//! All mutations are single short statements (or implicit single-statement
//! transactions); no network I/O ever happens while a statement holds the
//! write lock. Claiming uses `UPDATE ... RETURNING` so concurrent callers
//! can never receive the same row.

use std::collections::HashMap;

use sqlx::Row;
use tracing::instrument;

use super::item::{QueueItem, QueueStatus, TrackRequest};
use super::{QueueError, Result};
use crate::db::Database;

/// Persistent store for download queue items.
///
/// Safe to share across the processing loop and direct callers; SQLite's
/// WAL journal plus the pool's busy timeout serialize cross-connection
/// writers.
#[derive(Debug, Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    /// Creates a new store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new `queued` row for the request, unless a row for the
    /// same `track_id` is already queued or active.
    ///
    /// The existence check and the insert are one atomic statement; the
    /// partial unique index on live rows backstops the race where two
    /// connections pass the check simultaneously, and that constraint
    /// violation is folded into the `None` (duplicate) result.
    ///
    /// # Returns
    ///
    /// The new row ID, or `None` when the track is already in flight.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails for any reason
    /// other than the dedup constraint.
    #[instrument(skip(self, request), fields(track_id = request.track_id))]
    pub async fn add(&self, request: &TrackRequest) -> Result<Option<i64>> {
        let result = sqlx::query(
            r"INSERT INTO queue (
                track_id, title, artist, album, album_id, track_number,
                cover_url, quality, convert_to, bitrate,
                run_post_process, embed_lyrics, organize_template,
                group_compilations, use_enrichment, auto_clean,
                catalog_artist_id, catalog_album_id, catalog_track_id,
                added_by, status
              )
              SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
              WHERE NOT EXISTS (
                  SELECT 1 FROM queue WHERE track_id = ? AND status IN (?, ?)
              )
              RETURNING id",
        )
        .bind(request.track_id)
        .bind(&request.title)
        .bind(&request.artist)
        .bind(&request.album)
        .bind(request.album_id)
        .bind(request.track_number)
        .bind(&request.cover_url)
        .bind(&request.quality)
        .bind(&request.convert_to)
        .bind(&request.bitrate)
        .bind(request.run_post_process)
        .bind(request.embed_lyrics)
        .bind(&request.organize_template)
        .bind(request.group_compilations)
        .bind(request.use_enrichment)
        .bind(request.auto_clean)
        .bind(request.catalog_artist_id)
        .bind(request.catalog_album_id)
        .bind(request.catalog_track_id)
        .bind(&request.added_by)
        .bind(QueueStatus::Queued.as_str())
        .bind(request.track_id)
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Active.as_str())
        .fetch_optional(self.db.pool())
        .await;

        match result {
            Ok(row) => Ok(row.map(|r| r.get("id"))),
            Err(error) => {
                let error = QueueError::from(error);
                if error.is_constraint_violation() {
                    Ok(None)
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Atomically claims up to `n` of the oldest `queued` rows, flipping
    /// them to `active` in the same statement.
    ///
    /// Rows come back FIFO by enqueue time. Concurrent callers each
    /// receive a disjoint set; an empty queue yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn pop_n(&self, n: usize) -> Result<Vec<QueueItem>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let items = sqlx::query_as::<_, QueueItem>(
            r"UPDATE queue
              SET status = ?, updated_at = datetime('now')
              WHERE id IN (
                  SELECT id FROM queue
                  WHERE status = ?
                  ORDER BY created_at ASC, id ASC
                  LIMIT ?
              )
              RETURNING *",
        )
        .bind(QueueStatus::Active.as_str())
        .bind(QueueStatus::Queued.as_str())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Transitions the live (`queued`/`active`) row for `track_id` to a
    /// terminal status, recording the outcome fields.
    ///
    /// Returns `false` when no live row exists: a second terminal call
    /// for the same attempt finds no transitionable row and becomes a
    /// silent no-op (the at-most-once completion guard).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidStatus`] when `status` is not
    /// terminal, or [`QueueError::Database`] if the update fails.
    #[instrument(skip(self, metadata), fields(track_id, status = %status))]
    pub async fn update_status(
        &self,
        track_id: i64,
        status: QueueStatus,
        error: Option<&str>,
        filename: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(QueueError::invalid_status(
                status.as_str(),
                "only completed/failed may be written here; claiming goes through pop_n",
            ));
        }

        let progress: i64 = if status == QueueStatus::Completed { 100 } else { 0 };
        let metadata_json = metadata.map(serde_json::Value::to_string);

        let result = sqlx::query(
            r"UPDATE queue
              SET status = ?, progress = ?, error = ?, filename = ?, metadata = ?,
                  updated_at = datetime('now')
              WHERE track_id = ? AND status IN (?, ?)",
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(error)
        .bind(filename)
        .bind(metadata_json)
        .bind(track_id)
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Active.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes all rows with the given status.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn clear(&self, status: QueueStatus) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM queue WHERE status = ?")
            .bind(status.as_str())
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Removes the queued row for `track_id`, if one exists.
    ///
    /// Only `queued` rows may be removed this way; an active item runs
    /// to its terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, track_id: i64) -> Result<bool> {
        let result = sqlx::query(r"DELETE FROM queue WHERE track_id = ? AND status = ?")
            .bind(track_id)
            .bind(QueueStatus::Queued.as_str())
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns every retryable failed row to `queued`, resetting error
    /// and progress.
    ///
    /// When a track has several historical failed rows, only the newest
    /// one is requeued; tracks that already have a live row are skipped
    /// so the one-live-row invariant holds.
    ///
    /// # Returns
    ///
    /// The number of rows requeued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn requeue_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE queue
              SET status = ?, error = NULL, progress = 0, updated_at = datetime('now')
              WHERE status = ?
                AND id IN (SELECT MAX(id) FROM queue WHERE status = ? GROUP BY track_id)
                AND track_id NOT IN (
                    SELECT track_id FROM queue WHERE status IN (?, ?)
                )",
        )
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Failed.as_str())
        .bind(QueueStatus::Failed.as_str())
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Active.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns the newest failed row for one track to `queued`.
    ///
    /// # Returns
    ///
    /// `true` if a row was requeued; `false` when the track has no failed
    /// row or already has a live row.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn requeue_one(&self, track_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE queue
              SET status = ?, error = NULL, progress = 0, updated_at = datetime('now')
              WHERE id = (SELECT MAX(id) FROM queue WHERE status = ? AND track_id = ?)
                AND NOT EXISTS (
                    SELECT 1 FROM queue WHERE track_id = ? AND status IN (?, ?)
                )",
        )
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Failed.as_str())
        .bind(track_id)
        .bind(track_id)
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Active.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts items grouped by status. Statuses with no rows map to zero.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn counts_by_status(&self) -> Result<HashMap<QueueStatus, i64>> {
        let rows = sqlx::query(r"SELECT status, COUNT(*) as count FROM queue GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;

        let mut counts: HashMap<QueueStatus, i64> = [
            (QueueStatus::Queued, 0),
            (QueueStatus::Active, 0),
            (QueueStatus::Completed, 0),
            (QueueStatus::Failed, 0),
        ]
        .into_iter()
        .collect();

        for row in rows {
            let status_str: String = row.get("status");
            if let Ok(status) = status_str.parse::<QueueStatus>() {
                counts.insert(status, row.get("count"));
            }
        }

        Ok(counts)
    }

    /// Counts items with one status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let result = sqlx::query(r"SELECT COUNT(*) as count FROM queue WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(result.get("count"))
    }

    /// Returns the live (`queued` or `active`) row for a track, if any.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_live(&self, track_id: i64) -> Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM queue WHERE track_id = ? AND status IN (?, ?) LIMIT 1",
        )
        .bind(track_id)
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Active.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(item)
    }

    /// Lists items with one status, FIFO by enqueue time.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM queue
              WHERE status = ?
              ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Lists the most recently completed items, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn recent_completed(&self, limit: i64) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM queue
              WHERE status = ?
              ORDER BY updated_at DESC, id DESC
              LIMIT ?",
        )
        .bind(QueueStatus::Completed.as_str())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Resets all `active` rows back to `queued`.
    ///
    /// Called at startup for crash recovery - any items left `active`
    /// from a previous process are returned to the queue for
    /// reprocessing (at-least-once semantics).
    ///
    /// # Returns
    ///
    /// The number of rows that were reset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_active(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE queue
              SET status = ?, progress = 0, updated_at = datetime('now')
              WHERE status = ?",
        )
        .bind(QueueStatus::Queued.as_str())
        .bind(QueueStatus::Active.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // Integration tests run against real SQLite - see tests/queue_integration.rs
    // Unit tests here cover only argument validation that needs no database.

    use super::*;

    #[tokio::test]
    async fn test_update_status_rejects_non_terminal_target() {
        let db = Database::new_in_memory().await.unwrap();
        let store = QueueStore::new(db);

        for status in [QueueStatus::Queued, QueueStatus::Active] {
            let result = store.update_status(1, status, None, None, None).await;
            assert!(
                matches!(result, Err(QueueError::InvalidStatus { .. })),
                "expected InvalidStatus for {status}, got {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_pop_n_zero_returns_empty_without_touching_db() {
        let db = Database::new_in_memory().await.unwrap();
        let store = QueueStore::new(db);

        let items = store.pop_n(0).await.unwrap();
        assert!(items.is_empty());
    }
}

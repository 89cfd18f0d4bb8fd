//! Normalized library records for completed downloads.
//!
//! A secondary write target keyed by the catalog's cross-reference IDs.
//! The queue manager writes here best-effort when a download completes;
//! failures are logged by the caller and never affect queue state.

use sqlx::Row;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;
use crate::queue::QueueItem;

/// Errors from library record operations.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// Database operation failed.
    #[error("library database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, LibraryError>;

/// Store for normalized artist/album/track records.
#[derive(Debug, Clone)]
pub struct LibraryStore {
    db: Database,
}

impl LibraryStore {
    /// Creates a new library store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a completed download into the normalized tables.
    ///
    /// Upserts artist, album, and track rows for whichever catalog
    /// cross-reference IDs the item carries; pieces without an ID are
    /// skipped. A track row without its album/artist context is still
    /// written - the library is an index, not a graph with integrity
    /// requirements.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Database`] if a write fails.
    #[instrument(skip(self, item), fields(track_id = item.track_id))]
    pub async fn record_download(&self, item: &QueueItem, filename: &str) -> Result<()> {
        if let Some(artist_id) = item.catalog_artist_id {
            sqlx::query(
                r"INSERT INTO library_artists (catalog_artist_id, name)
                  VALUES (?, ?)
                  ON CONFLICT(catalog_artist_id) DO UPDATE SET
                      name = excluded.name,
                      updated_at = datetime('now')",
            )
            .bind(artist_id)
            .bind(&item.artist)
            .execute(self.db.pool())
            .await?;
        }

        if let Some(album_id) = item.catalog_album_id {
            sqlx::query(
                r"INSERT INTO library_albums (catalog_album_id, catalog_artist_id, title, cover_url)
                  VALUES (?, ?, ?, ?)
                  ON CONFLICT(catalog_album_id) DO UPDATE SET
                      catalog_artist_id = excluded.catalog_artist_id,
                      title = excluded.title,
                      cover_url = excluded.cover_url,
                      updated_at = datetime('now')",
            )
            .bind(album_id)
            .bind(item.catalog_artist_id)
            .bind(item.album.as_deref().unwrap_or(&item.title))
            .bind(&item.cover_url)
            .execute(self.db.pool())
            .await?;
        }

        if let Some(track_id) = item.catalog_track_id {
            sqlx::query(
                r"INSERT INTO library_tracks
                      (catalog_track_id, catalog_album_id, title, track_number, filename)
                  VALUES (?, ?, ?, ?, ?)
                  ON CONFLICT(catalog_track_id) DO UPDATE SET
                      catalog_album_id = excluded.catalog_album_id,
                      title = excluded.title,
                      track_number = excluded.track_number,
                      filename = excluded.filename,
                      downloaded_at = datetime('now')",
            )
            .bind(track_id)
            .bind(item.catalog_album_id)
            .bind(&item.title)
            .bind(item.track_number)
            .bind(filename)
            .execute(self.db.pool())
            .await?;
        }

        Ok(())
    }

    /// Whether a track is already recorded in the library.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn contains_track(&self, catalog_track_id: i64) -> Result<bool> {
        let row = sqlx::query(
            r"SELECT COUNT(*) as count FROM library_tracks WHERE catalog_track_id = ?",
        )
        .bind(catalog_track_id)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Number of tracks recorded in the library.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn track_count(&self) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM library_tracks")
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }
}

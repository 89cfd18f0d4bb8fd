//! Queue item types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be picked up by the processing loop.
    Queued,
    /// Claimed by a worker and currently downloading.
    Active,
    /// Successfully downloaded and organized.
    Completed,
    /// Failed; sits here until retried or cleared.
    Failed,
}

impl QueueStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for the terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// Fine-grained sub-status of an in-flight download.
///
/// Lives only in the queue manager's in-memory active set; it is never
/// persisted because it changes far too frequently to be worth a write
/// per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveStage {
    /// Claimed, resolving a stream URL.
    Starting,
    /// Streaming bytes to disk.
    Downloading,
    /// Post-processing (transcode/tag/organize).
    Transcoding,
}

impl fmt::Display for ActiveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Transcoding => "transcoding",
        };
        write!(f, "{label}")
    }
}

/// Enqueue payload describing one requested track download.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackRequest {
    /// External catalog ID of the track; the queue's dedup identity.
    pub track_id: i64,
    /// Track title.
    pub title: String,
    /// Primary artist name.
    pub artist: String,
    /// Album title, when known.
    pub album: Option<String>,
    /// Album ID in the catalog, when known.
    pub album_id: Option<i64>,
    /// Position within the album.
    pub track_number: Option<i64>,
    /// Cover art reference.
    pub cover_url: Option<String>,
    /// Quality selector passed to the stream endpoint (e.g. "lossless").
    pub quality: Option<String>,
    /// Target transcode container/codec (e.g. "flac", "mp3").
    pub convert_to: Option<String>,
    /// Target transcode bitrate (e.g. "320").
    pub bitrate: Option<String>,
    /// Run the post-processor after download.
    pub run_post_process: bool,
    /// Embed lyrics during post-processing.
    pub embed_lyrics: bool,
    /// Organization template for the final path.
    pub organize_template: Option<String>,
    /// Group compilation albums under a shared artist directory.
    pub group_compilations: bool,
    /// Use the metadata enrichment service during post-processing.
    pub use_enrichment: bool,
    /// Purge the completed record immediately after completion.
    pub auto_clean: bool,
    /// Artist cross-reference ID in the catalog.
    pub catalog_artist_id: Option<i64>,
    /// Album cross-reference ID in the catalog.
    pub catalog_album_id: Option<i64>,
    /// Track cross-reference ID in the catalog.
    pub catalog_track_id: Option<i64>,
    /// Who requested the download.
    pub added_by: Option<String>,
}

impl TrackRequest {
    /// Creates a minimal request with the required identity fields.
    #[must_use]
    pub fn new(track_id: i64, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            track_id,
            title: title.into(),
            artist: artist.into(),
            ..Self::default()
        }
    }
}

/// A single persisted row in the download queue.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueItem {
    /// Unique row identifier.
    pub id: i64,
    /// External catalog ID of the track.
    pub track_id: i64,
    /// Track title.
    pub title: String,
    /// Primary artist name.
    pub artist: String,
    /// Album title, when known.
    pub album: Option<String>,
    /// Album ID in the catalog, when known.
    pub album_id: Option<i64>,
    /// Position within the album.
    pub track_number: Option<i64>,
    /// Cover art reference.
    pub cover_url: Option<String>,
    /// Quality selector passed to the stream endpoint.
    pub quality: Option<String>,
    /// Target transcode container/codec.
    pub convert_to: Option<String>,
    /// Target transcode bitrate.
    pub bitrate: Option<String>,
    /// Run the post-processor after download.
    pub run_post_process: bool,
    /// Embed lyrics during post-processing.
    pub embed_lyrics: bool,
    /// Organization template for the final path.
    pub organize_template: Option<String>,
    /// Group compilation albums under a shared artist directory.
    pub group_compilations: bool,
    /// Use the metadata enrichment service during post-processing.
    pub use_enrichment: bool,
    /// Purge the completed record immediately after completion.
    pub auto_clean: bool,
    /// Artist cross-reference ID in the catalog.
    pub catalog_artist_id: Option<i64>,
    /// Album cross-reference ID in the catalog.
    pub catalog_album_id: Option<i64>,
    /// Track cross-reference ID in the catalog.
    pub catalog_track_id: Option<i64>,
    /// Who requested the download.
    pub added_by: Option<String>,
    /// Current processing status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    /// Persisted progress; written only at terminal transitions.
    pub progress: i64,
    /// Error message when failed.
    pub error: Option<String>,
    /// Final filename when completed.
    pub filename: Option<String>,
    /// JSON metadata recorded at completion.
    pub metadata: Option<String>,
    /// When the item was created (enqueue time; FIFO ordering key).
    pub created_at: String,
    /// When the item was last updated.
    pub updated_at: String,
}

impl QueueItem {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Queued` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.status_str.parse().unwrap_or(QueueStatus::Queued)
    }

    /// Parses the completion metadata JSON, if any.
    #[must_use]
    pub fn parse_metadata(&self) -> Option<serde_json::Value> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, track: {} ({} - {}), status: {} }}",
            self.id,
            self.track_id,
            self.artist,
            self.title,
            self.status()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_item(status: &str) -> QueueItem {
        QueueItem {
            id: 1,
            track_id: 42,
            title: "Song".to_string(),
            artist: "Artist A".to_string(),
            album: None,
            album_id: None,
            track_number: None,
            cover_url: None,
            quality: None,
            convert_to: None,
            bitrate: None,
            run_post_process: false,
            embed_lyrics: false,
            organize_template: None,
            group_compilations: false,
            use_enrichment: false,
            auto_clean: false,
            catalog_artist_id: None,
            catalog_album_id: None,
            catalog_track_id: None,
            added_by: None,
            status_str: status.to_string(),
            progress: 0,
            error: None,
            filename: None,
            metadata: None,
            created_at: "2026-01-01".to_string(),
            updated_at: "2026-01-01".to_string(),
        }
    }

    #[test]
    fn test_queue_status_as_str() {
        assert_eq!(QueueStatus::Queued.as_str(), "queued");
        assert_eq!(QueueStatus::Active.as_str(), "active");
        assert_eq!(QueueStatus::Completed.as_str(), "completed");
        assert_eq!(QueueStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_queue_status_from_str_valid() {
        assert_eq!("queued".parse::<QueueStatus>().unwrap(), QueueStatus::Queued);
        assert_eq!("active".parse::<QueueStatus>().unwrap(), QueueStatus::Active);
        assert_eq!(
            "completed".parse::<QueueStatus>().unwrap(),
            QueueStatus::Completed
        );
        assert_eq!("failed".parse::<QueueStatus>().unwrap(), QueueStatus::Failed);
    }

    #[test]
    fn test_queue_status_from_str_invalid() {
        let result = "paused".parse::<QueueStatus>();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("invalid queue status"));
    }

    #[test]
    fn test_queue_status_is_terminal() {
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Active.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn test_queue_status_serde_roundtrip() {
        let status = QueueStatus::Active;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"active\"");
        let parsed: QueueStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_active_stage_display() {
        assert_eq!(ActiveStage::Starting.to_string(), "starting");
        assert_eq!(ActiveStage::Downloading.to_string(), "downloading");
        assert_eq!(ActiveStage::Transcoding.to_string(), "transcoding");
    }

    #[test]
    fn test_track_request_new_sets_identity() {
        let request = TrackRequest::new(42, "Song", "Artist A");
        assert_eq!(request.track_id, 42);
        assert_eq!(request.title, "Song");
        assert_eq!(request.artist, "Artist A");
        assert!(!request.auto_clean);
        assert!(request.quality.is_none());
    }

    #[test]
    fn test_queue_item_status_parses_correctly() {
        let item = sample_item("active");
        assert_eq!(item.status(), QueueStatus::Active);
    }

    #[test]
    fn test_queue_item_status_fallback_on_invalid() {
        let item = sample_item("garbage");
        assert_eq!(item.status(), QueueStatus::Queued);
    }

    #[test]
    fn test_queue_item_parse_metadata() {
        let mut item = sample_item("completed");
        assert!(item.parse_metadata().is_none());

        item.metadata = Some(r#"{"duration": 215}"#.to_string());
        let parsed = item.parse_metadata().unwrap();
        assert_eq!(parsed["duration"], 215);

        item.metadata = Some("not json".to_string());
        assert!(item.parse_metadata().is_none());
    }

    #[test]
    fn test_queue_item_display() {
        let item = sample_item("queued");
        let display = item.to_string();
        assert!(display.contains("42"));
        assert!(display.contains("Artist A"));
        assert!(display.contains("queued"));
    }
}

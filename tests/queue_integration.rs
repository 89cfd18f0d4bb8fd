//! Integration tests for the queue store.
//!
//! These tests verify QueueStore operations against a real SQLite database.

use std::collections::HashSet;

use tempfile::TempDir;
use tunepool::{Database, QueueStatus, QueueStore, TrackRequest};

/// Helper to create a test database with migrations applied.
///
/// File-based (not in-memory) so concurrency tests exercise the real
/// multi-connection pool.
async fn setup_test_store() -> (QueueStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");

    (QueueStore::new(db), temp_dir)
}

fn request(track_id: i64) -> TrackRequest {
    TrackRequest::new(track_id, format!("Song {track_id}"), "Artist A")
}

// ==================== Enqueue & Dedup ====================

#[tokio::test]
async fn test_add_creates_queued_item() {
    let (store, _temp_dir) = setup_test_store().await;

    let id = store.add(&request(42)).await.expect("Failed to add");
    assert!(id.is_some());

    let item = store.get_live(42).await.unwrap().expect("Expected item");
    assert_eq!(item.track_id, 42);
    assert_eq!(item.status(), QueueStatus::Queued);
    assert_eq!(item.progress, 0);
    assert!(item.error.is_none());
}

#[tokio::test]
async fn test_add_rejects_live_duplicate() {
    let (store, _temp_dir) = setup_test_store().await;

    let first = store.add(&request(7)).await.unwrap();
    let second = store.add(&request(7)).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none(), "Second add should be rejected");

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 1);
}

#[tokio::test]
async fn test_add_rejects_duplicate_while_active() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(7)).await.unwrap();
    let claimed = store.pop_n(1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let second = store.add(&request(7)).await.unwrap();
    assert!(second.is_none(), "Add while active should be rejected");
}

#[tokio::test]
async fn test_add_allows_requeue_after_terminal() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(42)).await.unwrap();
    store.pop_n(1).await.unwrap();
    store
        .update_status(42, QueueStatus::Completed, None, Some("song.flac"), None)
        .await
        .unwrap();

    // A completed historical row does not block a fresh enqueue
    let again = store.add(&request(42)).await.unwrap();
    assert!(again.is_some());

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 1);
    assert_eq!(counts[&QueueStatus::Completed], 1);
}

// ==================== Claiming ====================

#[tokio::test]
async fn test_pop_n_returns_empty_when_nothing_queued() {
    let (store, _temp_dir) = setup_test_store().await;
    let items = store.pop_n(5).await.unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn test_pop_n_claims_fifo_and_marks_active() {
    let (store, _temp_dir) = setup_test_store().await;

    for track_id in [1, 2, 3] {
        store.add(&request(track_id)).await.unwrap();
    }

    let claimed = store.pop_n(2).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].track_id, 1, "Oldest item first");
    assert_eq!(claimed[1].track_id, 2);
    for item in &claimed {
        assert_eq!(item.status(), QueueStatus::Active);
    }

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 1);
    assert_eq!(counts[&QueueStatus::Active], 2);
}

#[tokio::test]
async fn test_pop_n_caps_at_available() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(1)).await.unwrap();
    let claimed = store.pop_n(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
}

#[tokio::test]
async fn test_pop_n_concurrent_callers_get_disjoint_items() {
    let (store, _temp_dir) = setup_test_store().await;

    for track_id in 1..=12 {
        store.add(&request(track_id)).await.unwrap();
    }

    let (a, b, c) = tokio::join!(store.pop_n(5), store.pop_n(5), store.pop_n(5));
    let batches = [a.unwrap(), b.unwrap(), c.unwrap()];

    let mut seen = HashSet::new();
    let mut total = 0;
    for batch in &batches {
        for item in batch {
            total += 1;
            assert!(
                seen.insert(item.track_id),
                "track {} claimed by two callers",
                item.track_id
            );
        }
    }
    assert_eq!(total, 12, "every queued item claimed exactly once");

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 0);
    assert_eq!(counts[&QueueStatus::Active], 12);
}

// ==================== Terminal Transitions ====================

#[tokio::test]
async fn test_update_status_completed_records_outcome() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(42)).await.unwrap();
    store.pop_n(1).await.unwrap();

    let metadata = serde_json::json!({"duration": 215});
    let transitioned = store
        .update_status(
            42,
            QueueStatus::Completed,
            None,
            Some("song.flac"),
            Some(&metadata),
        )
        .await
        .unwrap();
    assert!(transitioned);

    let completed = store.list_by_status(QueueStatus::Completed).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].filename.as_deref(), Some("song.flac"));
    assert_eq!(completed[0].progress, 100);
    assert_eq!(completed[0].parse_metadata().unwrap()["duration"], 215);
}

#[tokio::test]
async fn test_update_status_completed_at_most_once() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(42)).await.unwrap();
    store.pop_n(1).await.unwrap();

    let first = store
        .update_status(42, QueueStatus::Completed, None, Some("song.flac"), None)
        .await
        .unwrap();
    let second = store
        .update_status(42, QueueStatus::Completed, None, Some("song.flac"), None)
        .await
        .unwrap();

    assert!(first, "First completion transitions the row");
    assert!(!second, "Second completion is a silent no-op");

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Completed], 1);
}

#[tokio::test]
async fn test_update_status_failed_records_error() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(42)).await.unwrap();
    store.pop_n(1).await.unwrap();

    let transitioned = store
        .update_status(42, QueueStatus::Failed, Some("stream returned HTTP 403"), None, None)
        .await
        .unwrap();
    assert!(transitioned);

    let failed = store.list_by_status(QueueStatus::Failed).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("stream returned HTTP 403"));
}

#[tokio::test]
async fn test_update_status_missing_track_is_noop() {
    let (store, _temp_dir) = setup_test_store().await;

    let transitioned = store
        .update_status(999, QueueStatus::Failed, Some("nope"), None, None)
        .await
        .unwrap();
    assert!(!transitioned);
}

// ==================== Retry ====================

#[tokio::test]
async fn test_requeue_one_resets_error_and_progress() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(42)).await.unwrap();
    store.pop_n(1).await.unwrap();
    store
        .update_status(42, QueueStatus::Failed, Some("boom"), None, None)
        .await
        .unwrap();

    let requeued = store.requeue_one(42).await.unwrap();
    assert!(requeued);

    let item = store.get_live(42).await.unwrap().expect("Expected queued item");
    assert_eq!(item.status(), QueueStatus::Queued);
    assert!(item.error.is_none(), "Error cleared on retry");
    assert_eq!(item.progress, 0, "Progress reset on retry");

    let failed = store.list_by_status(QueueStatus::Failed).await.unwrap();
    assert!(failed.is_empty(), "No longer in failed");
}

#[tokio::test]
async fn test_requeue_one_without_failed_row_returns_false() {
    let (store, _temp_dir) = setup_test_store().await;

    assert!(!store.requeue_one(42).await.unwrap());

    // A queued row is not retryable either
    store.add(&request(42)).await.unwrap();
    assert!(!store.requeue_one(42).await.unwrap());
}

#[tokio::test]
async fn test_requeue_one_skips_when_track_already_live() {
    let (store, _temp_dir) = setup_test_store().await;

    // Fail an attempt, then enqueue the track again
    store.add(&request(42)).await.unwrap();
    store.pop_n(1).await.unwrap();
    store
        .update_status(42, QueueStatus::Failed, Some("boom"), None, None)
        .await
        .unwrap();
    store.add(&request(42)).await.unwrap();

    // Requeueing the failed row would create a second live row
    assert!(!store.requeue_one(42).await.unwrap());

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 1);
    assert_eq!(counts[&QueueStatus::Failed], 1);
}

#[tokio::test]
async fn test_requeue_failed_returns_all_retryable() {
    let (store, _temp_dir) = setup_test_store().await;

    for track_id in [1, 2, 3] {
        store.add(&request(track_id)).await.unwrap();
    }
    store.pop_n(3).await.unwrap();
    for track_id in [1, 2] {
        store
            .update_status(track_id, QueueStatus::Failed, Some("boom"), None, None)
            .await
            .unwrap();
    }
    store
        .update_status(3, QueueStatus::Completed, None, Some("c.flac"), None)
        .await
        .unwrap();

    let requeued = store.requeue_failed().await.unwrap();
    assert_eq!(requeued, 2);

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 2);
    assert_eq!(counts[&QueueStatus::Failed], 0);
    assert_eq!(counts[&QueueStatus::Completed], 1);
}

#[tokio::test]
async fn test_requeue_failed_uses_newest_attempt_per_track() {
    let (store, _temp_dir) = setup_test_store().await;

    // Two failed attempts for the same track
    for attempt in 0..2 {
        store.add(&request(42)).await.unwrap();
        store.pop_n(1).await.unwrap();
        store
            .update_status(42, QueueStatus::Failed, Some(&format!("boom {attempt}")), None, None)
            .await
            .unwrap();
    }

    let requeued = store.requeue_failed().await.unwrap();
    assert_eq!(requeued, 1, "Only one live row per track");

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 1);
    assert_eq!(counts[&QueueStatus::Failed], 1);
}

// ==================== Bulk & Lifecycle Ops ====================

#[tokio::test]
async fn test_delete_removes_only_queued_rows() {
    let (store, _temp_dir) = setup_test_store().await;

    store.add(&request(1)).await.unwrap();
    assert!(store.delete(1).await.unwrap());
    assert!(store.get_live(1).await.unwrap().is_none());

    // An active row cannot be deleted
    store.add(&request(2)).await.unwrap();
    store.pop_n(1).await.unwrap();
    assert!(!store.delete(2).await.unwrap());
    assert!(store.get_live(2).await.unwrap().is_some());
}

#[tokio::test]
async fn test_clear_removes_only_named_status() {
    let (store, _temp_dir) = setup_test_store().await;

    for track_id in [1, 2, 3] {
        store.add(&request(track_id)).await.unwrap();
    }
    store.pop_n(1).await.unwrap();
    store
        .update_status(1, QueueStatus::Failed, Some("boom"), None, None)
        .await
        .unwrap();

    let cleared = store.clear(QueueStatus::Queued).await.unwrap();
    assert_eq!(cleared, 2);

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 0);
    assert_eq!(counts[&QueueStatus::Failed], 1);
}

#[tokio::test]
async fn test_counts_by_status_zero_fills_missing() {
    let (store, _temp_dir) = setup_test_store().await;

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|&count| count == 0));
}

#[tokio::test]
async fn test_reset_active_returns_stranded_rows_to_queued() {
    let (store, _temp_dir) = setup_test_store().await;

    for track_id in [1, 2] {
        store.add(&request(track_id)).await.unwrap();
    }
    store.pop_n(2).await.unwrap();

    // Simulates a process restart with rows stranded in `active`
    let reset = store.reset_active().await.unwrap();
    assert_eq!(reset, 2);

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts[&QueueStatus::Queued], 2);
    assert_eq!(counts[&QueueStatus::Active], 0);
}

#[tokio::test]
async fn test_recent_completed_limits_and_orders_newest_first() {
    let (store, _temp_dir) = setup_test_store().await;

    for track_id in [1, 2, 3] {
        store.add(&request(track_id)).await.unwrap();
        store.pop_n(1).await.unwrap();
        store
            .update_status(
                track_id,
                QueueStatus::Completed,
                None,
                Some(&format!("{track_id}.flac")),
                None,
            )
            .await
            .unwrap();
    }

    let recent = store.recent_completed(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    // Same-second timestamps fall back to id ordering
    assert_eq!(recent[0].track_id, 3);
    assert_eq!(recent[1].track_id, 2);
}

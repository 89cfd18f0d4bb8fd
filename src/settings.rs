//! Versioned key/value settings service.
//!
//! Settings live in a SQLite table with a version counter per key.
//! Writers pass the version they read; a stale version is rejected with
//! [`SettingsError::VersionConflict`] carrying the current version, so
//! the caller re-reads and retries. This is the only propagated
//! conflict error in the core.

use sqlx::Row;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;
use crate::queue::DEFAULT_MAX_CONCURRENCY;

/// Settings key for the concurrent download ceiling.
pub const KEY_MAX_CONCURRENCY: &str = "max_concurrency";

/// Settings key for the auto-process flag.
pub const KEY_AUTO_PROCESS: &str = "auto_process";

/// Errors from settings operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Database operation failed.
    #[error("settings database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller's expected version is stale; re-read and retry.
    #[error("version conflict on '{key}': current version is {current_version}")]
    VersionConflict {
        /// The contested key.
        key: String,
        /// The version currently stored (0 when the key is absent).
        current_version: i64,
    },

    /// A stored value does not parse as its expected type.
    #[error("invalid value for '{key}': {message}")]
    Invalid {
        /// The offending key.
        key: String,
        /// What went wrong.
        message: String,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// A stored value together with its version counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// The stored value.
    pub value: String,
    /// Version to pass back on the next write.
    pub version: i64,
}

/// Typed view of the queue-related settings, read at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Concurrent download ceiling.
    pub max_concurrency: usize,
    /// Start processing automatically on enqueue/retry.
    pub auto_process: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            auto_process: true,
        }
    }
}

/// SQLite-backed settings store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    /// Creates a new settings store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Reads a setting with its current version.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let row = sqlx::query(r"SELECT value, version FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(|row| VersionedValue {
            value: row.get("value"),
            version: row.get("version"),
        }))
    }

    /// Writes a setting.
    ///
    /// With `expected_version` the write only succeeds when the stored
    /// version matches (optimistic concurrency); without it the write is
    /// an unconditional upsert.
    ///
    /// # Returns
    ///
    /// The new version.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::VersionConflict`] when the expected
    /// version is stale, or [`SettingsError::Database`] on query failure.
    #[instrument(skip(self, value))]
    pub async fn set(&self, key: &str, value: &str, expected_version: Option<i64>) -> Result<i64> {
        match expected_version {
            None => {
                let row = sqlx::query(
                    r"INSERT INTO settings (key, value) VALUES (?, ?)
                      ON CONFLICT(key) DO UPDATE SET
                          value = excluded.value,
                          version = version + 1,
                          updated_at = datetime('now')
                      RETURNING version",
                )
                .bind(key)
                .bind(value)
                .fetch_one(self.db.pool())
                .await?;
                Ok(row.get("version"))
            }
            Some(expected) => {
                let row = sqlx::query(
                    r"UPDATE settings
                      SET value = ?, version = version + 1, updated_at = datetime('now')
                      WHERE key = ? AND version = ?
                      RETURNING version",
                )
                .bind(value)
                .bind(key)
                .bind(expected)
                .fetch_optional(self.db.pool())
                .await?;

                match row {
                    Some(row) => Ok(row.get("version")),
                    None => {
                        let current_version =
                            self.get(key).await?.map_or(0, |current| current.version);
                        Err(SettingsError::VersionConflict {
                            key: key.to_string(),
                            current_version,
                        })
                    }
                }
            }
        }
    }

    /// Reads the typed queue settings, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] when a stored value does not
    /// parse, or [`SettingsError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn queue_settings(&self) -> Result<QueueSettings> {
        let defaults = QueueSettings::default();

        let max_concurrency = match self.get(KEY_MAX_CONCURRENCY).await? {
            Some(stored) => {
                stored
                    .value
                    .parse::<usize>()
                    .map_err(|error| SettingsError::Invalid {
                        key: KEY_MAX_CONCURRENCY.to_string(),
                        message: error.to_string(),
                    })?
            }
            None => defaults.max_concurrency,
        };

        let auto_process = match self.get(KEY_AUTO_PROCESS).await? {
            Some(stored) => {
                stored
                    .value
                    .parse::<bool>()
                    .map_err(|error| SettingsError::Invalid {
                        key: KEY_AUTO_PROCESS.to_string(),
                        message: error.to_string(),
                    })?
            }
            None => defaults.auto_process,
        };

        Ok(QueueSettings {
            max_concurrency,
            auto_process,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> SettingsStore {
        let db = Database::new_in_memory().await.unwrap();
        SettingsStore::new(db)
    }

    #[tokio::test]
    async fn test_get_absent_key_is_none() {
        let store = store().await;
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let store = store().await;

        let version = store.set(KEY_MAX_CONCURRENCY, "5", None).await.unwrap();
        assert_eq!(version, 1);

        let stored = store.get(KEY_MAX_CONCURRENCY).await.unwrap().unwrap();
        assert_eq!(stored.value, "5");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_unconditional_set_bumps_version() {
        let store = store().await;
        store.set("k", "a", None).await.unwrap();
        let version = store.set("k", "b", None).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_set_with_matching_version_succeeds() {
        let store = store().await;
        store.set("k", "a", None).await.unwrap();

        let stored = store.get("k").await.unwrap().unwrap();
        let new_version = store.set("k", "b", Some(stored.version)).await.unwrap();
        assert_eq!(new_version, stored.version + 1);
    }

    #[tokio::test]
    async fn test_set_with_stale_version_conflicts() {
        let store = store().await;
        store.set("k", "a", None).await.unwrap();
        store.set("k", "b", None).await.unwrap();

        let result = store.set("k", "c", Some(1)).await;
        match result {
            Err(SettingsError::VersionConflict {
                key,
                current_version,
            }) => {
                assert_eq!(key, "k");
                assert_eq!(current_version, 2);
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_versioned_on_absent_key_conflicts_with_zero() {
        let store = store().await;
        let result = store.set("missing", "v", Some(3)).await;
        match result {
            Err(SettingsError::VersionConflict {
                current_version, ..
            }) => assert_eq!(current_version, 0),
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queue_settings_defaults_when_unset() {
        let store = store().await;
        let settings = store.queue_settings().await.unwrap();
        assert_eq!(settings, QueueSettings::default());
        assert_eq!(settings.max_concurrency, 3);
        assert!(settings.auto_process);
    }

    #[tokio::test]
    async fn test_queue_settings_reads_stored_values() {
        let store = store().await;
        store.set(KEY_MAX_CONCURRENCY, "8", None).await.unwrap();
        store.set(KEY_AUTO_PROCESS, "false", None).await.unwrap();

        let settings = store.queue_settings().await.unwrap();
        assert_eq!(settings.max_concurrency, 8);
        assert!(!settings.auto_process);
    }

    #[tokio::test]
    async fn test_queue_settings_rejects_unparseable_value() {
        let store = store().await;
        store.set(KEY_MAX_CONCURRENCY, "lots", None).await.unwrap();

        let result = store.queue_settings().await;
        assert!(matches!(result, Err(SettingsError::Invalid { .. })));
    }
}

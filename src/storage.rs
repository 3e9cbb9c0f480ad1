//! Key/value persistence for Streamgauge.
//!
//! All persisted state is a handful of string keys holding either a plain
//! string (`"true"`, `"720p"`) or a JSON document. The [`KeyValueStore`]
//! trait is the seam every store is written against so backends can be
//! swapped in tests:
//!
//! - [`SqliteStore`]: durable SQLite table, survives restarts
//! - [`MemoryStore`]: process-local map, used in tests and as the degraded
//!   backend when SQLite cannot be opened
//! - [`Storage`]: runtime choice between the two
//!
//! Missing or malformed values are never errors for callers; see
//! [`load_json`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

/// Key holding the low-bandwidth toggle (`"true"` / `"false"`).
pub const LOW_BANDWIDTH_MODE_KEY: &str = "low-bandwidth-mode";
/// Key holding the pinned quality, absent when cleared.
pub const QUALITY_OVERRIDE_KEY: &str = "quality-override";
/// Key holding the JSON-encoded `BandwidthSettings`.
pub const BANDWIDTH_SETTINGS_KEY: &str = "bandwidth-settings";
/// Key holding the JSON-encoded `DataUsageStats`.
pub const DATA_USAGE_STATS_KEY: &str = "data-usage-stats";

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A string-keyed, string-valued persistent map.
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// SQLite-backed key/value table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database and create the table if needed.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:streamgauge.db?mode=rwc" or "sqlite::memory:")
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // A single connection keeps `sqlite::memory:` pointing at one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Process-local key/value map. Contents are lost when the process exits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Backend selected at startup.
#[derive(Clone)]
pub enum Storage {
    Sqlite(SqliteStore),
    Memory(MemoryStore),
}

impl Storage {
    /// Open SQLite at `database_url`, degrading to an in-memory map for the
    /// lifetime of the process when that fails.
    pub async fn connect_or_memory(database_url: &str) -> Self {
        match SqliteStore::connect(database_url).await {
            Ok(store) => {
                info!(database_url, "Persistent storage opened");
                Storage::Sqlite(store)
            }
            Err(e) => {
                warn!(
                    database_url,
                    error = %e,
                    "Persistent storage unavailable, falling back to in-memory storage"
                );
                Storage::Memory(MemoryStore::new())
            }
        }
    }

    pub fn in_memory() -> Self {
        Storage::Memory(MemoryStore::new())
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Storage::Sqlite(_))
    }
}

impl KeyValueStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self {
            Storage::Sqlite(store) => store.get(key).await,
            Storage::Memory(store) => store.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        match self {
            Storage::Sqlite(store) => store.set(key, value).await,
            Storage::Memory(store) => store.set(key, value).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match self {
            Storage::Sqlite(store) => store.remove(key).await,
            Storage::Memory(store) => store.remove(key).await,
        }
    }
}

/// Backend whose database has gone away: reads find nothing and every
/// write fails.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct ClosedStore;

#[cfg(test)]
impl KeyValueStore for ClosedStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Database(sqlx::Error::PoolClosed))
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Database(sqlx::Error::PoolClosed))
    }
}

/// Read and decode a JSON value.
///
/// Returns `None` when the key is absent, the backend fails, or the stored
/// text does not decode. The latter two are logged; the caller falls back
/// to defaults and the next write re-initializes the entry.
pub async fn load_json<S, T>(store: &S, key: &str) -> Option<T>
where
    S: KeyValueStore,
    T: DeserializeOwned,
{
    let raw = load_raw(store, key).await?;

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "Discarding malformed stored value");
            None
        }
    }
}

/// Read a raw string value, logging backend failures as absent.
pub async fn load_raw<S: KeyValueStore>(store: &S, key: &str) -> Option<String> {
    match store.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Failed to read stored value");
            None
        }
    }
}

/// Encode `value` as JSON and write it under `key`.
pub async fn save_json<S, T>(store: &S, key: &str, value: &T) -> Result<(), StorageError>
where
    S: KeyValueStore,
    T: Serialize,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_set_get_remove() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();

        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("kv.db").to_string_lossy()
        );

        {
            let store = SqliteStore::connect(&url).await.unwrap();
            store.set(LOW_BANDWIDTH_MODE_KEY, "true").await.unwrap();
        }

        let reopened = SqliteStore::connect(&url).await.unwrap();
        assert_eq!(
            reopened.get(LOW_BANDWIDTH_MODE_KEY).await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();

        let shared = store.clone();
        assert_eq!(shared.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_load_json_malformed_is_none() {
        let store = MemoryStore::new();
        store.set(BANDWIDTH_SETTINGS_KEY, "{not json").await.unwrap();

        let loaded: Option<serde_json::Value> = load_json(&store, BANDWIDTH_SETTINGS_KEY).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_connect_or_memory_degrades() {
        let storage = Storage::connect_or_memory("sqlite:/nonexistent-dir/a/b/c.db").await;
        assert!(!storage.is_persistent());

        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
    }
}

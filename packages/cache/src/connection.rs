//! Connection/session manager for a single storage file.
//!
//! A [`Connection`] owns one lazily-bound `SQLite` pool. Every operation
//! acquires a pooled physical connection scoped to its task for the duration
//! of exactly one transaction; independent callers never share a physical
//! connection mid-operation. Storage pragmas are applied once per physical
//! connection at creation, and the row/metadata schema is bootstrapped on
//! first bind.
//!
//! Live pools never cross process boundaries: [`ConnectionDescriptor`] is the
//! serializable form (path, timeout, settings) from which an equivalent
//! manager is reconstructed elsewhere.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use stockpile_core::EvictionPolicy;
use tracing::debug;

use crate::error::Result;
use crate::settings::Settings;

/// Physical connections kept per engine. SQLite serializes writers per file
/// anyway; a handful of connections covers concurrent readers under WAL.
const MAX_POOL_CONNECTIONS: u32 = 8;

/// Row, metadata, and settings schema, bootstrapped on first bind.
///
/// `count`/`size` are trigger-maintained so `len()` and `volume()` are O(1)
/// reads and size-limit checks see every mutation.
const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS cache (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    key_hash INTEGER NOT NULL,
    raw_key BLOB NOT NULL,
    store_time REAL NOT NULL,
    expire_time REAL,
    access_time REAL NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0,
    tags TEXT,
    size INTEGER NOT NULL DEFAULT 0,
    mode INTEGER NOT NULL DEFAULT 0,
    filename TEXT,
    value BLOB
);
CREATE UNIQUE INDEX IF NOT EXISTS cache_key_idx ON cache (key_hash, raw_key);
CREATE INDEX IF NOT EXISTS cache_expire_idx ON cache (expire_time);
CREATE INDEX IF NOT EXISTS cache_store_idx ON cache (store_time);
CREATE INDEX IF NOT EXISTS cache_access_idx ON cache (access_time);
CREATE INDEX IF NOT EXISTS cache_access_count_idx ON cache (access_count);
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO metadata (key, value) VALUES
    ('count', 0), ('size', 0), ('hits', 0), ('misses', 0);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TRIGGER IF NOT EXISTS cache_insert_meta AFTER INSERT ON cache
BEGIN
    UPDATE metadata SET value = value + 1 WHERE key = 'count';
    UPDATE metadata SET value = value + NEW.size WHERE key = 'size';
END;
CREATE TRIGGER IF NOT EXISTS cache_update_meta AFTER UPDATE ON cache
BEGIN
    UPDATE metadata SET value = value + NEW.size - OLD.size WHERE key = 'size';
END;
CREATE TRIGGER IF NOT EXISTS cache_delete_meta AFTER DELETE ON cache
BEGIN
    UPDATE metadata SET value = value - 1 WHERE key = 'count';
    UPDATE metadata SET value = value - OLD.size WHERE key = 'size';
END;
";

/// Serializable descriptor sufficient to reconstruct an equivalent manager
/// in another thread or process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Path of the storage file.
    pub path: PathBuf,
    /// Busy timeout and overall per-operation retry deadline.
    pub timeout: Duration,
    /// Engine settings at description time.
    pub settings: Settings,
}

/// Owns the storage engine handle for a single storage file.
pub struct Connection {
    path: PathBuf,
    timeout: Duration,
    settings: RwLock<Settings>,
    pool: ArcSwapOption<SqlitePool>,
    bind_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Creates an unbound manager; the pool is bound lazily on first use.
    #[must_use]
    pub fn new(path: PathBuf, timeout: Duration, settings: Settings) -> Self {
        Self {
            path,
            timeout,
            settings: RwLock::new(settings),
            pool: ArcSwapOption::new(None),
            bind_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reconstructs a manager from a descriptor. The new manager shares no
    /// live state with the one that produced the descriptor.
    #[must_use]
    pub fn from_descriptor(descriptor: ConnectionDescriptor) -> Self {
        Self::new(descriptor.path, descriptor.timeout, descriptor.settings)
    }

    /// Serializable descriptor of this manager.
    #[must_use]
    pub fn describe(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            path: self.path.clone(),
            timeout: self.timeout,
            settings: self.settings.read().clone(),
        }
    }

    /// Path of the storage file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Busy timeout, also the per-operation retry deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Snapshot of the current settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Whether reads currently update the hit/miss counters.
    #[must_use]
    pub fn statistics(&self) -> bool {
        self.settings.read().statistics
    }

    /// Flips the statistics flag without rebinding handles.
    pub fn set_statistics(&self, enable: bool) {
        self.settings.write().statistics = enable;
    }

    /// Eviction helper derived from current settings: yields the
    /// access-bookkeeping statement and cull-ordering query for the policy.
    #[must_use]
    pub fn eviction(&self) -> EvictionPolicy {
        self.settings.read().eviction_policy
    }

    /// The bound pool, binding it (and bootstrapping the schema) on first
    /// use after construction, `close`, or `update_settings`.
    pub async fn pool(&self) -> Result<SqlitePool> {
        if let Some(pool) = self.pool.load_full() {
            return Ok((*pool).clone());
        }
        let _guard = self.bind_lock.lock().await;
        if let Some(pool) = self.pool.load_full() {
            return Ok((*pool).clone());
        }
        let pool = self.bind().await?;
        self.pool.store(Some(Arc::new(pool.clone())));
        Ok(pool)
    }

    async fn bind(&self) -> Result<SqlitePool> {
        let settings = self.settings.read().clone();
        let options = settings.sqlite.connect_options(&self.path, self.timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(options)
            .await?;

        // Schema bootstrap races with other processes opening the same
        // directory; IF NOT EXISTS keeps it idempotent and the immediate
        // transaction keeps it single-writer.
        let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
        let json = serde_json::to_string(&settings)?;
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES ('settings', ?1)")
            .bind(json)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(path = %self.path.display(), "storage bound");
        Ok(pool)
    }

    /// Begins one IMMEDIATE transaction on a connection scoped to the
    /// calling task. The write lock is taken up front, bounded by the busy
    /// timeout; dropping the transaction without commit rolls it back.
    pub async fn transaction(&self) -> Result<Transaction<'static, Sqlite>> {
        let pool = self.pool().await?;
        Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Disposes the pool and all cached physical connections. The next
    /// operation rebinds lazily.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.swap(None) {
            pool.close().await;
            debug!(path = %self.path.display(), "storage closed");
        }
    }

    /// Replaces the settings wholesale, closing open handles. The next
    /// operation rebinds with the new pragmas and persists the new settings
    /// row; existing rows' bookkeeping fields are never recomputed.
    pub async fn update_settings(&self, settings: Settings) {
        self.close().await;
        *self.settings.write() = settings;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("bound", &self.pool.load().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn manager(dir: &TempDir) -> Connection {
        Connection::new(
            dir.path().join("cache.db"),
            Duration::from_secs(5),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn bind_creates_schema_and_seed_counters() {
        let dir = TempDir::new().unwrap();
        let conn = manager(&dir);
        let pool = conn.pool().await.unwrap();

        let row: (i64,) =
            sqlx::query_as("SELECT value FROM metadata WHERE key = 'count'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn triggers_maintain_count_and_size() {
        let dir = TempDir::new().unwrap();
        let conn = manager(&dir);
        let pool = conn.pool().await.unwrap();

        sqlx::query(
            "INSERT INTO cache (key_hash, raw_key, store_time, size) VALUES (1, x'01', 0, 100)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let (count,): (i64,) =
            sqlx::query_as("SELECT value FROM metadata WHERE key = 'count'")
                .fetch_one(&pool)
                .await
                .unwrap();
        let (size,): (i64,) = sqlx::query_as("SELECT value FROM metadata WHERE key = 'size'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((count, size), (1, 100));

        sqlx::query("UPDATE cache SET size = 40 WHERE key_hash = 1")
            .execute(&pool)
            .await
            .unwrap();
        let (size,): (i64,) = sqlx::query_as("SELECT value FROM metadata WHERE key = 'size'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(size, 40);

        sqlx::query("DELETE FROM cache WHERE key_hash = 1")
            .execute(&pool)
            .await
            .unwrap();
        let (count,): (i64,) =
            sqlx::query_as("SELECT value FROM metadata WHERE key = 'count'")
                .fetch_one(&pool)
                .await
                .unwrap();
        let (size,): (i64,) = sqlx::query_as("SELECT value FROM metadata WHERE key = 'size'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((count, size), (0, 0));
    }

    #[tokio::test]
    async fn close_then_reuse_rebinds() {
        let dir = TempDir::new().unwrap();
        let conn = manager(&dir);
        conn.pool().await.unwrap();
        conn.close().await;
        // Lazily rebinds on next use.
        conn.pool().await.unwrap();
    }

    #[tokio::test]
    async fn update_settings_replaces_wholesale() {
        let dir = TempDir::new().unwrap();
        let conn = manager(&dir);
        conn.pool().await.unwrap();

        let mut settings = conn.settings();
        settings.statistics = true;
        settings.eviction_policy = EvictionPolicy::LeastRecentlyUsed;
        conn.update_settings(settings).await;

        assert!(conn.statistics());
        assert_eq!(conn.eviction(), EvictionPolicy::LeastRecentlyUsed);
        conn.pool().await.unwrap();
    }

    #[tokio::test]
    async fn descriptor_round_trips_through_json() {
        let dir = TempDir::new().unwrap();
        let conn = manager(&dir);
        let descriptor = conn.describe();
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: ConnectionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);

        let rebuilt = Connection::from_descriptor(back);
        assert_eq!(rebuilt.path(), conn.path());
        assert_eq!(rebuilt.timeout(), conn.timeout());
        rebuilt.pool().await.unwrap();
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_drop() {
        let dir = TempDir::new().unwrap();
        let conn = manager(&dir);

        {
            let mut tx = conn.transaction().await.unwrap();
            sqlx::query(
                "INSERT INTO cache (key_hash, raw_key, store_time, size) VALUES (2, x'02', 0, 5)",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
            // Dropped without commit.
        }

        let pool = conn.pool().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}

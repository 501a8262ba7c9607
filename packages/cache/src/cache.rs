//! Single-directory cache engine: row schema and the full operation set.
//!
//! A [`Cache`] owns one directory holding the storage file and backing-value
//! files. Every operation executes inside exactly one IMMEDIATE transaction
//! (read-only fast paths are single statements), encodes/decodes payloads
//! through the [`Disk`] codec, and consults the eviction policy for
//! bookkeeping and cull ordering. Lock contention follows the retry
//! contract: `retry = false` converts contention into the operation's
//! natural empty result, `retry = true` re-attempts until the connection
//! timeout elapses and then fails with a Timeout error.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use stockpile_core::types::{from_msgpack, to_msgpack};
use stockpile_core::{CacheMode, Container, FilterMethod, Stats, Value};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionDescriptor};
use crate::disk::{tags_from_column, tags_to_column, Disk, ValuePayload};
use crate::error::{CacheError, Result};
use crate::settings::Settings;

/// Storage file name inside the cache directory.
const DB_FILE_NAME: &str = "cache.db";

/// Keys fetched per page during lazy iteration.
const ITER_PAGE: usize = 100;

/// Pause between re-attempts once the storage layer reported contention.
const RETRY_DELAY: Duration = Duration::from_millis(5);

const UPSERT_SQL: &str = "\
INSERT INTO cache (key_hash, raw_key, store_time, expire_time, access_time, \
 access_count, tags, size, mode, filename, value)
VALUES (?1, ?2, ?3, ?4, ?3, 0, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT (key_hash, raw_key) DO UPDATE SET
    store_time = excluded.store_time,
    expire_time = excluded.expire_time,
    access_time = excluded.access_time,
    access_count = 0,
    tags = excluded.tags,
    size = excluded.size,
    mode = excluded.mode,
    filename = excluded.filename,
    value = excluded.value";

/// Conditional upsert backing `add`: the update arm only fires when the
/// existing row is already expired, so exactly one concurrent caller wins a
/// fresh key in a single atomic statement.
const ADD_SQL: &str = "\
INSERT INTO cache (key_hash, raw_key, store_time, expire_time, access_time, \
 access_count, tags, size, mode, filename, value)
VALUES (?1, ?2, ?3, ?4, ?3, 0, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT (key_hash, raw_key) DO UPDATE SET
    store_time = excluded.store_time,
    expire_time = excluded.expire_time,
    access_time = excluded.access_time,
    access_count = 0,
    tags = excluded.tags,
    size = excluded.size,
    mode = excluded.mode,
    filename = excluded.filename,
    value = excluded.value
WHERE cache.expire_time IS NOT NULL AND cache.expire_time <= ?3";

const SELECT_ROW_SQL: &str = "\
SELECT rowid, store_time, expire_time, tags, size, mode, filename, value
FROM cache WHERE key_hash = ?1 AND raw_key = ?2";

/// Construction-time configuration for a cache engine.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Busy timeout and per-operation retry deadline. `None` means the
    /// default of 60 seconds.
    pub timeout: Option<Duration>,
    /// Engine settings.
    pub settings: Settings,
}

impl CacheConfig {
    fn timeout_or_default(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(60))
    }
}

/// Disk and file backed cache engine for one directory.
pub struct Cache {
    directory: PathBuf,
    disk: RwLock<Arc<dyn Disk>>,
    conn: Arc<Connection>,
}

/// Current wall-clock time as seconds since the Unix epoch.
fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn is_live(expire_time: Option<f64>, now: f64) -> bool {
    expire_time.map_or(true, |at| at > now)
}

/// Decoded `cache` row, minus the key columns the caller already holds.
struct RowData {
    rowid: i64,
    expire_time: Option<f64>,
    tags: Option<String>,
    mode: CacheMode,
    filename: Option<String>,
    inline: Option<Vec<u8>>,
}

fn decode_row(row: &SqliteRow) -> Result<RowData> {
    let mode_raw: i64 = row.try_get("mode")?;
    let mode = CacheMode::from_column(mode_raw)
        .ok_or_else(|| CacheError::codec(format!("unknown mode column value {mode_raw}")))?;
    Ok(RowData {
        rowid: row.try_get("rowid")?,
        expire_time: row.try_get("expire_time")?,
        tags: row.try_get("tags")?,
        mode,
        filename: row.try_get("filename")?,
        inline: row.try_get("value")?,
    })
}

async fn metadata_value<'e, E>(executor: E, key: &str) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (value,): (i64,) = sqlx::query_as("SELECT value FROM metadata WHERE key = ?1")
        .bind(key)
        .fetch_one(executor)
        .await?;
    Ok(value)
}

async fn bump_metadata(
    tx: &mut Transaction<'static, Sqlite>,
    key: &str,
    delta: i64,
) -> Result<()> {
    sqlx::query("UPDATE metadata SET value = value + ?1 WHERE key = ?2")
        .bind(delta)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn delete_rows(tx: &mut Transaction<'static, Sqlite>, rowids: &[i64]) -> Result<()> {
    if rowids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; rowids.len()].join(", ");
    let sql = format!("DELETE FROM cache WHERE rowid IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for rowid in rowids {
        query = query.bind(rowid);
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

/// Set-membership condition over the JSON `tags` column, with placeholders
/// `?1..?n` for the queried tags.
fn tag_condition(method: FilterMethod, tag_count: usize) -> String {
    let placeholders = (1..=tag_count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    match method {
        FilterMethod::Or => format!(
            "EXISTS (SELECT 1 FROM json_each(cache.tags) \
             WHERE json_each.value IN ({placeholders}))"
        ),
        FilterMethod::And => format!(
            "(SELECT COUNT(*) FROM json_each(cache.tags) \
             WHERE json_each.value IN ({placeholders})) = {tag_count}"
        ),
    }
}

impl Cache {
    /// Opens (creating if necessary) a cache engine over `directory`.
    ///
    /// The storage handle is bound eagerly so construction-time errors — an
    /// unreadable directory, invalid pragmas — surface here rather than on
    /// the first operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the storage
    /// file cannot be opened.
    pub async fn open(directory: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        config.settings.validate()?;
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        let disk = config.settings.disk.create(&directory);
        let conn = Arc::new(Connection::new(
            directory.join(DB_FILE_NAME),
            config.timeout_or_default(),
            config.settings,
        ));
        conn.pool().await?;
        Ok(Self {
            directory,
            disk: RwLock::new(disk),
            conn,
        })
    }

    /// Reconstructs an equivalent engine from a serializable descriptor
    /// (typically produced in another process).
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor's path has no parent directory or
    /// opening fails.
    pub async fn from_descriptor(descriptor: ConnectionDescriptor) -> Result<Self> {
        let directory = descriptor
            .path
            .parent()
            .map(std::path::Path::to_path_buf)
            .ok_or_else(|| CacheError::value("descriptor path has no parent directory"))?;
        Self::open(
            directory,
            CacheConfig {
                timeout: Some(descriptor.timeout),
                settings: descriptor.settings,
            },
        )
        .await
    }

    /// Serializable descriptor of this engine's session manager.
    #[must_use]
    pub fn describe(&self) -> ConnectionDescriptor {
        self.conn.describe()
    }

    /// The engine directory.
    #[must_use]
    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    /// The value codec currently in use.
    #[must_use]
    pub fn disk(&self) -> Arc<dyn Disk> {
        self.disk.read().clone()
    }

    /// The session manager.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Snapshot of the current settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.conn.settings()
    }

    /// Replaces the settings wholesale: closes open storage handles, rebinds
    /// lazily, and swaps the codec. Existing rows are never recomputed.
    pub async fn update_settings(&self, settings: Settings) {
        self.conn.update_settings(settings.clone()).await;
        *self.disk.write() = settings.disk.create(&self.directory);
    }

    /// Disposes all storage handles. The engine remains usable; the next
    /// operation rebinds lazily.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    fn key_parts(&self, key: &Value) -> Result<(i64, Vec<u8>)> {
        let disk = self.disk();
        let raw = disk.encode_key(key)?;
        #[allow(clippy::cast_possible_wrap)]
        let hash = disk.hash(key)? as i64;
        Ok((hash, raw))
    }

    /// Runs `attempt` under the retry contract. On contention: without
    /// `retry` the `fallback` value (the operation's natural empty result)
    /// is returned when one exists; with `retry` the attempt loops until the
    /// connection timeout elapses.
    async fn with_retry<T, Fut>(
        &self,
        retry: bool,
        fallback: Option<T>,
        mut attempt: impl FnMut() -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = self.conn.timeout();
        let mut fallback = fallback;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_contention() => {
                    if !retry {
                        return match fallback.take() {
                            Some(value) => Ok(value),
                            None => Err(CacheError::timeout(started.elapsed(), 0)),
                        };
                    }
                    if started.elapsed() >= deadline {
                        return Err(CacheError::timeout(started.elapsed(), 0));
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn remove_files(&self, filenames: &[String]) {
        let disk = self.disk();
        for name in filenames {
            if let Err(err) = disk.remove(name).await {
                warn!(%name, %err, "failed to remove backing file");
            }
        }
    }

    // --- Key-addressed operations ---

    /// Reads a key. A miss (absent or expired row) records a miss when
    /// statistics are enabled and returns a default container; a hit applies
    /// policy bookkeeping, records a hit, and returns the stored value.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `retry` exhausted the deadline, or a storage
    /// error unrelated to contention.
    pub async fn get(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        let (hash, raw) = self.key_parts(key)?;
        let fallback = Container::miss(default.clone());
        self.with_retry(retry, Some(fallback), || {
            self.try_get(key, hash, &raw, &default)
        })
        .await
    }

    async fn try_get(
        &self,
        key: &Value,
        hash: i64,
        raw: &[u8],
        default: &Option<Value>,
    ) -> Result<Container> {
        let now = now_secs();
        let pool = self.conn.pool().await?;
        let row = sqlx::query(SELECT_ROW_SQL)
            .bind(hash)
            .bind(raw)
            .fetch_optional(&pool)
            .await?;
        let data = match row {
            Some(ref row) => Some(decode_row(row)?),
            None => None,
        };
        let statistics = self.conn.statistics();
        let policy = self.conn.eviction();

        let Some(data) = data.filter(|d| is_live(d.expire_time, now)) else {
            if statistics {
                let mut tx = self.conn.transaction().await?;
                bump_metadata(&mut tx, "misses", 1).await?;
                tx.commit().await?;
            }
            return Ok(Container::miss(default.clone()));
        };

        if statistics || policy.tracks_access() {
            let mut tx = self.conn.transaction().await?;
            if statistics {
                bump_metadata(&mut tx, "hits", 1).await?;
            }
            if let Some(sql) = policy.touch_sql() {
                sqlx::query(sql)
                    .bind(now)
                    .bind(data.rowid)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }

        let disk = self.disk();
        let value = match disk
            .fetch(data.mode, data.filename.as_deref(), data.inline.as_deref())
            .await
        {
            Ok(value) => value,
            Err(CacheError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                // The row was deleted under us after the select; a miss, not
                // a failure.
                debug!(?key, "backing file vanished mid-read");
                return Ok(Container::miss(default.clone()));
            }
            Err(err) => return Err(err),
        };
        Ok(Container::hit(
            key.clone(),
            value,
            data.expire_time,
            tags_from_column(data.tags.as_deref())?,
        ))
    }

    /// Stores a value, replacing any previous row and backing file for this
    /// key, then culls one batch if the volume exceeds the size limit.
    ///
    /// Returns `false` (not an error) on unresolved lock contention when
    /// `retry` is off.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `retry` exhausted the deadline, or a storage
    /// error unrelated to contention.
    pub async fn set(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        let (hash, raw) = self.key_parts(key)?;
        let now = now_secs();
        let expire_time = expire.map(|ttl| now + ttl.as_secs_f64());
        let tags_column = tags_to_column(tags.as_ref())?;
        let payload = self.disk().store(value, Some(key)).await?;

        let outcome = self
            .with_retry(retry, Some(None), || {
                self.try_set(hash, &raw, now, expire_time, &tags_column, &payload)
            })
            .await;
        match outcome {
            Ok(Some(cleanup)) => {
                self.remove_files(&cleanup).await;
                Ok(true)
            }
            Ok(None) => {
                // Contention swallowed the write; drop the file written for
                // this attempt.
                if let Some(name) = &payload.filename {
                    self.remove_files(std::slice::from_ref(name)).await;
                }
                Ok(false)
            }
            Err(err) => {
                if let Some(name) = &payload.filename {
                    self.remove_files(std::slice::from_ref(name)).await;
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn try_set(
        &self,
        hash: i64,
        raw: &[u8],
        now: f64,
        expire_time: Option<f64>,
        tags_column: &Option<String>,
        payload: &ValuePayload,
    ) -> Result<Option<Vec<String>>> {
        let mut tx = self.conn.transaction().await?;
        let mut cleanup = Vec::new();

        let previous: Option<(Option<String>,)> =
            sqlx::query_as("SELECT filename FROM cache WHERE key_hash = ?1 AND raw_key = ?2")
                .bind(hash)
                .bind(raw)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((Some(name),)) = previous {
            cleanup.push(name);
        }

        sqlx::query(UPSERT_SQL)
            .bind(hash)
            .bind(raw)
            .bind(now)
            .bind(expire_time)
            .bind(tags_column)
            .bind(payload.size as i64)
            .bind(payload.mode.as_column())
            .bind(&payload.filename)
            .bind(&payload.inline)
            .execute(&mut *tx)
            .await?;

        self.cull_batch(&mut tx, &mut cleanup).await?;
        tx.commit().await?;
        Ok(Some(cleanup))
    }

    /// Inserts only if the key is absent or its row is expired, atomically:
    /// a single conditional upsert decides the winner, so exactly one of any
    /// number of concurrent callers succeeds for a fresh key.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `retry` exhausted the deadline, or a storage
    /// error unrelated to contention.
    pub async fn add(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        let (hash, raw) = self.key_parts(key)?;
        let now = now_secs();
        let expire_time = expire.map(|ttl| now + ttl.as_secs_f64());
        let tags_column = tags_to_column(tags.as_ref())?;
        let payload = self.disk().store(value, Some(key)).await?;

        let outcome = self
            .with_retry(retry, Some(None), || {
                self.try_add(hash, &raw, now, expire_time, &tags_column, &payload)
            })
            .await;
        match outcome {
            Ok(Some(cleanup)) => {
                self.remove_files(&cleanup).await;
                Ok(true)
            }
            Ok(None) => {
                if let Some(name) = &payload.filename {
                    self.remove_files(std::slice::from_ref(name)).await;
                }
                Ok(false)
            }
            Err(err) => {
                if let Some(name) = &payload.filename {
                    self.remove_files(std::slice::from_ref(name)).await;
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn try_add(
        &self,
        hash: i64,
        raw: &[u8],
        now: f64,
        expire_time: Option<f64>,
        tags_column: &Option<String>,
        payload: &ValuePayload,
    ) -> Result<Option<Vec<String>>> {
        let mut tx = self.conn.transaction().await?;
        let mut cleanup = Vec::new();

        // Only for cleanup: if an expired row is about to be overwritten,
        // its backing file must go. The winner decision itself is the
        // conditional upsert below, not this read.
        let previous: Option<(Option<String>, Option<f64>)> = sqlx::query_as(
            "SELECT filename, expire_time FROM cache WHERE key_hash = ?1 AND raw_key = ?2",
        )
        .bind(hash)
        .bind(raw)
        .fetch_optional(&mut *tx)
        .await?;

        let result = sqlx::query(ADD_SQL)
            .bind(hash)
            .bind(raw)
            .bind(now)
            .bind(expire_time)
            .bind(tags_column)
            .bind(payload.size as i64)
            .bind(payload.mode.as_column())
            .bind(&payload.filename)
            .bind(&payload.inline)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            // A live row won; nothing changed.
            return Ok(None);
        }

        if let Some((Some(name), expire)) = previous {
            if !is_live(expire, now) {
                cleanup.push(name);
            }
        }
        self.cull_batch(&mut tx, &mut cleanup).await?;
        tx.commit().await?;
        Ok(Some(cleanup))
    }

    /// Removes a row and its backing file. Returns `false` if no live row
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `retry` exhausted the deadline, or a storage
    /// error unrelated to contention.
    pub async fn delete(&self, key: &Value, retry: bool) -> Result<bool> {
        let (hash, raw) = self.key_parts(key)?;
        let outcome = self
            .with_retry(retry, Some(None), || self.try_delete(hash, &raw))
            .await?;
        match outcome {
            Some((deleted, filename)) => {
                if let Some(name) = filename {
                    self.remove_files(&[name]).await;
                }
                Ok(deleted)
            }
            None => Ok(false),
        }
    }

    async fn try_delete(&self, hash: i64, raw: &[u8]) -> Result<Option<(bool, Option<String>)>> {
        let now = now_secs();
        let mut tx = self.conn.transaction().await?;
        let removed: Option<(Option<String>,)> = sqlx::query_as(
            "DELETE FROM cache WHERE key_hash = ?1 AND raw_key = ?2 \
             AND (expire_time IS NULL OR expire_time > ?3) RETURNING filename",
        )
        .bind(hash)
        .bind(raw)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(match removed {
            Some((filename,)) => (true, filename),
            None => (false, None),
        }))
    }

    /// Updates only the expiry of a live row. Returns `false` if no live row
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `retry` exhausted the deadline, or a storage
    /// error unrelated to contention.
    pub async fn touch(
        &self,
        key: &Value,
        expire: Option<Duration>,
        retry: bool,
    ) -> Result<bool> {
        let (hash, raw) = self.key_parts(key)?;
        self.with_retry(retry, Some(false), || self.try_touch(hash, &raw, expire))
            .await
    }

    async fn try_touch(&self, hash: i64, raw: &[u8], expire: Option<Duration>) -> Result<bool> {
        let now = now_secs();
        let expire_time = expire.map(|ttl| now + ttl.as_secs_f64());
        let pool = self.conn.pool().await?;
        let result = sqlx::query(
            "UPDATE cache SET expire_time = ?1 WHERE key_hash = ?2 AND raw_key = ?3 \
             AND (expire_time IS NULL OR expire_time > ?4)",
        )
        .bind(expire_time)
        .bind(hash)
        .bind(raw)
        .bind(now)
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomic get-then-delete. A miss returns the default container.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `retry` exhausted the deadline, or a storage
    /// error unrelated to contention.
    pub async fn pop(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        let (hash, raw) = self.key_parts(key)?;
        let fallback = Container::miss(default.clone());
        self.with_retry(retry, Some(fallback), || {
            self.try_pop(key, hash, &raw, &default)
        })
        .await
    }

    async fn try_pop(
        &self,
        key: &Value,
        hash: i64,
        raw: &[u8],
        default: &Option<Value>,
    ) -> Result<Container> {
        let now = now_secs();
        let mut tx = self.conn.transaction().await?;
        let row = sqlx::query(SELECT_ROW_SQL)
            .bind(hash)
            .bind(raw)
            .fetch_optional(&mut *tx)
            .await?;
        let data = match row {
            Some(ref row) => Some(decode_row(row)?),
            None => None,
        };
        let Some(data) = data.filter(|d| is_live(d.expire_time, now)) else {
            return Ok(Container::miss(default.clone()));
        };

        delete_rows(&mut tx, &[data.rowid]).await?;
        tx.commit().await?;

        let disk = self.disk();
        let value = match disk
            .fetch(data.mode, data.filename.as_deref(), data.inline.as_deref())
            .await
        {
            Ok(value) => value,
            Err(CacheError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Ok(Container::miss(default.clone()));
            }
            Err(err) => return Err(err),
        };
        if let Some(name) = &data.filename {
            self.remove_files(std::slice::from_ref(name)).await;
        }
        Ok(Container::hit(
            key.clone(),
            value,
            data.expire_time,
            tags_from_column(data.tags.as_deref())?,
        ))
    }

    /// Adds `delta` to a stored integer, creating `default + delta` when the
    /// key is absent or expired.
    ///
    /// # Errors
    ///
    /// `Key` when the key is absent and `default` is `None`; `Value` when
    /// the stored value is not an integer; `Timeout` on exhausted retry.
    pub async fn incr(
        &self,
        key: &Value,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<i64> {
        let (hash, raw) = self.key_parts(key)?;
        self.with_retry(retry, None, || self.try_incr(hash, &raw, delta, default))
            .await
    }

    /// Subtracts `delta` from a stored integer, creating `default - delta`
    /// when the key is absent or expired.
    ///
    /// # Errors
    ///
    /// Same contract as [`incr`](Cache::incr).
    pub async fn decr(
        &self,
        key: &Value,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<i64> {
        self.incr(key, -delta, default, retry).await
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn try_incr(
        &self,
        hash: i64,
        raw: &[u8],
        delta: i64,
        default: Option<i64>,
    ) -> Result<i64> {
        let now = now_secs();
        let mut tx = self.conn.transaction().await?;
        let row = sqlx::query(SELECT_ROW_SQL)
            .bind(hash)
            .bind(raw)
            .fetch_optional(&mut *tx)
            .await?;
        let data = match row {
            Some(ref row) => Some(decode_row(row)?),
            None => None,
        };

        let mut cleanup = None;
        let next = match data {
            Some(ref data) if is_live(data.expire_time, now) => {
                let current = match (data.mode, &data.inline) {
                    (CacheMode::Pickle, Some(bytes)) => from_msgpack(bytes)?
                        .as_int()
                        .ok_or_else(|| CacheError::value("stored value is not an integer"))?,
                    _ => return Err(CacheError::value("stored value is not an integer")),
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| CacheError::value("integer overflow"))?;
                let bytes = to_msgpack(&Value::Int(next))?;
                sqlx::query("UPDATE cache SET size = ?1, value = ?2 WHERE rowid = ?3")
                    .bind(bytes.len() as i64)
                    .bind(&bytes)
                    .bind(data.rowid)
                    .execute(&mut *tx)
                    .await?;
                next
            }
            other => {
                let base = default.ok_or(CacheError::Key)?;
                let next = base
                    .checked_add(delta)
                    .ok_or_else(|| CacheError::value("integer overflow"))?;
                if let Some(data) = other {
                    cleanup = data.filename;
                }
                let bytes = to_msgpack(&Value::Int(next))?;
                sqlx::query(UPSERT_SQL)
                    .bind(hash)
                    .bind(raw)
                    .bind(now)
                    .bind(Option::<f64>::None)
                    .bind(Option::<String>::None)
                    .bind(bytes.len() as i64)
                    .bind(CacheMode::Pickle.as_column())
                    .bind(Option::<String>::None)
                    .bind(&bytes)
                    .execute(&mut *tx)
                    .await?;
                next
            }
        };
        tx.commit().await?;
        if let Some(name) = cleanup {
            self.remove_files(&[name]).await;
        }
        Ok(next)
    }

    /// Whether a live row exists for the key.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub async fn contains(&self, key: &Value) -> Result<bool> {
        let (hash, raw) = self.key_parts(key)?;
        let now = now_secs();
        let pool = self.conn.pool().await?;
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM cache WHERE key_hash = ?1 AND raw_key = ?2 \
             AND (expire_time IS NULL OR expire_time > ?3)",
        )
        .bind(hash)
        .bind(&raw)
        .bind(now)
        .fetch_optional(&pool)
        .await?;
        Ok(row.is_some())
    }

    // --- Bulk operations ---

    /// Count of live keys, read from the trigger-maintained counter.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the counter read fails.
    #[allow(clippy::len_without_is_empty)]
    pub async fn len(&self) -> Result<u64> {
        let pool = self.conn.pool().await?;
        Ok(metadata_value(&pool, "count").await?.max(0) as u64)
    }

    /// Whether the cache holds no rows.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the counter read fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Total bytes occupied by stored values, inline and on disk.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the counter read fails.
    pub async fn volume(&self) -> Result<u64> {
        let pool = self.conn.pool().await?;
        Ok(metadata_value(&pool, "size").await?.max(0) as u64)
    }

    /// Reads the persistent hit/miss counters; `enable` toggles future
    /// counting, `reset` atomically zeroes the counters after reading.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    #[allow(clippy::cast_sign_loss)]
    pub async fn stats(&self, enable: bool, reset: bool) -> Result<Stats> {
        let mut tx = self.conn.transaction().await?;
        let hits = metadata_value(&mut *tx, "hits").await?;
        let misses = metadata_value(&mut *tx, "misses").await?;
        if reset {
            sqlx::query("UPDATE metadata SET value = 0 WHERE key IN ('hits', 'misses')")
                .execute(&mut *tx)
                .await?;
        }
        let mut settings = self.conn.settings();
        settings.statistics = enable;
        let json = serde_json::to_string(&settings)?;
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES ('settings', ?1)")
            .bind(json)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.conn.set_statistics(enable);
        Ok(Stats {
            hits: hits.max(0) as u64,
            misses: misses.max(0) as u64,
        })
    }

    /// Keys whose tag sets match the queried tags: `And` requires a
    /// superset, `Or` an intersection. Expired rows are excluded. The match
    /// runs as one set-membership query, not a per-row scan in caller space.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub async fn filter(
        &self,
        tags: &BTreeSet<String>,
        method: FilterMethod,
    ) -> Result<Vec<Value>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_secs();
        let condition = tag_condition(method, tags.len());
        let now_placeholder = tags.len() + 1;
        let sql = format!(
            "SELECT raw_key FROM cache WHERE tags IS NOT NULL \
             AND (expire_time IS NULL OR expire_time > ?{now_placeholder}) \
             AND {condition} ORDER BY rowid"
        );
        let pool = self.conn.pool().await?;
        let mut query = sqlx::query(&sql);
        for tag in tags {
            query = query.bind(tag);
        }
        let rows = query.bind(now).fetch_all(&pool).await?;

        let disk = self.disk();
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: Vec<u8> = row.try_get("raw_key")?;
            keys.push(disk.decode_key(&raw)?);
        }
        Ok(keys)
    }

    /// Deletes every row matching the tag query, paged by the cull batch
    /// limit per transaction. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// `Timeout` (carrying the partial count) when retry exhausted the
    /// deadline, or a storage error unrelated to contention.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn evict(
        &self,
        tags: &BTreeSet<String>,
        method: FilterMethod,
        retry: bool,
    ) -> Result<usize> {
        if tags.is_empty() {
            return Ok(0);
        }
        let limit = self.conn.settings().cull_limit;
        let condition = tag_condition(method, tags.len());
        let limit_placeholder = tags.len() + 1;
        let sql = format!(
            "SELECT rowid, filename FROM cache WHERE tags IS NOT NULL AND {condition} \
             ORDER BY rowid LIMIT ?{limit_placeholder}"
        );
        self.paged_delete(retry, limit, || self.evict_page(&sql, tags, limit))
            .await
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn evict_page(
        &self,
        sql: &str,
        tags: &BTreeSet<String>,
        limit: usize,
    ) -> Result<(usize, Vec<String>)> {
        let mut tx = self.conn.transaction().await?;
        let mut query = sqlx::query(sql);
        for tag in tags {
            query = query.bind(tag);
        }
        let rows = query.bind(limit as i64).fetch_all(&mut *tx).await?;
        let (rowids, files) = split_victims(&rows)?;
        delete_rows(&mut tx, &rowids).await?;
        tx.commit().await?;
        Ok((rowids.len(), files))
    }

    /// Deletes every row whose expiry is at or before `now` (wall clock when
    /// omitted), paged by the cull batch limit per transaction. Returns the
    /// number of rows removed.
    ///
    /// # Errors
    ///
    /// `Timeout` (carrying the partial count) when retry exhausted the
    /// deadline, or a storage error unrelated to contention.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn expire(&self, now: Option<f64>, retry: bool) -> Result<usize> {
        let now = now.unwrap_or_else(now_secs);
        let limit = self.conn.settings().cull_limit;
        self.paged_delete(retry, limit, || self.expire_page(now, limit))
            .await
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn expire_page(&self, now: f64, limit: usize) -> Result<(usize, Vec<String>)> {
        let mut tx = self.conn.transaction().await?;
        let rows = sqlx::query(
            "SELECT rowid, filename FROM cache WHERE expire_time IS NOT NULL \
             AND expire_time <= ?1 ORDER BY expire_time LIMIT ?2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;
        let (rowids, files) = split_victims(&rows)?;
        delete_rows(&mut tx, &rowids).await?;
        tx.commit().await?;
        Ok((rowids.len(), files))
    }

    /// Deletes every row, paged by the cull batch limit per transaction.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// `Timeout` (carrying the partial count) when retry exhausted the
    /// deadline, or a storage error unrelated to contention.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn clear(&self, retry: bool) -> Result<usize> {
        let limit = self.conn.settings().cull_limit;
        self.paged_delete(retry, limit, || self.clear_page(limit))
            .await
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn clear_page(&self, limit: usize) -> Result<(usize, Vec<String>)> {
        let mut tx = self.conn.transaction().await?;
        let rows = sqlx::query("SELECT rowid, filename FROM cache ORDER BY rowid LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;
        let (rowids, files) = split_victims(&rows)?;
        delete_rows(&mut tx, &rowids).await?;
        tx.commit().await?;
        Ok((rowids.len(), files))
    }

    /// Policy-ordered bulk deletion bringing the volume back under the size
    /// limit. Expired rows are reclaimed first; live victims are removed in
    /// policy order, never more rows than needed. A no-op when the volume is
    /// already under the limit or the policy is `None`.
    ///
    /// # Errors
    ///
    /// `Timeout` (carrying the partial count) when retry exhausted the
    /// deadline, or a storage error unrelated to contention.
    pub async fn cull(&self, retry: bool) -> Result<usize> {
        let started = Instant::now();
        let deadline = self.conn.timeout();
        let settings = self.conn.settings();
        #[allow(clippy::cast_possible_wrap)]
        let size_limit = settings.size_limit as i64;
        let mut total = 0;
        loop {
            match self.cull_page(size_limit, &settings).await {
                Ok((removed, files, done)) => {
                    self.remove_files(&files).await;
                    total += removed;
                    if done {
                        return Ok(total);
                    }
                }
                Err(err) if err.is_contention() => {
                    if !retry || started.elapsed() >= deadline {
                        return Err(CacheError::timeout(started.elapsed(), total));
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn cull_page(
        &self,
        size_limit: i64,
        settings: &Settings,
    ) -> Result<(usize, Vec<String>, bool)> {
        let now = now_secs();
        let mut tx = self.conn.transaction().await?;
        let volume = metadata_value(&mut *tx, "size").await?;
        if volume <= size_limit {
            return Ok((0, Vec::new(), true));
        }

        // Expired rows are logically absent already; reclaim those first.
        let expired = sqlx::query(
            "SELECT rowid, filename FROM cache WHERE expire_time IS NOT NULL \
             AND expire_time <= ?1 ORDER BY expire_time LIMIT ?2",
        )
        .bind(now)
        .bind(settings.cull_limit as i64)
        .fetch_all(&mut *tx)
        .await?;
        if !expired.is_empty() {
            let (rowids, files) = split_victims(&expired)?;
            delete_rows(&mut tx, &rowids).await?;
            tx.commit().await?;
            return Ok((rowids.len(), files, false));
        }

        let Some(cull_sql) = settings.eviction_policy.cull_sql() else {
            return Ok((0, Vec::new(), true));
        };
        let candidates = sqlx::query(cull_sql)
            .bind(settings.cull_limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut over = volume - size_limit;
        let mut rowids = Vec::new();
        let mut files = Vec::new();
        for row in &candidates {
            if over <= 0 {
                break;
            }
            let size: i64 = row.try_get("size")?;
            rowids.push(row.try_get::<i64, _>("rowid")?);
            if let Some(name) = row.try_get::<Option<String>, _>("filename")? {
                files.push(name);
            }
            over -= size;
        }
        if rowids.is_empty() {
            return Ok((0, Vec::new(), true));
        }
        delete_rows(&mut tx, &rowids).await?;
        tx.commit().await?;
        let done = over <= 0;
        Ok((rowids.len(), files, done))
    }

    /// Single in-transaction cull batch run by `set`/`add` after an upsert
    /// pushed the volume over the limit.
    #[allow(clippy::cast_possible_wrap)]
    async fn cull_batch(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        cleanup: &mut Vec<String>,
    ) -> Result<usize> {
        let settings = self.conn.settings();
        let Some(cull_sql) = settings.eviction_policy.cull_sql() else {
            return Ok(0);
        };
        let size_limit = settings.size_limit as i64;
        let volume = metadata_value(&mut **tx, "size").await?;
        if volume <= size_limit {
            return Ok(0);
        }
        let candidates = sqlx::query(cull_sql)
            .bind(settings.cull_limit as i64)
            .fetch_all(&mut **tx)
            .await?;
        let mut over = volume - size_limit;
        let mut rowids = Vec::new();
        for row in &candidates {
            if over <= 0 {
                break;
            }
            let size: i64 = row.try_get("size")?;
            rowids.push(row.try_get::<i64, _>("rowid")?);
            if let Some(name) = row.try_get::<Option<String>, _>("filename")? {
                cleanup.push(name);
            }
            over -= size;
        }
        delete_rows(tx, &rowids).await?;
        Ok(rowids.len())
    }

    /// Shared paging loop for `evict`/`expire`/`clear`: each page is one
    /// transaction deleting at most `limit` rows, repeated until a short
    /// page signals exhaustion. Contention maps to `Timeout` carrying the
    /// count already applied by committed pages.
    async fn paged_delete<Fut>(
        &self,
        retry: bool,
        limit: usize,
        mut page: impl FnMut() -> Fut,
    ) -> Result<usize>
    where
        Fut: Future<Output = Result<(usize, Vec<String>)>>,
    {
        let started = Instant::now();
        let deadline = self.conn.timeout();
        let mut total = 0;
        loop {
            match page().await {
                Ok((removed, files)) => {
                    self.remove_files(&files).await;
                    total += removed;
                    if removed < limit {
                        return Ok(total);
                    }
                }
                Err(err) if err.is_contention() => {
                    if !retry || started.elapsed() >= deadline {
                        return Err(CacheError::timeout(started.elapsed(), total));
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // --- Iteration ---

    /// Lazily streams keys in insertion order (or reverse). The stream is a
    /// snapshot view paged by rowid: mutations made after a page is fetched
    /// are not guaranteed to be observed.
    #[must_use]
    pub fn iter_keys(&self, reverse: bool) -> BoxStream<'static, Result<Value>> {
        struct IterState {
            conn: Arc<Connection>,
            disk: Arc<dyn Disk>,
            anchor: i64,
            buffer: VecDeque<Vec<u8>>,
            done: bool,
            reverse: bool,
        }

        let state = IterState {
            conn: Arc::clone(&self.conn),
            disk: self.disk(),
            anchor: if reverse { i64::MAX } else { 0 },
            buffer: VecDeque::new(),
            done: false,
            reverse,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(raw) = state.buffer.pop_front() {
                    let key = state.disk.decode_key(&raw)?;
                    return Ok(Some((key, state)));
                }
                if state.done {
                    return Ok(None);
                }
                let sql = if state.reverse {
                    "SELECT rowid, raw_key FROM cache WHERE rowid < ?1 \
                     ORDER BY rowid DESC LIMIT ?2"
                } else {
                    "SELECT rowid, raw_key FROM cache WHERE rowid > ?1 \
                     ORDER BY rowid LIMIT ?2"
                };
                let pool = state.conn.pool().await?;
                #[allow(clippy::cast_possible_wrap)]
                let rows = sqlx::query(sql)
                    .bind(state.anchor)
                    .bind(ITER_PAGE as i64)
                    .fetch_all(&pool)
                    .await?;
                if rows.len() < ITER_PAGE {
                    state.done = true;
                }
                if let Some(last) = rows.last() {
                    state.anchor = last.try_get("rowid")?;
                }
                for row in &rows {
                    state.buffer.push_back(row.try_get("raw_key")?);
                }
            }
        })
        .boxed()
    }

    // --- Integrity ---

    /// Detects orphan backing files, missing backing files, size mismatches,
    /// and counter drift. Findings come back as warnings, never as errors;
    /// `fix` repairs each finding as it is detected.
    ///
    /// # Errors
    ///
    /// `Timeout` when retry exhausted the deadline, or a storage/file error
    /// unrelated to contention.
    pub async fn check(&self, fix: bool, retry: bool) -> Result<Vec<String>> {
        self.with_retry(retry, None, || self.try_check(fix)).await
    }

    #[allow(clippy::cast_possible_wrap, clippy::too_many_lines)]
    async fn try_check(&self, fix: bool) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let pool = self.conn.pool().await?;
        let disk = self.disk();

        // Rows that reference a backing file: the file must exist and match
        // the recorded size.
        let rows =
            sqlx::query("SELECT rowid, size, filename FROM cache WHERE filename IS NOT NULL")
                .fetch_all(&pool)
                .await?;
        let mut referenced = HashSet::new();
        for row in &rows {
            let rowid: i64 = row.try_get("rowid")?;
            let size: i64 = row.try_get("size")?;
            let filename: String = row.try_get("filename")?;
            referenced.insert(filename.clone());
            match tokio::fs::metadata(self.directory.join(&filename)).await {
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warnings.push(format!("missing backing file: {filename}"));
                    if fix {
                        let mut tx = self.conn.transaction().await?;
                        delete_rows(&mut tx, &[rowid]).await?;
                        tx.commit().await?;
                    }
                }
                Err(err) => return Err(err.into()),
                Ok(meta) if meta.len() as i64 != size => {
                    warnings.push(format!(
                        "size mismatch for {filename}: row has {size}, file has {}",
                        meta.len()
                    ));
                    if fix {
                        let mut tx = self.conn.transaction().await?;
                        sqlx::query("UPDATE cache SET size = ?1 WHERE rowid = ?2")
                            .bind(meta.len() as i64)
                            .bind(rowid)
                            .execute(&mut *tx)
                            .await?;
                        tx.commit().await?;
                    }
                }
                Ok(_) => {}
            }
        }

        // Files on disk no row references.
        for filename in self.value_files().await? {
            if !referenced.contains(&filename) {
                warnings.push(format!("orphan backing file: {filename}"));
                if fix {
                    disk.remove(&filename).await?;
                }
            }
        }

        // Trigger-maintained counters can drift after a crash mid-commit.
        let (actual_count, actual_size): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM cache")
                .fetch_one(&pool)
                .await?;
        for (key, actual) in [("count", actual_count), ("size", actual_size)] {
            let stored = metadata_value(&pool, key).await?;
            if stored != actual {
                warnings.push(format!(
                    "metadata {key} counter is {stored}, actual is {actual}"
                ));
                if fix {
                    sqlx::query("UPDATE metadata SET value = ?1 WHERE key = ?2")
                        .bind(actual)
                        .bind(key)
                        .execute(&pool)
                        .await?;
                }
            }
        }

        Ok(warnings)
    }

    /// Relative paths of every backing-value file under the two-level
    /// prefix directories.
    async fn value_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut root = tokio::fs::read_dir(&self.directory).await?;
        while let Some(outer) = root.next_entry().await? {
            let outer_name = outer.file_name().to_string_lossy().into_owned();
            if outer_name.len() != 2 || !outer.file_type().await?.is_dir() {
                continue;
            }
            let mut mid = tokio::fs::read_dir(outer.path()).await?;
            while let Some(inner) = mid.next_entry().await? {
                let inner_name = inner.file_name().to_string_lossy().into_owned();
                if !inner.file_type().await?.is_dir() {
                    continue;
                }
                let mut leaves = tokio::fs::read_dir(inner.path()).await?;
                while let Some(leaf) = leaves.next_entry().await? {
                    if leaf.file_type().await?.is_file() {
                        let leaf_name = leaf.file_name().to_string_lossy().into_owned();
                        files.push(format!("{outer_name}/{inner_name}/{leaf_name}"));
                    }
                }
            }
        }
        Ok(files)
    }
}

fn split_victims(rows: &[SqliteRow]) -> Result<(Vec<i64>, Vec<String>)> {
    let mut rowids = Vec::with_capacity(rows.len());
    let mut files = Vec::new();
    for row in rows {
        rowids.push(row.try_get::<i64, _>("rowid")?);
        if let Some(name) = row.try_get::<Option<String>, _>("filename")? {
            files.push(name);
        }
    }
    Ok((rowids, files))
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;
    use tempfile::TempDir;

    use super::*;

    async fn open_cache(dir: &TempDir) -> Cache {
        Cache::open(dir.path(), CacheConfig::default()).await.unwrap()
    }

    async fn open_with(dir: &TempDir, settings: Settings) -> Cache {
        Cache::open(
            dir.path(),
            CacheConfig {
                timeout: Some(Duration::from_secs(5)),
                settings,
            },
        )
        .await
        .unwrap()
    }

    fn tag_set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| (*t).to_owned()).collect()
    }

    #[tokio::test]
    async fn get_set_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::Int(0);

        let miss = cache.get(&key, None, true).await.unwrap();
        assert!(miss.default);
        assert!(miss.value.is_null());
        assert!(miss.key.is_none());
        assert!(miss.tags.is_none());

        let with_default = cache
            .get(&key, Some(Value::from("dne")), true)
            .await
            .unwrap();
        assert_eq!(with_default.value, Value::from("dne"));
        assert!(with_default.default);

        assert!(cache
            .set(&key, &Value::Int(0), None, Some(tag_set(&["number"])), true)
            .await
            .unwrap());
        let hit = cache.get(&key, None, true).await.unwrap();
        assert!(!hit.default);
        assert_eq!(hit.value, Value::Int(0));
        assert_eq!(hit.key, Some(key));
        assert_eq!(hit.expire_time, None);
        assert_eq!(hit.tags, Some(tag_set(&["number"])));
    }

    #[tokio::test]
    async fn get_set_delete_value_shapes() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::Int(0);
        let values = vec![
            Value::Null,
            Value::Int(1234),
            Value::Float(56.78),
            Value::from("hello"),
            Value::String("hello".repeat(20_000)),
            Value::Bytes(b"world".to_vec()),
            Value::Bytes(b"world".repeat(20_000)),
            Value::Array(vec![Value::Null; 10_000]),
        ];
        for value in values {
            assert_eq!(cache.len().await.unwrap(), 0);
            assert!(cache.set(&key, &value, None, None, true).await.unwrap());
            assert_eq!(cache.len().await.unwrap(), 1);
            let got = cache.get(&key, None, true).await.unwrap();
            assert!(!got.default);
            assert_eq!(got.value, value);
            assert!(cache.delete(&key, true).await.unwrap());
            assert_eq!(cache.len().await.unwrap(), 0);
            assert!(cache.get(&key, None, true).await.unwrap().default);
        }
    }

    #[tokio::test]
    async fn length_tracks_set_add_delete() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(cache.set(&Value::Int(0), &Value::Int(0), None, None, true).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(cache.set(&Value::Int(0), &Value::Int(1), None, None, true).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(cache.set(&Value::Int(1), &Value::Int(2), None, None, true).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 2);
        assert!(cache.delete(&Value::Int(0), true).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(!cache.delete(&Value::Int(0), true).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(cache.delete(&Value::Int(1), true).await.unwrap());
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn expiry_makes_row_logically_absent() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::Int(0);
        assert!(cache
            .set(&key, &Value::Int(0), Some(Duration::from_millis(100)), None, true)
            .await
            .unwrap());
        assert!(!cache.get(&key, None, true).await.unwrap().default);
        assert!(cache.contains(&key).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(&key, None, true).await.unwrap().default);
        assert!(!cache.contains(&key).await.unwrap());
        // The row is still physically present until reclaimed.
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.expire(None, true).await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_only_wins_fresh_or_expired_keys() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::from("k");
        assert!(cache.add(&key, &Value::Int(1), None, None, true).await.unwrap());
        assert!(!cache.add(&key, &Value::Int(2), None, None, true).await.unwrap());
        assert_eq!(
            cache.get(&key, None, true).await.unwrap().value,
            Value::Int(1)
        );

        // Expired rows count as absent.
        assert!(cache
            .set(&key, &Value::Int(3), Some(Duration::from_millis(50)), None, true)
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.add(&key, &Value::Int(4), None, None, true).await.unwrap());
        assert_eq!(
            cache.get(&key, None, true).await.unwrap().value,
            Value::Int(4)
        );
    }

    #[tokio::test]
    async fn concurrent_add_has_exactly_one_winner() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open_cache(&dir).await);
        let key = Value::from("fresh");

        let mut tasks = Vec::new();
        for i in 0..8i64 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                cache.add(&key, &Value::Int(i), None, None, true).await
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_decr_semantics() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::from("counter");

        assert_eq!(cache.incr(&key, 5, Some(0), true).await.unwrap(), 5);
        assert_eq!(cache.incr(&key, 5, Some(0), true).await.unwrap(), 10);
        assert_eq!(cache.decr(&key, 3, Some(0), true).await.unwrap(), 7);

        let missing = Value::from("missing");
        assert!(matches!(
            cache.incr(&missing, 1, None, true).await,
            Err(CacheError::Key)
        ));
        // decr on an absent key creates default - delta.
        let down = Value::from("down");
        assert_eq!(cache.decr(&down, 4, Some(0), true).await.unwrap(), -4);

        cache
            .set(&Value::from("text"), &Value::from("nan"), None, None, true)
            .await
            .unwrap();
        assert!(matches!(
            cache.incr(&Value::from("text"), 1, Some(0), true).await,
            Err(CacheError::Value { .. })
        ));
    }

    #[tokio::test]
    async fn incr_treats_expired_as_absent() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::from("counter");
        cache
            .set(&key, &Value::Int(100), Some(Duration::from_millis(50)), None, true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.incr(&key, 1, Some(0), true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn touch_updates_only_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::Int(7);
        cache
            .set(&key, &Value::Int(7), Some(Duration::from_millis(50)), None, true)
            .await
            .unwrap();
        assert!(cache
            .touch(&key, Some(Duration::from_secs(60)), true)
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.get(&key, None, true).await.unwrap().default);
        assert!(!cache
            .touch(&Value::Int(8), Some(Duration::from_secs(1)), true)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pop_removes_and_returns() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::from("popme");
        cache
            .set(&key, &Value::Int(42), None, Some(tag_set(&["t"])), true)
            .await
            .unwrap();
        let popped = cache.pop(&key, None, true).await.unwrap();
        assert!(!popped.default);
        assert_eq!(popped.value, Value::Int(42));
        assert_eq!(popped.tags, Some(tag_set(&["t"])));
        assert_eq!(cache.len().await.unwrap(), 0);

        let again = cache.pop(&key, Some(Value::Int(-1)), true).await.unwrap();
        assert!(again.default);
        assert_eq!(again.value, Value::Int(-1));
    }

    #[tokio::test]
    async fn stats_count_and_reset() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let stats = cache.stats(true, false).await.unwrap();
        assert_eq!((stats.hits, stats.misses), (0, 0));

        cache
            .set(&Value::Int(1), &Value::Int(1), None, None, true)
            .await
            .unwrap();
        for _ in 0..3 {
            cache.get(&Value::Int(1), None, true).await.unwrap();
        }
        for _ in 0..2 {
            cache.get(&Value::Int(9), None, true).await.unwrap();
        }
        let stats = cache.stats(true, true).await.unwrap();
        assert_eq!((stats.hits, stats.misses), (3, 2));

        let stats = cache.stats(true, false).await.unwrap();
        assert_eq!((stats.hits, stats.misses), (0, 0));

        // Disabled statistics stop counting.
        cache.stats(false, true).await.unwrap();
        cache.get(&Value::Int(1), None, true).await.unwrap();
        let stats = cache.stats(false, false).await.unwrap();
        assert_eq!((stats.hits, stats.misses), (0, 0));
    }

    #[tokio::test]
    async fn filter_and_or_semantics() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let fixture: &[(i64, &[&str])] = &[
            (1, &["tag0"]),
            (2, &["tag1"]),
            (4, &["tag0", "tag1"]),
            (7, &["tag0", "tag1", "tag2"]),
        ];
        for (id, tags) in fixture {
            cache
                .set(&Value::Int(*id), &Value::Int(*id), None, Some(tag_set(tags)), true)
                .await
                .unwrap();
        }

        let both = tag_set(&["tag0", "tag1"]);
        let and: Vec<Value> = cache.filter(&both, FilterMethod::And).await.unwrap();
        assert_eq!(and, vec![Value::Int(4), Value::Int(7)]);

        let or: Vec<Value> = cache.filter(&both, FilterMethod::Or).await.unwrap();
        assert_eq!(
            or,
            vec![Value::Int(1), Value::Int(2), Value::Int(4), Value::Int(7)]
        );
    }

    #[tokio::test]
    async fn evict_removes_matching_rows() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        for id in 0..20i64 {
            let tags = if id % 2 == 0 { &["even"][..] } else { &["odd"][..] };
            cache
                .set(&Value::Int(id), &Value::Int(id), None, Some(tag_set(tags)), true)
                .await
                .unwrap();
        }
        let removed = cache
            .evict(&tag_set(&["even"]), FilterMethod::Or, true)
            .await
            .unwrap();
        assert_eq!(removed, 10);
        assert_eq!(cache.len().await.unwrap(), 10);
        assert!(!cache.get(&Value::Int(1), None, true).await.unwrap().default);
        assert!(cache.get(&Value::Int(0), None, true).await.unwrap().default);
    }

    #[tokio::test]
    async fn expire_pages_through_all_expired_rows() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        for id in 0..25i64 {
            cache
                .set(
                    &Value::Int(id),
                    &Value::Int(id),
                    Some(Duration::from_millis(10)),
                    None,
                    true,
                )
                .await
                .unwrap();
        }
        cache
            .set(&Value::Int(100), &Value::Int(100), None, None, true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // cull_limit defaults to 10, so this pages 3 times.
        assert_eq!(cache.expire(None, true).await.unwrap(), 25);
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cull_is_minimal_and_noop_under_limit() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.size_limit = 1000;
        let cache = open_with(&dir, settings).await;

        // Ten rows of exactly 100 payload bytes: at the limit, not over.
        for id in 0..10i64 {
            cache
                .set(&Value::Int(id), &Value::Bytes(vec![0; 100]), None, None, true)
                .await
                .unwrap();
        }
        assert_eq!(cache.volume().await.unwrap(), 1000);
        assert_eq!(cache.cull(true).await.unwrap(), 0);
        assert_eq!(cache.len().await.unwrap(), 10);

        // One more row pushes volume to 1100; set's in-transaction cull
        // batch removes exactly the single oldest row needed.
        cache
            .set(&Value::Int(10), &Value::Bytes(vec![0; 100]), None, None, true)
            .await
            .unwrap();
        assert_eq!(cache.len().await.unwrap(), 10);
        assert!(cache.volume().await.unwrap() <= 1000);
        // Oldest row was the victim under least-recently-stored.
        assert!(cache.get(&Value::Int(0), None, true).await.unwrap().default);
        assert!(!cache.get(&Value::Int(1), None, true).await.unwrap().default);
    }

    #[tokio::test]
    async fn cull_with_none_policy_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.size_limit = 10;
        settings.eviction_policy = stockpile_core::EvictionPolicy::None;
        let cache = open_with(&dir, settings).await;
        for id in 0..5i64 {
            cache
                .set(&Value::Int(id), &Value::Bytes(vec![0; 100]), None, None, true)
                .await
                .unwrap();
        }
        assert_eq!(cache.cull(true).await.unwrap(), 0);
        assert_eq!(cache.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn least_recently_used_culls_cold_rows() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.size_limit = 1000;
        settings.eviction_policy = stockpile_core::EvictionPolicy::LeastRecentlyUsed;
        let cache = open_with(&dir, settings).await;
        for id in 0..10i64 {
            cache
                .set(&Value::Int(id), &Value::Bytes(vec![0; 100]), None, None, true)
                .await
                .unwrap();
        }
        // Touch every row except 3, then overflow: 3 is the LRU victim.
        for id in 0..10i64 {
            if id != 3 {
                cache.get(&Value::Int(id), None, true).await.unwrap();
            }
        }
        cache
            .set(&Value::Int(10), &Value::Bytes(vec![0; 100]), None, None, true)
            .await
            .unwrap();
        assert!(cache.get(&Value::Int(3), None, true).await.unwrap().default);
        assert!(!cache.get(&Value::Int(4), None, true).await.unwrap().default);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        for id in 0..23i64 {
            cache
                .set(&Value::Int(id), &Value::Int(id), None, None, true)
                .await
                .unwrap();
        }
        assert_eq!(cache.clear(true).await.unwrap(), 23);
        assert!(cache.is_empty().await.unwrap());
        assert_eq!(cache.volume().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn volume_matches_stored_sizes() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache
            .set(&Value::Int(1), &Value::Bytes(vec![0; 250]), None, None, true)
            .await
            .unwrap();
        cache
            .set(&Value::Int(2), &Value::Bytes(vec![0; 750]), None, None, true)
            .await
            .unwrap();
        assert_eq!(cache.volume().await.unwrap(), 1000);
        cache.delete(&Value::Int(1), true).await.unwrap();
        assert_eq!(cache.volume().await.unwrap(), 750);
    }

    #[tokio::test]
    async fn iteration_follows_insertion_order() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        for id in 0..250i64 {
            cache
                .set(&Value::Int(id), &Value::Int(id), None, None, true)
                .await
                .unwrap();
        }
        let keys: Vec<Value> = cache.iter_keys(false).try_collect().await.unwrap();
        assert_eq!(keys.len(), 250);
        assert_eq!(keys[0], Value::Int(0));
        assert_eq!(keys[249], Value::Int(249));

        let reversed: Vec<Value> = cache.iter_keys(true).try_collect().await.unwrap();
        assert_eq!(reversed[0], Value::Int(249));
        assert_eq!(reversed[249], Value::Int(0));
    }

    #[tokio::test]
    async fn large_values_spill_to_files_and_delete_cleans_up() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::from("big");
        let value = Value::Bytes(vec![7; 100_000]);
        cache.set(&key, &value, None, None, true).await.unwrap();
        assert_eq!(cache.value_files_for_test().await.len(), 1);
        assert_eq!(cache.get(&key, None, true).await.unwrap().value, value);

        // Overwriting replaces the backing file rather than leaking it.
        let value2 = Value::Bytes(vec![8; 100_000]);
        cache.set(&key, &value2, None, None, true).await.unwrap();
        assert_eq!(cache.value_files_for_test().await.len(), 1);

        cache.delete(&key, true).await.unwrap();
        assert!(cache.value_files_for_test().await.is_empty());
    }

    #[tokio::test]
    async fn check_detects_and_fixes_integrity_problems() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let key = Value::from("big");
        cache
            .set(&key, &Value::Bytes(vec![1; 100_000]), None, None, true)
            .await
            .unwrap();
        assert!(cache.check(false, true).await.unwrap().is_empty());

        // Orphan: a stray value file no row references.
        let orphan = dir.path().join("zz/zz");
        tokio::fs::create_dir_all(&orphan).await.unwrap();
        tokio::fs::write(orphan.join("stray.val"), b"junk").await.unwrap();

        // Missing: remove the real backing file behind the row's back.
        let files = cache.value_files_for_test().await;
        let real = files
            .iter()
            .find(|name| !name.starts_with("zz/"))
            .unwrap()
            .clone();
        tokio::fs::remove_file(dir.path().join(&real)).await.unwrap();

        let warnings = cache.check(false, true).await.unwrap();
        assert_eq!(warnings.len(), 2, "warnings: {warnings:?}");

        let warnings = cache.check(true, true).await.unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(cache.check(false, true).await.unwrap().is_empty());
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(cache.value_files_for_test().await.is_empty());
    }

    #[tokio::test]
    async fn check_fixes_counter_drift() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache
            .set(&Value::Int(1), &Value::Bytes(vec![0; 64]), None, None, true)
            .await
            .unwrap();
        // Corrupt the counters directly.
        let pool = cache.connection().pool().await.unwrap();
        sqlx::query("UPDATE metadata SET value = 99 WHERE key = 'size'")
            .execute(&pool)
            .await
            .unwrap();
        let warnings = cache.check(true, true).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(cache.volume().await.unwrap(), 64);
    }

    #[tokio::test]
    async fn descriptor_reconstruction_sees_same_rows() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache
            .set(&Value::from("k"), &Value::Int(5), None, None, true)
            .await
            .unwrap();
        let descriptor = cache.describe();
        cache.close().await;

        let rebuilt = Cache::from_descriptor(descriptor).await.unwrap();
        let got = rebuilt.get(&Value::from("k"), None, true).await.unwrap();
        assert_eq!(got.value, Value::Int(5));
    }

    #[tokio::test]
    async fn update_settings_rebinds_and_applies() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache
            .set(&Value::Int(1), &Value::Int(1), None, None, true)
            .await
            .unwrap();

        let mut settings = cache.settings();
        settings.statistics = true;
        settings.eviction_policy = stockpile_core::EvictionPolicy::LeastFrequentlyUsed;
        cache.update_settings(settings).await;

        // Existing rows survive the rebind and the new policy is in force.
        assert!(!cache.get(&Value::Int(1), None, true).await.unwrap().default);
        assert_eq!(
            cache.connection().eviction(),
            stockpile_core::EvictionPolicy::LeastFrequentlyUsed
        );
        let stats = cache.stats(true, false).await.unwrap();
        assert_eq!(stats.hits, 1);
    }

    impl Cache {
        async fn value_files_for_test(&self) -> Vec<String> {
            self.value_files().await.unwrap()
        }
    }
}

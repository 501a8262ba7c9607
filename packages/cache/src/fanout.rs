//! Fan-out router: partitions a keyspace across independent shard engines.
//!
//! A [`FanoutCache`] owns N [`Cache`] engines under numbered subdirectories
//! of one parent directory. Key-addressed operations route by
//! `hash(key) % N` — the same hash the codec uses on disk, so routing is
//! stable across processes. Bulk operations run shard-by-shard in index
//! order and aggregate. A storage error or lock timeout on one shard
//! degrades that call to the operation's no-op result instead of failing
//! work on other shards; the single-shard engine's global ordering guarantee
//! is explicitly relaxed here.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use stockpile_core::hash::shard_index;
use stockpile_core::{Container, FilterMethod, Stats, Value};
use tracing::debug;

use crate::cache::{Cache, CacheConfig};
use crate::error::{CacheError, Result};
use crate::settings::Settings;

/// Shards used when callers have no particular sizing in mind.
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// Disk and file backed cache fanned out over shard engines.
///
/// The shard count is fixed for the directory's lifetime; `size_limit` is
/// divided evenly across shards at construction.
pub struct FanoutCache {
    directory: PathBuf,
    shards: Vec<Cache>,
}

impl FanoutCache {
    /// Opens (creating if necessary) a fan-out cache with `shard_count`
    /// shard engines under `directory`.
    ///
    /// # Errors
    ///
    /// `Value` when `shard_count` is zero; otherwise any error opening a
    /// shard engine. Construction errors are never absorbed.
    pub async fn open(
        directory: impl Into<PathBuf>,
        shard_count: usize,
        config: CacheConfig,
    ) -> Result<Self> {
        if shard_count == 0 {
            return Err(CacheError::value("shard_count must be non-zero"));
        }
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;

        let mut settings = config.settings.clone();
        settings.size_limit = config.settings.size_limit / shard_count as u64;

        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let shard = Cache::open(
                directory.join(format!("{index:03}")),
                CacheConfig {
                    timeout: config.timeout,
                    settings: settings.clone(),
                },
            )
            .await?;
            shards.push(shard);
        }
        Ok(Self { directory, shards })
    }

    /// The parent directory.
    #[must_use]
    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    /// Number of shard engines.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &Value) -> Result<&Cache> {
        Ok(&self.shards[self.shard_index_for(key)?])
    }

    fn shard_index_for(&self, key: &Value) -> Result<usize> {
        let hash = self.shards[0].disk().hash(key)?;
        Ok(shard_index(hash, self.shards.len()))
    }

    // --- Key-addressed operations (routed) ---

    /// Routed [`Cache::get`]; a failed shard degrades to a miss.
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn get(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        let shard = self.shard_for(key)?;
        match shard.get(key, default.clone(), retry).await {
            Ok(container) => Ok(container),
            Err(err) if err.is_absorbable() => {
                debug!(%err, "shard get degraded to miss");
                Ok(Container::miss(default))
            }
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::set`]; a failed shard degrades to `false`.
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn set(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        let shard = self.shard_for(key)?;
        match shard.set(key, value, expire, tags, retry).await {
            Ok(stored) => Ok(stored),
            Err(err) if err.is_absorbable() => {
                debug!(%err, "shard set degraded to no-op");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::add`]; a failed shard degrades to `false`.
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn add(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        let shard = self.shard_for(key)?;
        match shard.add(key, value, expire, tags, retry).await {
            Ok(added) => Ok(added),
            Err(err) if err.is_absorbable() => {
                debug!(%err, "shard add degraded to no-op");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::delete`]; a failed shard degrades to `false`.
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn delete(&self, key: &Value, retry: bool) -> Result<bool> {
        let shard = self.shard_for(key)?;
        match shard.delete(key, retry).await {
            Ok(deleted) => Ok(deleted),
            Err(err) if err.is_absorbable() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::touch`]; a failed shard degrades to `false`.
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn touch(&self, key: &Value, expire: Option<Duration>, retry: bool) -> Result<bool> {
        let shard = self.shard_for(key)?;
        match shard.touch(key, expire, retry).await {
            Ok(touched) => Ok(touched),
            Err(err) if err.is_absorbable() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::pop`]; a failed shard degrades to a miss.
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn pop(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        let shard = self.shard_for(key)?;
        match shard.pop(key, default.clone(), retry).await {
            Ok(container) => Ok(container),
            Err(err) if err.is_absorbable() => Ok(Container::miss(default)),
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::incr`]; a failed shard degrades to `None`.
    ///
    /// # Errors
    ///
    /// `Key` and `Value` errors propagate; storage errors are absorbed.
    pub async fn incr(
        &self,
        key: &Value,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<Option<i64>> {
        let shard = self.shard_for(key)?;
        match shard.incr(key, delta, default, retry).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_absorbable() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Routed [`Cache::decr`]; a failed shard degrades to `None`.
    ///
    /// # Errors
    ///
    /// `Key` and `Value` errors propagate; storage errors are absorbed.
    pub async fn decr(
        &self,
        key: &Value,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<Option<i64>> {
        self.incr(key, -delta, default, retry).await
    }

    /// Routed [`Cache::contains`].
    ///
    /// # Errors
    ///
    /// Key-encoding failures only; storage errors are absorbed.
    pub async fn contains(&self, key: &Value) -> Result<bool> {
        let shard = self.shard_for(key)?;
        match shard.contains(key).await {
            Ok(present) => Ok(present),
            Err(err) if err.is_absorbable() => Ok(false),
            Err(err) => Err(err),
        }
    }

    // --- Bulk operations (aggregated shard-by-shard) ---

    /// Sum of shard lengths.
    ///
    /// # Errors
    ///
    /// Returns the first shard's storage error.
    #[allow(clippy::len_without_is_empty)]
    pub async fn len(&self) -> Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.len().await?;
        }
        Ok(total)
    }

    /// Whether every shard is empty.
    ///
    /// # Errors
    ///
    /// Returns the first shard's storage error.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Sum of shard volumes.
    ///
    /// # Errors
    ///
    /// Returns the first shard's storage error.
    pub async fn volume(&self) -> Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.volume().await?;
        }
        Ok(total)
    }

    /// Aggregated [`Cache::stats`] across shards.
    ///
    /// # Errors
    ///
    /// Returns the first shard's storage error.
    pub async fn stats(&self, enable: bool, reset: bool) -> Result<Stats> {
        let mut totals = Stats::default();
        for shard in &self.shards {
            let stats = shard.stats(enable, reset).await?;
            totals.hits += stats.hits;
            totals.misses += stats.misses;
        }
        Ok(totals)
    }

    /// Concatenated [`Cache::filter`] results in shard-index order.
    ///
    /// # Errors
    ///
    /// Returns the first shard's storage error.
    pub async fn filter(
        &self,
        tags: &BTreeSet<String>,
        method: FilterMethod,
    ) -> Result<Vec<Value>> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.filter(tags, method).await?);
        }
        Ok(keys)
    }

    /// Aggregated [`Cache::evict`]: each shard is driven to completion,
    /// folding partial timeout progress into the total.
    ///
    /// # Errors
    ///
    /// Non-absorbable, non-timeout errors propagate.
    pub async fn evict(
        &self,
        tags: &BTreeSet<String>,
        method: FilterMethod,
        retry: bool,
    ) -> Result<usize> {
        let mut total = 0;
        for shard in &self.shards {
            Self::drain_shard(&mut total, || shard.evict(tags, method, retry)).await?;
        }
        Ok(total)
    }

    /// Aggregated [`Cache::expire`] with a single observation time shared by
    /// every shard.
    ///
    /// # Errors
    ///
    /// Non-absorbable, non-timeout errors propagate.
    pub async fn expire(&self, now: Option<f64>, retry: bool) -> Result<usize> {
        let now = now.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64()
        });
        let mut total = 0;
        for shard in &self.shards {
            Self::drain_shard(&mut total, || shard.expire(Some(now), retry)).await?;
        }
        Ok(total)
    }

    /// Aggregated [`Cache::cull`].
    ///
    /// # Errors
    ///
    /// Non-absorbable, non-timeout errors propagate.
    pub async fn cull(&self, retry: bool) -> Result<usize> {
        let mut total = 0;
        for shard in &self.shards {
            Self::drain_shard(&mut total, || shard.cull(retry)).await?;
        }
        Ok(total)
    }

    /// Aggregated [`Cache::clear`].
    ///
    /// # Errors
    ///
    /// Non-absorbable, non-timeout errors propagate.
    pub async fn clear(&self, retry: bool) -> Result<usize> {
        let mut total = 0;
        for shard in &self.shards {
            Self::drain_shard(&mut total, || shard.clear(retry)).await?;
        }
        Ok(total)
    }

    /// Drives one shard's paged bulk operation to completion. A timeout
    /// carries the rows already applied, so the count is folded in and the
    /// call repeated until the shard reports no further progress; other
    /// absorbable errors end the shard's contribution quietly.
    async fn drain_shard<Fut>(
        total: &mut usize,
        mut call: impl FnMut() -> Fut,
    ) -> Result<()>
    where
        Fut: std::future::Future<Output = Result<usize>>,
    {
        loop {
            match call().await {
                Ok(count) => {
                    *total += count;
                    return Ok(());
                }
                Err(CacheError::Timeout { count, .. }) => {
                    *total += count;
                    if count == 0 {
                        return Ok(());
                    }
                }
                Err(err) if err.is_absorbable() => {
                    debug!(%err, "shard bulk operation degraded to no-op");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Concatenated [`Cache::check`] warnings in shard-index order.
    ///
    /// # Errors
    ///
    /// Returns the first shard's storage error.
    pub async fn check(&self, fix: bool, retry: bool) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        for shard in &self.shards {
            warnings.extend(shard.check(fix, retry).await?);
        }
        Ok(warnings)
    }

    /// Lazily streams keys across shards: shard 0 first (or last when
    /// `reverse`), each shard in its own insertion order.
    #[must_use]
    pub fn iter_keys(&self, reverse: bool) -> BoxStream<'static, Result<Value>> {
        let streams: Vec<_> = if reverse {
            self.shards.iter().rev().map(|s| s.iter_keys(true)).collect()
        } else {
            self.shards.iter().map(|s| s.iter_keys(false)).collect()
        };
        stream::iter(streams).flatten().boxed()
    }

    /// Replaces settings on every shard, dividing `size_limit` evenly as at
    /// construction.
    pub async fn update_settings(&self, settings: Settings) {
        let mut settings = settings;
        settings.size_limit /= self.shards.len() as u64;
        for shard in &self.shards {
            shard.update_settings(settings.clone()).await;
        }
    }

    /// Disposes every shard's storage handles; they rebind lazily.
    pub async fn close(&self) {
        for shard in &self.shards {
            shard.close().await;
        }
    }
}

impl std::fmt::Debug for FanoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutCache")
            .field("directory", &self.directory)
            .field("shards", &self.shards.len())
            .finish()
    }
}

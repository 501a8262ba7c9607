//! Blocking facades over the async engines.
//!
//! Each facade owns a small dedicated tokio runtime and drives the
//! suspend-capable core to completion on it, so results and semantics are
//! identical to the async types — only the I/O boundary differs. Must not be
//! used from inside an async context (the runtime would be entered twice).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use stockpile_core::{Container, FilterMethod, Stats, Value};
use tokio::runtime::Runtime;

use crate::cache::CacheConfig;
use crate::connection::ConnectionDescriptor;
use crate::error::Result;
use crate::settings::Settings;

fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?)
}

/// Blocking iterator over cache keys, pulling pages through the runtime.
pub struct Keys {
    stream: BoxStream<'static, Result<Value>>,
    runtime: Arc<Runtime>,
}

impl Iterator for Keys {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}

/// Blocking single-directory cache engine. See [`crate::Cache`] for the
/// operation contracts.
pub struct Cache {
    inner: Arc<crate::Cache>,
    runtime: Arc<Runtime>,
}

impl Cache {
    /// Opens (creating if necessary) a cache engine over `directory`.
    ///
    /// # Errors
    ///
    /// Same contract as [`crate::Cache::open`], plus runtime construction
    /// failures.
    pub fn open(directory: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        let runtime = Arc::new(build_runtime()?);
        let inner = runtime.block_on(crate::Cache::open(directory, config))?;
        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    /// Reconstructs an engine from a serializable descriptor.
    ///
    /// # Errors
    ///
    /// Same contract as [`crate::Cache::from_descriptor`].
    pub fn from_descriptor(descriptor: ConnectionDescriptor) -> Result<Self> {
        let runtime = Arc::new(build_runtime()?);
        let inner = runtime.block_on(crate::Cache::from_descriptor(descriptor))?;
        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    /// Serializable descriptor of this engine's session manager.
    #[must_use]
    pub fn describe(&self) -> ConnectionDescriptor {
        self.inner.describe()
    }

    /// The engine directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.inner.directory()
    }

    /// Snapshot of the current settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.inner.settings()
    }

    /// See [`crate::Cache::get`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn get(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        self.runtime.block_on(self.inner.get(key, default, retry))
    }

    /// See [`crate::Cache::set`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn set(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        self.runtime
            .block_on(self.inner.set(key, value, expire, tags, retry))
    }

    /// See [`crate::Cache::add`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn add(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        self.runtime
            .block_on(self.inner.add(key, value, expire, tags, retry))
    }

    /// See [`crate::Cache::delete`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn delete(&self, key: &Value, retry: bool) -> Result<bool> {
        self.runtime.block_on(self.inner.delete(key, retry))
    }

    /// See [`crate::Cache::touch`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn touch(&self, key: &Value, expire: Option<Duration>, retry: bool) -> Result<bool> {
        self.runtime.block_on(self.inner.touch(key, expire, retry))
    }

    /// See [`crate::Cache::pop`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn pop(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        self.runtime.block_on(self.inner.pop(key, default, retry))
    }

    /// See [`crate::Cache::incr`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn incr(&self, key: &Value, delta: i64, default: Option<i64>, retry: bool) -> Result<i64> {
        self.runtime
            .block_on(self.inner.incr(key, delta, default, retry))
    }

    /// See [`crate::Cache::decr`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn decr(&self, key: &Value, delta: i64, default: Option<i64>, retry: bool) -> Result<i64> {
        self.runtime
            .block_on(self.inner.decr(key, delta, default, retry))
    }

    /// See [`crate::Cache::contains`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn contains(&self, key: &Value) -> Result<bool> {
        self.runtime.block_on(self.inner.contains(key))
    }

    /// See [`crate::Cache::len`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> Result<u64> {
        self.runtime.block_on(self.inner.len())
    }

    /// See [`crate::Cache::is_empty`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn is_empty(&self) -> Result<bool> {
        self.runtime.block_on(self.inner.is_empty())
    }

    /// See [`crate::Cache::volume`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn volume(&self) -> Result<u64> {
        self.runtime.block_on(self.inner.volume())
    }

    /// See [`crate::Cache::stats`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn stats(&self, enable: bool, reset: bool) -> Result<Stats> {
        self.runtime.block_on(self.inner.stats(enable, reset))
    }

    /// See [`crate::Cache::filter`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn filter(&self, tags: &BTreeSet<String>, method: FilterMethod) -> Result<Vec<Value>> {
        self.runtime.block_on(self.inner.filter(tags, method))
    }

    /// See [`crate::Cache::evict`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn evict(
        &self,
        tags: &BTreeSet<String>,
        method: FilterMethod,
        retry: bool,
    ) -> Result<usize> {
        self.runtime.block_on(self.inner.evict(tags, method, retry))
    }

    /// See [`crate::Cache::expire`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn expire(&self, now: Option<f64>, retry: bool) -> Result<usize> {
        self.runtime.block_on(self.inner.expire(now, retry))
    }

    /// See [`crate::Cache::cull`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn cull(&self, retry: bool) -> Result<usize> {
        self.runtime.block_on(self.inner.cull(retry))
    }

    /// See [`crate::Cache::clear`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn clear(&self, retry: bool) -> Result<usize> {
        self.runtime.block_on(self.inner.clear(retry))
    }

    /// See [`crate::Cache::check`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn check(&self, fix: bool, retry: bool) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.check(fix, retry))
    }

    /// Blocking form of [`crate::Cache::iter_keys`].
    #[must_use]
    pub fn iter_keys(&self, reverse: bool) -> Keys {
        Keys {
            stream: self.inner.iter_keys(reverse),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// See [`crate::Cache::update_settings`].
    pub fn update_settings(&self, settings: Settings) {
        self.runtime.block_on(self.inner.update_settings(settings));
    }

    /// See [`crate::Cache::close`].
    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("blocking::Cache")
            .field("directory", &self.inner.directory())
            .finish()
    }
}

/// Blocking fan-out cache. See [`crate::FanoutCache`] for the routing and
/// aggregation contracts.
pub struct FanoutCache {
    inner: Arc<crate::FanoutCache>,
    runtime: Arc<Runtime>,
}

impl FanoutCache {
    /// Opens (creating if necessary) a fan-out cache with `shard_count`
    /// shard engines under `directory`.
    ///
    /// # Errors
    ///
    /// Same contract as [`crate::FanoutCache::open`], plus runtime
    /// construction failures.
    pub fn open(
        directory: impl Into<PathBuf>,
        shard_count: usize,
        config: CacheConfig,
    ) -> Result<Self> {
        let runtime = Arc::new(build_runtime()?);
        let inner = runtime.block_on(crate::FanoutCache::open(directory, shard_count, config))?;
        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    /// The parent directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.inner.directory()
    }

    /// Number of shard engines.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inner.shard_count()
    }

    /// See [`crate::FanoutCache::get`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn get(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        self.runtime.block_on(self.inner.get(key, default, retry))
    }

    /// See [`crate::FanoutCache::set`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn set(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        self.runtime
            .block_on(self.inner.set(key, value, expire, tags, retry))
    }

    /// See [`crate::FanoutCache::add`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn add(
        &self,
        key: &Value,
        value: &Value,
        expire: Option<Duration>,
        tags: Option<BTreeSet<String>>,
        retry: bool,
    ) -> Result<bool> {
        self.runtime
            .block_on(self.inner.add(key, value, expire, tags, retry))
    }

    /// See [`crate::FanoutCache::delete`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn delete(&self, key: &Value, retry: bool) -> Result<bool> {
        self.runtime.block_on(self.inner.delete(key, retry))
    }

    /// See [`crate::FanoutCache::touch`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn touch(&self, key: &Value, expire: Option<Duration>, retry: bool) -> Result<bool> {
        self.runtime.block_on(self.inner.touch(key, expire, retry))
    }

    /// See [`crate::FanoutCache::pop`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn pop(&self, key: &Value, default: Option<Value>, retry: bool) -> Result<Container> {
        self.runtime.block_on(self.inner.pop(key, default, retry))
    }

    /// See [`crate::FanoutCache::incr`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn incr(
        &self,
        key: &Value,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<Option<i64>> {
        self.runtime
            .block_on(self.inner.incr(key, delta, default, retry))
    }

    /// See [`crate::FanoutCache::decr`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn decr(
        &self,
        key: &Value,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<Option<i64>> {
        self.runtime
            .block_on(self.inner.decr(key, delta, default, retry))
    }

    /// See [`crate::FanoutCache::contains`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn contains(&self, key: &Value) -> Result<bool> {
        self.runtime.block_on(self.inner.contains(key))
    }

    /// See [`crate::FanoutCache::len`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> Result<u64> {
        self.runtime.block_on(self.inner.len())
    }

    /// See [`crate::FanoutCache::is_empty`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn is_empty(&self) -> Result<bool> {
        self.runtime.block_on(self.inner.is_empty())
    }

    /// See [`crate::FanoutCache::volume`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn volume(&self) -> Result<u64> {
        self.runtime.block_on(self.inner.volume())
    }

    /// See [`crate::FanoutCache::stats`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn stats(&self, enable: bool, reset: bool) -> Result<Stats> {
        self.runtime.block_on(self.inner.stats(enable, reset))
    }

    /// See [`crate::FanoutCache::filter`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn filter(&self, tags: &BTreeSet<String>, method: FilterMethod) -> Result<Vec<Value>> {
        self.runtime.block_on(self.inner.filter(tags, method))
    }

    /// See [`crate::FanoutCache::evict`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn evict(
        &self,
        tags: &BTreeSet<String>,
        method: FilterMethod,
        retry: bool,
    ) -> Result<usize> {
        self.runtime.block_on(self.inner.evict(tags, method, retry))
    }

    /// See [`crate::FanoutCache::expire`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn expire(&self, now: Option<f64>, retry: bool) -> Result<usize> {
        self.runtime.block_on(self.inner.expire(now, retry))
    }

    /// See [`crate::FanoutCache::cull`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn cull(&self, retry: bool) -> Result<usize> {
        self.runtime.block_on(self.inner.cull(retry))
    }

    /// See [`crate::FanoutCache::clear`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn clear(&self, retry: bool) -> Result<usize> {
        self.runtime.block_on(self.inner.clear(retry))
    }

    /// See [`crate::FanoutCache::check`].
    ///
    /// # Errors
    ///
    /// Same contract as the async form.
    pub fn check(&self, fix: bool, retry: bool) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.check(fix, retry))
    }

    /// Blocking form of [`crate::FanoutCache::iter_keys`].
    #[must_use]
    pub fn iter_keys(&self, reverse: bool) -> Keys {
        Keys {
            stream: self.inner.iter_keys(reverse),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// See [`crate::FanoutCache::update_settings`].
    pub fn update_settings(&self, settings: Settings) {
        self.runtime.block_on(self.inner.update_settings(settings));
    }

    /// See [`crate::FanoutCache::close`].
    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }
}

impl std::fmt::Debug for FanoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("blocking::FanoutCache")
            .field("directory", &self.inner.directory())
            .field("shards", &self.inner.shard_count())
            .finish()
    }
}

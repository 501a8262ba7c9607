//! Value codec: lossless value ⇄ storage-representation mapping.
//!
//! A [`Disk`] decides how a value is physically represented — embedded in the
//! row as inline bytes, or spilled to a uniquely-named backing file — and
//! derives the stable key hashes used for lookup and shard routing. Only file
//! I/O suspends; encoding and hashing are pure.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stockpile_core::hash::fnv1a_hash;
use stockpile_core::types::{from_msgpack, to_msgpack};
use stockpile_core::{CacheMode, Value};
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::settings::DiskDescriptor;

/// Physical representation chosen by [`Disk::store`].
///
/// Exactly one of `filename`/`inline` is populated, unless the value is the
/// "no value" sentinel (`mode == None`), where neither is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePayload {
    /// Bytes occupied, inline or on disk.
    pub size: u64,
    /// How the payload was encoded.
    pub mode: CacheMode,
    /// Relative path of the backing file, for spilled payloads.
    pub filename: Option<String>,
    /// Embedded payload bytes, for small payloads.
    pub inline: Option<Vec<u8>>,
}

/// Storage codec over the capability set `{hash, store, fetch, remove,
/// filename}` plus key encoding.
///
/// Used as `Arc<dyn Disk>`; the default implementation is [`FileDisk`] and
/// alternatives are selected through [`DiskDescriptor`].
#[async_trait]
pub trait Disk: Send + Sync + 'static {
    /// The engine directory backing files are stored under.
    fn directory(&self) -> &Path;

    /// Serializable descriptor sufficient to rebuild this codec elsewhere.
    fn descriptor(&self) -> DiskDescriptor;

    /// Encodes a key to the canonical bytes stored in `raw_key`.
    fn encode_key(&self, key: &Value) -> Result<Vec<u8>>;

    /// Decodes `raw_key` bytes back to the original key.
    fn decode_key(&self, raw: &[u8]) -> Result<Value>;

    /// Stable hash of a key, deterministic across processes. Collisions are
    /// expected; lookup and routing additionally compare encoded keys.
    fn hash(&self, key: &Value) -> Result<u64> {
        Ok(fnv1a_hash(&self.encode_key(key)?))
    }

    /// Picks a fresh collision-resistant relative path for a backing file,
    /// distributed across nested subdirectories to bound per-directory entry
    /// counts. Two concurrent calls never return the same path.
    fn filename(&self, key: Option<&Value>, value: Option<&Value>) -> String;

    /// Converts a value to its physical representation, writing a backing
    /// file when the payload is large.
    async fn store(&self, value: &Value, key: Option<&Value>) -> Result<ValuePayload>;

    /// Exact inverse of [`store`](Disk::store).
    async fn fetch(
        &self,
        mode: CacheMode,
        filename: Option<&str>,
        inline: Option<&[u8]>,
    ) -> Result<Value>;

    /// Deletes a backing file. Tolerates the file already being absent;
    /// best-effort cleanup never fails the owning operation for that alone.
    async fn remove(&self, filename: &str) -> Result<()>;
}

/// Default codec: small payloads inline, large payloads in uuid-named files
/// under two levels of subdirectories.
#[derive(Debug, Clone)]
pub struct FileDisk {
    directory: PathBuf,
    min_file_size: u64,
}

impl FileDisk {
    /// Payloads at or above this many bytes go to a backing file by default.
    pub const DEFAULT_MIN_FILE_SIZE: u64 = 1 << 15;

    /// Creates a codec rooted at `directory`.
    #[must_use]
    pub fn new(directory: PathBuf, min_file_size: u64) -> Self {
        Self {
            directory,
            min_file_size,
        }
    }

    /// Encodes a value to payload bytes and its mode. `Null` has no bytes.
    fn encode_value(value: &Value) -> Result<(CacheMode, Vec<u8>)> {
        match value {
            Value::Null => Ok((CacheMode::None, Vec::new())),
            Value::Bytes(bytes) => Ok((CacheMode::Binary, bytes.clone())),
            Value::String(text) => Ok((CacheMode::Text, text.as_bytes().to_vec())),
            other => Ok((CacheMode::Pickle, to_msgpack(other)?)),
        }
    }

    fn decode_value(mode: CacheMode, bytes: Vec<u8>) -> Result<Value> {
        match mode {
            CacheMode::None => Ok(Value::Null),
            CacheMode::Binary => Ok(Value::Bytes(bytes)),
            CacheMode::Text => String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|err| CacheError::codec(format!("invalid text payload: {err}"))),
            CacheMode::Pickle => Ok(from_msgpack(&bytes)?),
        }
    }
}

#[async_trait]
impl Disk for FileDisk {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn descriptor(&self) -> DiskDescriptor {
        DiskDescriptor::File {
            min_file_size: self.min_file_size,
        }
    }

    fn encode_key(&self, key: &Value) -> Result<Vec<u8>> {
        Ok(to_msgpack(key)?)
    }

    fn decode_key(&self, raw: &[u8]) -> Result<Value> {
        Ok(from_msgpack(raw)?)
    }

    fn filename(&self, _key: Option<&Value>, _value: Option<&Value>) -> String {
        // Random 128-bit name: no coordination needed between concurrent
        // stores, and the two-level prefix bounds per-directory entry counts.
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("{}/{}/{}.val", &hex[..2], &hex[2..4], &hex[4..])
    }

    async fn store(&self, value: &Value, key: Option<&Value>) -> Result<ValuePayload> {
        let (mode, bytes) = Self::encode_value(value)?;
        let size = bytes.len() as u64;
        if mode == CacheMode::None {
            return Ok(ValuePayload {
                size: 0,
                mode,
                filename: None,
                inline: None,
            });
        }

        if size < self.min_file_size {
            return Ok(ValuePayload {
                size,
                mode,
                filename: None,
                inline: Some(bytes),
            });
        }

        let filename = self.filename(key, Some(value));
        let full_path = self.directory.join(&filename);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, &bytes).await?;
        Ok(ValuePayload {
            size,
            mode,
            filename: Some(filename),
            inline: None,
        })
    }

    async fn fetch(
        &self,
        mode: CacheMode,
        filename: Option<&str>,
        inline: Option<&[u8]>,
    ) -> Result<Value> {
        let bytes = match (filename, inline) {
            (Some(name), _) => tokio::fs::read(self.directory.join(name)).await?,
            (None, Some(bytes)) => bytes.to_vec(),
            (None, None) => Vec::new(),
        };
        Self::decode_value(mode, bytes)
    }

    async fn remove(&self, filename: &str) -> Result<()> {
        match tokio::fs::remove_file(self.directory.join(filename)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(filename, "backing file already absent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Serializes a tag set to the JSON stored in the `tags` column.
pub(crate) fn tags_to_column(tags: Option<&BTreeSet<String>>) -> Result<Option<String>> {
    match tags {
        None => Ok(None),
        Some(set) => Ok(Some(serde_json::to_string(set)?)),
    }
}

/// Decodes a `tags` column back to a tag set.
pub(crate) fn tags_from_column(raw: Option<&str>) -> Result<Option<BTreeSet<String>>> {
    match raw {
        None => Ok(None),
        Some(json) => Ok(Some(serde_json::from_str(json)?)),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn disk(dir: &TempDir) -> FileDisk {
        FileDisk::new(dir.path().to_path_buf(), 64)
    }

    fn sample_values() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(false),
            Value::Int(1234),
            Value::Float(56.78),
            Value::String("hello".into()),
            Value::String("hello".repeat(1000)),
            Value::Bytes(b"world".to_vec()),
            Value::Bytes(b"world".repeat(1000)),
            Value::Array(vec![Value::Null; 4096]),
        ]
    }

    #[tokio::test]
    async fn store_fetch_round_trip() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        for value in sample_values() {
            let payload = disk.store(&value, None).await.unwrap();
            let fetched = disk
                .fetch(
                    payload.mode,
                    payload.filename.as_deref(),
                    payload.inline.as_deref(),
                )
                .await
                .unwrap();
            assert_eq!(fetched, value);
        }
    }

    #[tokio::test]
    async fn mode_selection_by_value_shape() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let cases = [
            (Value::Null, CacheMode::None),
            (Value::Bytes(vec![1, 2, 3]), CacheMode::Binary),
            (Value::String("text".into()), CacheMode::Text),
            (Value::Int(9), CacheMode::Pickle),
            (Value::Array(vec![]), CacheMode::Pickle),
        ];
        for (value, expected) in cases {
            let payload = disk.store(&value, None).await.unwrap();
            assert_eq!(payload.mode, expected, "wrong mode for {value:?}");
        }
    }

    #[tokio::test]
    async fn exactly_one_of_filename_inline() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);

        let small = disk.store(&Value::Bytes(vec![0; 8]), None).await.unwrap();
        assert!(small.filename.is_none() && small.inline.is_some());
        assert_eq!(small.size, 8);

        let large = disk.store(&Value::Bytes(vec![0; 256]), None).await.unwrap();
        assert!(large.filename.is_some() && large.inline.is_none());
        assert_eq!(large.size, 256);

        let none = disk.store(&Value::Null, None).await.unwrap();
        assert!(none.filename.is_none() && none.inline.is_none());
        assert_eq!(none.size, 0);
    }

    #[tokio::test]
    async fn large_payload_lands_under_nested_directories() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let payload = disk
            .store(&Value::Bytes(vec![7; 1024]), None)
            .await
            .unwrap();
        let filename = payload.filename.unwrap();
        let parts: Vec<&str> = filename.split('/').collect();
        assert_eq!(parts.len(), 3, "expected aa/bb/rest.val, got {filename}");
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert!(parts[2].ends_with(".val"));
        assert!(dir.path().join(&filename).exists());
    }

    #[test]
    fn filenames_never_collide() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(disk.filename(None, None)));
        }
    }

    #[tokio::test]
    async fn remove_tolerates_absent_file() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        disk.remove("aa/bb/nope.val").await.unwrap();
    }

    #[tokio::test]
    async fn remove_deletes_backing_file() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let payload = disk
            .store(&Value::String("x".repeat(500)), None)
            .await
            .unwrap();
        let filename = payload.filename.unwrap();
        assert!(dir.path().join(&filename).exists());
        disk.remove(&filename).await.unwrap();
        assert!(!dir.path().join(&filename).exists());
    }

    #[test]
    fn hash_stable_and_collision_checked_by_raw_key() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let key = Value::from("user:alice");
        assert_eq!(disk.hash(&key).unwrap(), disk.hash(&key).unwrap());
        assert_ne!(
            disk.hash(&key).unwrap(),
            disk.hash(&Value::from("user:bob")).unwrap()
        );
        // Distinct keys always produce distinct raw bytes, which is what
        // lookup compares after the hash narrows candidates.
        assert_ne!(
            disk.encode_key(&key).unwrap(),
            disk.encode_key(&Value::from("user:bob")).unwrap()
        );
    }

    #[test]
    fn key_codec_round_trip() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        for key in [Value::Int(0), Value::from("k"), Value::Bytes(vec![9; 3])] {
            let raw = disk.encode_key(&key).unwrap();
            assert_eq!(disk.decode_key(&raw).unwrap(), key);
        }
    }

    #[test]
    fn tags_column_round_trip() {
        let tags: BTreeSet<String> = ["tag0".to_owned(), "tag1".to_owned()].into();
        let column = tags_to_column(Some(&tags)).unwrap().unwrap();
        assert_eq!(tags_from_column(Some(&column)).unwrap().unwrap(), tags);
        assert!(tags_from_column(None).unwrap().is_none());
    }
}

//! Core value and result types for the cache.
//!
//! Defines [`Value`], the runtime value type stored in the cache, plus the
//! row-level [`CacheMode`] discriminant, the [`Container`] operation result,
//! [`Stats`], and [`FilterMethod`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Generic runtime value type for cache keys and values.
///
/// Supports all JSON-compatible types plus binary data. Keys and values are
/// both `Value`s; keys are serialized to canonical `MsgPack` bytes (see
/// [`to_msgpack`]) for hashing, shard routing, and the `raw_key` row column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence of a value ("no value" sentinel, stored as mode `None`).
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer. The only shape `incr`/`decr` accept.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 text (stored as mode `Text`).
    String(String),
    /// Binary data (stored as mode `Binary`).
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Map of string keys to values. Uses `BTreeMap` for deterministic
    /// serialization order, which keeps key hashes stable.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the stored integer, or `None` for any other shape.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns `true` if this is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Serializes a [`Value`] to canonical `MsgPack` bytes.
///
/// The encoding is deterministic (compact variant indices, `BTreeMap` key
/// order), so the same value always produces the same bytes — a requirement
/// for stable key hashing across processes.
///
/// # Errors
///
/// Returns an encode error if serialization fails.
pub fn to_msgpack(value: &Value) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(value)
}

/// Deserializes a [`Value`] from `MsgPack` bytes. Exact inverse of
/// [`to_msgpack`].
///
/// # Errors
///
/// Returns a decode error if the bytes are not a valid encoded [`Value`].
pub fn from_msgpack(bytes: &[u8]) -> Result<Value, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// Physical representation of a stored value, recorded in the `mode` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum CacheMode {
    /// No payload ([`Value::Null`]); neither inline bytes nor a file exist.
    None = 0,
    /// Raw bytes ([`Value::Bytes`]).
    Binary = 1,
    /// UTF-8 text ([`Value::String`]).
    Text = 2,
    /// Generic serialized form (`MsgPack`) for every other value shape.
    Pickle = 3,
}

impl CacheMode {
    /// Converts a raw column value back to a mode.
    #[must_use]
    pub fn from_column(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(CacheMode::None),
            1 => Some(CacheMode::Binary),
            2 => Some(CacheMode::Text),
            3 => Some(CacheMode::Pickle),
            _ => None,
        }
    }

    /// The raw column value for this mode.
    #[must_use]
    pub fn as_column(self) -> i64 {
        self as i64
    }
}

/// Method for matching a queried tag set against row tag sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMethod {
    /// Row tags must be a superset of the queried tags.
    And,
    /// Row tags must intersect the queried tags.
    Or,
}

/// Persistent hit/miss counter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Reads that found a live row while statistics were enabled.
    pub hits: u64,
    /// Reads that found nothing while statistics were enabled.
    pub misses: u64,
}

/// Immutable result wrapper for key-addressed read operations.
///
/// `default` is `true` iff the key was absent (or expired) and `value` is the
/// caller-supplied fallback rather than a stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    /// The queried key, populated only on a hit.
    pub key: Option<Value>,
    /// The stored value on a hit, or the fallback on a miss.
    pub value: Value,
    /// Whether `value` is the fallback default.
    pub default: bool,
    /// Expiry as seconds since the epoch; `None` means never expires.
    pub expire_time: Option<f64>,
    /// Tags attached to the row, populated only on a hit.
    pub tags: Option<BTreeSet<String>>,
}

impl Container {
    /// Builds a hit container around a stored value.
    #[must_use]
    pub fn hit(
        key: Value,
        value: Value,
        expire_time: Option<f64>,
        tags: Option<BTreeSet<String>>,
    ) -> Self {
        Self {
            key: Some(key),
            value,
            default: false,
            expire_time,
            tags,
        }
    }

    /// Builds a miss container carrying the caller's fallback value.
    #[must_use]
    pub fn miss(default_value: Option<Value>) -> Self {
        Self {
            key: None,
            value: default_value.unwrap_or(Value::Null),
            default: true,
            expire_time: None,
            tags: None,
        }
    }
}

//! Error taxonomy for cache operations.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors returned by cache operations.
///
/// Transient lock contention is absorbed into an operation's natural empty
/// result when `retry` is off; it surfaces as [`CacheError::Timeout`] only
/// once a retrying operation exhausts the connection timeout.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A key-addressed operation required a row that does not exist, e.g.
    /// `incr` on an absent key with no default.
    #[error("key not found")]
    Key,

    /// A value or setting had the wrong shape, e.g. `incr` on a stored
    /// non-integer.
    #[error("invalid value: {reason}")]
    Value {
        /// What was wrong with the value.
        reason: String,
    },

    /// Retry exhausted the busy-timeout budget. `count` carries rows already
    /// applied by committed pages of a paged bulk operation, so callers (the
    /// fan-out router in particular) can resume without double-counting.
    #[error("operation timed out after {elapsed:?} ({count} rows applied)")]
    Timeout {
        /// Time spent before giving up.
        elapsed: Duration,
        /// Rows already applied by committed pages.
        count: usize,
    },

    /// Out-of-range access in sequence-style collaborators built on the
    /// engine's operations.
    #[error("index {index} out of range for length {len}")]
    Index {
        /// The offending index.
        index: usize,
        /// The collection length at access time.
        len: usize,
    },

    /// Underlying storage driver failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// File I/O failure on a backing-value file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Value or settings encode/decode failure.
    #[error("codec error: {reason}")]
    Codec {
        /// What failed to encode or decode.
        reason: String,
    },
}

impl CacheError {
    pub(crate) fn codec(reason: impl Into<String>) -> Self {
        CacheError::Codec {
            reason: reason.into(),
        }
    }

    pub(crate) fn value(reason: impl Into<String>) -> Self {
        CacheError::Value {
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(elapsed: Duration, count: usize) -> Self {
        CacheError::Timeout { elapsed, count }
    }

    /// Whether this error is transient lock contention on the storage file.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        match self {
            CacheError::Storage(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY (5), SQLITE_LOCKED (6), and their extended codes.
                matches!(
                    db.code().as_deref(),
                    Some("5" | "6" | "261" | "262" | "517")
                ) || db.message().contains("database is locked")
            }
            CacheError::Storage(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Whether a fan-out router should absorb this error into the
    /// operation's no-op result instead of failing other shards.
    #[must_use]
    pub fn is_absorbable(&self) -> bool {
        matches!(
            self,
            CacheError::Timeout { .. } | CacheError::Storage(_) | CacheError::Io(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CacheError::codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CacheError::codec(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_progress() {
        let err = CacheError::timeout(Duration::from_secs(3), 40);
        let text = err.to_string();
        assert!(text.contains("40 rows"), "unexpected display: {text}");
    }

    #[test]
    fn key_and_value_errors_are_not_contention() {
        assert!(!CacheError::Key.is_contention());
        assert!(!CacheError::value("not an integer").is_contention());
    }

    #[test]
    fn absorbable_covers_storage_and_timeout() {
        assert!(CacheError::timeout(Duration::ZERO, 0).is_absorbable());
        assert!(CacheError::Storage(sqlx::Error::PoolClosed).is_absorbable());
        assert!(!CacheError::Key.is_absorbable());
        assert!(!CacheError::value("bad").is_absorbable());
    }

    #[test]
    fn codec_errors_convert() {
        let err: CacheError = serde_json::from_str::<u8>("not json").unwrap_err().into();
        assert!(matches!(err, CacheError::Codec { .. }));
    }
}

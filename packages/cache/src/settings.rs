//! Engine settings and the construction-time configuration surface.
//!
//! [`Settings`] is the per-engine mutable-by-full-reload settings block,
//! persisted wholesale as JSON in the `settings` table so another process can
//! reconstruct an equivalent engine from a descriptor. [`SqlitePragmas`] is
//! the storage pragma set applied once per physical connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous,
};
use stockpile_core::EvictionPolicy;

use crate::disk::{Disk, FileDisk};

/// Default size limit: 1 GiB.
const DEFAULT_SIZE_LIMIT: u64 = 1 << 30;

/// Default cull batch limit (rows per paging step).
const DEFAULT_CULL_LIMIT: usize = 10;

/// Per-engine settings, replaced wholesale by `update_settings`.
///
/// Changing settings closes and lazily rebinds all storage handles; it never
/// retroactively recomputes existing rows' bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether reads update the persistent hit/miss counters.
    pub statistics: bool,
    /// Row-eviction policy.
    pub eviction_policy: EvictionPolicy,
    /// Total size limit in bytes; `cull` runs until volume is back under it.
    pub size_limit: u64,
    /// Rows per paging step for `cull`/`expire`/`evict`/`clear`.
    pub cull_limit: usize,
    /// Value codec descriptor, reconstructable in another process.
    pub disk: DiskDescriptor,
    /// Storage pragma set applied per physical connection.
    pub sqlite: SqlitePragmas,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            statistics: false,
            eviction_policy: EvictionPolicy::default(),
            size_limit: DEFAULT_SIZE_LIMIT,
            cull_limit: DEFAULT_CULL_LIMIT,
            disk: DiskDescriptor::default(),
            sqlite: SqlitePragmas::default(),
        }
    }
}

impl Settings {
    /// Checks construction-time invariants. Engines reject invalid settings
    /// at open rather than on the first operation that trips over them.
    ///
    /// # Errors
    ///
    /// `Value` when `cull_limit` is zero (paged operations could never make
    /// progress).
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.cull_limit == 0 {
            return Err(crate::error::CacheError::value("cull_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Serializable codec selector: which [`Disk`] implementation an engine uses
/// and how to rebuild it against a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DiskDescriptor {
    /// The default file-backed codec.
    File {
        /// Payloads at or above this many bytes go to a backing file.
        min_file_size: u64,
    },
}

impl Default for DiskDescriptor {
    fn default() -> Self {
        DiskDescriptor::File {
            min_file_size: FileDisk::DEFAULT_MIN_FILE_SIZE,
        }
    }
}

impl DiskDescriptor {
    /// Instantiates the described codec against an engine directory.
    #[must_use]
    pub fn create(&self, directory: &Path) -> Arc<dyn Disk> {
        match *self {
            DiskDescriptor::File { min_file_size } => {
                Arc::new(FileDisk::new(directory.to_path_buf(), min_file_size))
            }
        }
    }
}

/// `journal_mode` pragma values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

/// `synchronous` pragma values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Synchronous {
    Off,
    Normal,
    Full,
    Extra,
}

/// `auto_vacuum` pragma values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AutoVacuum {
    None,
    Full,
    Incremental,
}

/// Storage pragma set applied once per physical connection at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlitePragmas {
    pub auto_vacuum: AutoVacuum,
    /// Page-cache size in pages.
    pub cache_size: i64,
    pub journal_mode: JournalMode,
    /// Memory-map window in bytes.
    pub mmap_size: u64,
    pub synchronous: Synchronous,
}

impl Default for SqlitePragmas {
    fn default() -> Self {
        Self {
            auto_vacuum: AutoVacuum::Full,
            cache_size: 1 << 13,
            journal_mode: JournalMode::Wal,
            mmap_size: 1 << 26,
            synchronous: Synchronous::Normal,
        }
    }
}

impl SqlitePragmas {
    /// Builds connect options for a storage file, applying this pragma set
    /// and the busy timeout to every physical connection at creation.
    #[must_use]
    pub fn connect_options(&self, path: &Path, timeout: Duration) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(timeout)
            .auto_vacuum(match self.auto_vacuum {
                AutoVacuum::None => SqliteAutoVacuum::None,
                AutoVacuum::Full => SqliteAutoVacuum::Full,
                AutoVacuum::Incremental => SqliteAutoVacuum::Incremental,
            })
            .journal_mode(match self.journal_mode {
                JournalMode::Delete => SqliteJournalMode::Delete,
                JournalMode::Truncate => SqliteJournalMode::Truncate,
                JournalMode::Persist => SqliteJournalMode::Persist,
                JournalMode::Memory => SqliteJournalMode::Memory,
                JournalMode::Wal => SqliteJournalMode::Wal,
                JournalMode::Off => SqliteJournalMode::Off,
            })
            .synchronous(match self.synchronous {
                Synchronous::Off => SqliteSynchronous::Off,
                Synchronous::Normal => SqliteSynchronous::Normal,
                Synchronous::Full => SqliteSynchronous::Full,
                Synchronous::Extra => SqliteSynchronous::Extra,
            })
            .pragma("cache_size", self.cache_size.to_string())
            .pragma("mmap_size", self.mmap_size.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_json() {
        let settings = Settings {
            statistics: true,
            eviction_policy: EvictionPolicy::LeastFrequentlyUsed,
            size_limit: 1 << 20,
            cull_limit: 25,
            disk: DiskDescriptor::File { min_file_size: 512 },
            sqlite: SqlitePragmas {
                journal_mode: JournalMode::Truncate,
                ..SqlitePragmas::default()
            },
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn settings_default_fields() {
        let settings = Settings::default();
        assert!(!settings.statistics);
        assert_eq!(settings.eviction_policy, EvictionPolicy::LeastRecentlyStored);
        assert_eq!(settings.size_limit, 1 << 30);
        assert_eq!(settings.cull_limit, 10);
    }

    #[test]
    fn pragma_defaults_match_storage_profile() {
        let pragmas = SqlitePragmas::default();
        assert_eq!(pragmas.journal_mode, JournalMode::Wal);
        assert_eq!(pragmas.synchronous, Synchronous::Normal);
        assert_eq!(pragmas.auto_vacuum, AutoVacuum::Full);
        assert_eq!(pragmas.cache_size, 8192);
        assert_eq!(pragmas.mmap_size, 1 << 26);
    }

    #[test]
    fn partial_settings_json_fills_defaults() {
        let back: Settings = serde_json::from_str(r#"{"statistics": true}"#).unwrap();
        assert!(back.statistics);
        assert_eq!(back.cull_limit, 10);
    }
}

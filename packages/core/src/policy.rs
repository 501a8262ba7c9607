//! Eviction policy strategies.
//!
//! An [`EvictionPolicy`] is a pure strategy object: it yields the
//! access-bookkeeping statement applied on reads (or none, when the policy
//! does not track access) and the cull-ordering query used to pick victims
//! when the cache exceeds its size limit (or none, when culling is a no-op).
//!
//! Both statements use numbered placeholders so every policy binds the same
//! parameter tuple: `(?1 = access time, ?2 = rowid)` for bookkeeping and
//! `(?1 = batch limit)` for cull ordering.

use serde::{Deserialize, Serialize};

/// Row-eviction policy, selected by engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// No eviction: reads do no bookkeeping and cull is a no-op.
    None,
    /// Evict rows in `store_time` order. No read bookkeeping.
    #[default]
    LeastRecentlyStored,
    /// Evict rows in `access_time` order; reads update `access_time`.
    LeastRecentlyUsed,
    /// Evict rows in `access_count` order; reads increment `access_count`.
    LeastFrequentlyUsed,
}

impl EvictionPolicy {
    /// Access-bookkeeping statement applied on every read hit, or `None` when
    /// the policy does not track access.
    ///
    /// Binds `(?1 = access time as epoch seconds, ?2 = rowid)`; policies that
    /// ignore the access time still accept both placeholders.
    #[must_use]
    pub fn touch_sql(self) -> Option<&'static str> {
        match self {
            EvictionPolicy::None | EvictionPolicy::LeastRecentlyStored => None,
            EvictionPolicy::LeastRecentlyUsed => {
                Some("UPDATE cache SET access_time = ?1 WHERE rowid = ?2")
            }
            EvictionPolicy::LeastFrequentlyUsed => {
                Some("UPDATE cache SET access_count = access_count + 1 WHERE rowid = ?2")
            }
        }
    }

    /// Cull-victim query ordering rows cheapest-to-evict first, or `None`
    /// when culling is a no-op. Binds `(?1 = batch limit)`.
    #[must_use]
    pub fn cull_sql(self) -> Option<&'static str> {
        match self {
            EvictionPolicy::None => None,
            EvictionPolicy::LeastRecentlyStored => Some(
                "SELECT rowid, filename, size FROM cache ORDER BY store_time LIMIT ?1",
            ),
            EvictionPolicy::LeastRecentlyUsed => Some(
                "SELECT rowid, filename, size FROM cache ORDER BY access_time LIMIT ?1",
            ),
            EvictionPolicy::LeastFrequentlyUsed => Some(
                "SELECT rowid, filename, size FROM cache ORDER BY access_count LIMIT ?1",
            ),
        }
    }

    /// Whether reads under this policy write bookkeeping fields.
    #[must_use]
    pub fn tracks_access(self) -> bool {
        self.touch_sql().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_policy_is_inert() {
        assert_eq!(EvictionPolicy::None.touch_sql(), None);
        assert_eq!(EvictionPolicy::None.cull_sql(), None);
        assert!(!EvictionPolicy::None.tracks_access());
    }

    #[test]
    fn least_recently_stored_orders_by_store_time_only() {
        let policy = EvictionPolicy::LeastRecentlyStored;
        assert_eq!(policy.touch_sql(), None);
        assert!(policy.cull_sql().unwrap().contains("store_time"));
    }

    #[test]
    fn least_recently_used_touches_access_time() {
        let policy = EvictionPolicy::LeastRecentlyUsed;
        assert!(policy.touch_sql().unwrap().contains("access_time"));
        assert!(policy.cull_sql().unwrap().contains("access_time"));
        assert!(policy.tracks_access());
    }

    #[test]
    fn least_frequently_used_counts_accesses() {
        let policy = EvictionPolicy::LeastFrequentlyUsed;
        assert!(policy.touch_sql().unwrap().contains("access_count + 1"));
        assert!(policy.cull_sql().unwrap().contains("access_count"));
    }

    #[test]
    fn serializes_kebab_case() {
        let json = serde_json::to_string(&EvictionPolicy::LeastRecentlyStored).unwrap();
        assert_eq!(json, "\"least-recently-stored\"");
        let back: EvictionPolicy = serde_json::from_str("\"least-frequently-used\"").unwrap();
        assert_eq!(back, EvictionPolicy::LeastFrequentlyUsed);
    }

    #[test]
    fn default_is_least_recently_stored() {
        assert_eq!(EvictionPolicy::default(), EvictionPolicy::LeastRecentlyStored);
    }
}

//! Per-row time-to-live tracking.
//!
//! The manager owns a mutex-guarded map from row to absolute expiry time.
//! Expiry is enforced two ways: lazily, by consulting [`TtlManager::is_expired`]
//! on the read path, and in the background, where the database runs a
//! cleaner thread that periodically collects a bounded batch of expired
//! rows and deletes them through the normal write path. A TTL of zero means
//! no expiry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Applied to every insert when non-zero. Zero means rows do not expire
    /// unless given an explicit TTL.
    pub default_ttl_seconds: u64,

    /// Background cleaner wake interval. Zero disables the cleaner thread.
    pub cleanup_interval_seconds: u64,

    /// Filter expired rows out of reads before the cleaner gets to them.
    pub lazy_expiration: bool,

    /// Upper bound on deletions per cleaner pass.
    pub max_expired_per_cleanup: usize,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 0,
            cleanup_interval_seconds: 60,
            lazy_expiration: true,
            max_expired_per_cleanup: 1000,
        }
    }
}

/// Counters surfaced through database stats. Background failures land here
/// instead of panicking the cleaner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TtlStatus {
    pub tracked_rows: u64,
    pub expired_total: u64,
    pub cleanup_errors: u64,
}

pub struct TtlManager {
    /// Row to absolute expiry, microseconds since epoch.
    expirations: Mutex<BTreeMap<u64, u64>>,
    expired_total: AtomicU64,
    cleanup_errors: AtomicU64,
}

impl TtlManager {
    pub fn new() -> Self {
        Self {
            expirations: Mutex::new(BTreeMap::new()),
            expired_total: AtomicU64::new(0),
            cleanup_errors: AtomicU64::new(0),
        }
    }

    /// Sets a row's expiry `ttl_seconds` from `now`. Zero clears any expiry.
    pub fn set_ttl(&self, row: u64, ttl_seconds: u64, now: u64) -> CResult<()> {
        let mut map = self.expirations.lock().expect("ttl lock poisoned");
        if ttl_seconds == 0 {
            map.remove(&row);
            return Ok(());
        }
        let expires_at = now
            .checked_add(ttl_seconds.saturating_mul(1_000_000))
            .ok_or_else(|| Error::InvalidInput("ttl overflows the clock".into()))?;
        map.insert(row, expires_at);
        Ok(())
    }

    /// Forgets a row, e.g. after it was deleted.
    pub fn remove(&self, row: u64) {
        self.expirations.lock().expect("ttl lock poisoned").remove(&row);
    }

    pub fn expires_at(&self, row: u64) -> Option<u64> {
        self.expirations.lock().expect("ttl lock poisoned").get(&row).copied()
    }

    pub fn is_expired(&self, row: u64, now: u64) -> bool {
        self.expires_at(row).map_or(false, |at| at <= now)
    }

    /// Collects up to `max` expired rows and forgets them. The caller is
    /// expected to delete each returned row.
    pub fn collect_expired(&self, now: u64, max: usize) -> Vec<u64> {
        let mut map = self.expirations.lock().expect("ttl lock poisoned");
        let rows: Vec<u64> = map
            .iter()
            .filter(|(_, &at)| at <= now)
            .take(max)
            .map(|(&row, _)| row)
            .collect();
        for row in &rows {
            map.remove(row);
        }
        self.expired_total.fetch_add(rows.len() as u64, Ordering::Relaxed);
        rows
    }

    /// Renumbers tracked rows after a store compaction. Rows mapped to None
    /// were tombstoned and are forgotten.
    pub fn remap(&self, mapping: &[Option<u64>]) {
        let mut map = self.expirations.lock().expect("ttl lock poisoned");
        let old = std::mem::take(&mut *map);
        for (row, expires_at) in old {
            if let Some(Some(new_row)) = mapping.get(row as usize) {
                map.insert(*new_row, expires_at);
            }
        }
    }

    pub fn record_cleanup_error(&self) {
        self.cleanup_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> TtlStatus {
        TtlStatus {
            tracked_rows: self.expirations.lock().expect("ttl lock poisoned").len() as u64,
            expired_total: self.expired_total.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for TtlManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_means_no_expiry() -> CResult<()> {
        let ttl = TtlManager::new();
        ttl.set_ttl(0, 0, 1_000)?;
        assert_eq!(ttl.expires_at(0), None);
        assert!(!ttl.is_expired(0, u64::MAX));
        Ok(())
    }

    #[test]
    fn expiry_is_absolute() -> CResult<()> {
        let ttl = TtlManager::new();
        ttl.set_ttl(1, 10, 1_000_000)?;
        assert_eq!(ttl.expires_at(1), Some(11_000_000));
        assert!(!ttl.is_expired(1, 10_999_999));
        assert!(ttl.is_expired(1, 11_000_000));
        Ok(())
    }

    #[test]
    fn zero_ttl_clears_existing() -> CResult<()> {
        let ttl = TtlManager::new();
        ttl.set_ttl(1, 10, 1_000)?;
        ttl.set_ttl(1, 0, 1_000)?;
        assert_eq!(ttl.expires_at(1), None);
        Ok(())
    }

    #[test]
    fn collect_is_bounded() -> CResult<()> {
        let ttl = TtlManager::new();
        for row in 0..10 {
            ttl.set_ttl(row, 1, 0)?;
        }
        let first = ttl.collect_expired(2_000_000, 3);
        assert_eq!(first.len(), 3);
        let rest = ttl.collect_expired(2_000_000, 100);
        assert_eq!(rest.len(), 7);
        assert!(ttl.collect_expired(2_000_000, 100).is_empty());
        assert_eq!(ttl.status().expired_total, 10);
        Ok(())
    }

    #[test]
    fn unexpired_rows_not_collected() -> CResult<()> {
        let ttl = TtlManager::new();
        ttl.set_ttl(0, 1, 0)?;
        ttl.set_ttl(1, 1_000, 0)?;
        assert_eq!(ttl.collect_expired(2_000_000, 10), vec![0]);
        assert_eq!(ttl.status().tracked_rows, 1);
        Ok(())
    }
}

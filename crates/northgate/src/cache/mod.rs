// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable store-and-forward caches.
//!
//! Every North connector owns one cache directory:
//!
//! ```text
//! north-<id>/
//! ├── cache.db     value queue, file queue index, archive records
//! ├── files/       queued files
//! └── archive/     delivered or expired files kept until their deadline
//! ```
//!
//! South connectors only use `cache.db`, for their history read cursors.
//!
//! Producers only [`ValueCache::add`] / [`FileCache::add`]; the delivery
//! scheduler is the single consumer through [`CacheQueue`].

mod db;
mod file;
mod value;

pub use db::CacheDb;
pub use file::FileCache;
pub use value::ValueCache;

use crate::error::Result;
use crate::model::CacheEntry;
use chrono::{DateTime, Utc};

/// Consumer side of a cache queue.
pub trait CacheQueue: Send + Sync {
    /// Up to `max` entries from the head of the queue, in sequence order.
    /// Entries stay queued and are marked in flight until acked or released.
    fn peek_batch(&self, max: usize) -> Result<Vec<CacheEntry>>;

    /// Remove delivered entries and hand them to the archive.
    fn ack(&self, ids: &[u64]) -> Result<usize>;

    /// Clear the in-flight mark of entries whose delivery failed.
    fn release(&self, ids: &[u64]);

    /// Number of queued entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by queued entries.
    fn queued_bytes(&self) -> u64;
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Oldest `excess` ids that are not in flight.
pub(crate) fn expiry_candidates(
    queued: impl Iterator<Item = u64>,
    in_flight: &std::collections::BTreeSet<u64>,
    excess: usize,
) -> Vec<u64> {
    queued
        .filter(|id| !in_flight.contains(id))
        .take(excess)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_millis_round_trip() {
        let now = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(now), 1_700_000_000_123);
    }

    #[test]
    fn test_expiry_skips_in_flight() {
        let in_flight: BTreeSet<u64> = [1, 2].into_iter().collect();
        let ids = expiry_candidates([1, 2, 3, 4, 5].into_iter(), &in_flight, 2);
        assert_eq!(ids, vec![3, 4]);
    }
}

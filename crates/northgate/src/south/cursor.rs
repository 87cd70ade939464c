// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persisted read cursors of history partitions.

use crate::cache::{from_millis, to_millis, CacheDb};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// Progress of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    pub partition: String,
    /// Latest instant received for this partition.
    pub max_instant: Option<DateTime<Utc>>,
    /// The whole requested range was read.
    pub exhausted: bool,
}

/// Cursor table of a South cache database.
pub struct CursorStore {
    db: Arc<CacheDb>,
}

impl CursorStore {
    pub fn new(db: Arc<CacheDb>) -> Self {
        Self { db }
    }

    pub fn get(&self, partition: &str) -> Result<PartitionCursor> {
        let row: Option<(Option<i64>, bool)> = self.db.with(|conn| {
            conn.query_row(
                "SELECT max_instant_ms, exhausted FROM history_cursor WHERE partition = ?1",
                [partition],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })?;
        let (max_instant, exhausted) = row.unwrap_or((None, false));
        Ok(PartitionCursor {
            partition: partition.to_string(),
            max_instant: max_instant.map(from_millis),
            exhausted,
        })
    }

    /// Move the cursor forward. Older instants are ignored.
    pub fn advance(&self, partition: &str, instant: DateTime<Utc>) -> Result<()> {
        let ms = to_millis(instant);
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO history_cursor (partition, max_instant_ms, exhausted)
                 VALUES (?1, ?2, 0)
                 ON CONFLICT(partition) DO UPDATE SET max_instant_ms = ?2
                 WHERE max_instant_ms IS NULL OR max_instant_ms < ?2",
                params![partition, ms],
            )
        })?;
        Ok(())
    }

    pub fn mark_exhausted(&self, partition: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO history_cursor (partition, max_instant_ms, exhausted)
                 VALUES (?1, NULL, 1)
                 ON CONFLICT(partition) DO UPDATE SET exhausted = 1",
                [partition],
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_only_moves_forward() {
        let store = CursorStore::new(Arc::new(CacheDb::open_in_memory().unwrap()));
        assert_eq!(store.get("fast").unwrap().max_instant, None);

        let t1 = DateTime::from_timestamp(100, 0).unwrap();
        let t0 = DateTime::from_timestamp(50, 0).unwrap();
        store.advance("fast", t1).unwrap();
        store.advance("fast", t0).unwrap();
        assert_eq!(store.get("fast").unwrap().max_instant, Some(t1));
        assert!(!store.get("fast").unwrap().exhausted);

        store.mark_exhausted("fast").unwrap();
        let cursor = store.get("fast").unwrap();
        assert!(cursor.exhausted);
        assert_eq!(cursor.max_instant, Some(t1));
        assert!(!store.get("slow").unwrap().exhausted);
    }
}

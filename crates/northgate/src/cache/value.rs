// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value cache: durable queue of time-value batches.

use super::{expiry_candidates, from_millis, to_millis, CacheDb, CacheQueue};
use crate::archive::{ArchiveService, QueueTable};
use crate::error::Result;
use crate::model::{CacheEntry, Outcome, Payload, TimeValue};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Durable queue of value batches.
///
/// One row per entry; the AUTOINCREMENT key is the entry sequence id, so
/// ids never repeat even after the queue drains.
pub struct ValueCache {
    owner: String,
    db: Arc<CacheDb>,
    archive: Arc<ArchiveService>,
    capacity: usize,
    in_flight: Mutex<BTreeSet<u64>>,
    len: AtomicUsize,
    bytes: AtomicU64,
}

impl ValueCache {
    /// Open the queue, recovering entries left by a previous run.
    pub fn open(
        owner: impl Into<String>,
        db: Arc<CacheDb>,
        archive: Arc<ArchiveService>,
        capacity: usize,
    ) -> Result<Self> {
        let owner = owner.into();
        let cache = Self {
            owner,
            db,
            archive,
            capacity,
            in_flight: Mutex::new(BTreeSet::new()),
            len: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        };
        cache.refresh_counters()?;
        if !cache.is_empty() {
            debug!("{}: recovered {} queued value batch(es)", cache.owner, cache.len());
        }
        Ok(cache)
    }

    fn refresh_counters(&self) -> Result<()> {
        let (len, bytes): (i64, i64) = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(payload AS BLOB))), 0) FROM value_queue",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })?;
        self.len.store(len as usize, Ordering::SeqCst);
        self.bytes.store(bytes as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Persist a batch and return its sequence id.
    ///
    /// When the queue grows beyond its capacity, the oldest entries that
    /// are not being delivered are archived as expired.
    pub fn add(&self, source_id: &str, values: Vec<TimeValue>) -> Result<u64> {
        let count = values.len();
        let payload = serde_json::to_string(&values)?;
        let id = self.db.with(|conn| {
            conn.execute(
                "INSERT INTO value_queue (source_id, created_at_ms, value_count, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source_id, to_millis(Utc::now()), count as i64, payload],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })?;
        self.refresh_counters()?;
        trace!(
            "{}: queued {} value(s) from {} as entry {}",
            self.owner,
            count,
            source_id,
            id
        );

        self.expire_overflow()?;
        Ok(id)
    }

    fn expire_overflow(&self) -> Result<()> {
        // Held through the removal so a concurrent peek cannot pick an
        // entry chosen for expiry.
        let mut in_flight = self.in_flight.lock();
        let len = self.len();
        if len <= self.capacity {
            return Ok(());
        }
        let queued = self.queued_ids()?;
        let ids = expiry_candidates(queued.into_iter(), &in_flight, len - self.capacity);
        if ids.is_empty() {
            return Ok(());
        }
        warn!(
            "{}: value cache over capacity ({} > {}), expiring {} oldest batch(es)",
            self.owner,
            len,
            self.capacity,
            ids.len()
        );
        self.archive_entries(&ids, Outcome::Expired, &mut in_flight)?;
        Ok(())
    }

    /// Total number of queued values across all entries.
    pub fn value_count(&self) -> Result<u64> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(value_count), 0) FROM value_queue",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(count as u64)
    }

    fn queued_ids(&self) -> Result<Vec<u64>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM value_queue ORDER BY id ASC")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0).map(|id| id as u64))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    fn select(&self, ids: &[u64]) -> Result<Vec<CacheEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_id, created_at_ms, payload FROM value_queue WHERE id = ?1",
            )?;
            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = stmt
                    .query_map([*id as i64], Self::row_to_entry)?
                    .next()
                    .transpose()?
                {
                    entries.push(entry);
                }
            }
            Ok(entries)
        })
    }

    /// Move entries to the archive. They stay queued if archiving fails.
    fn archive_entries(
        &self,
        ids: &[u64],
        outcome: Outcome,
        in_flight: &mut BTreeSet<u64>,
    ) -> Result<usize> {
        let entries = self.select(ids)?;
        let archived = self
            .archive
            .archive_from(QueueTable::Values, entries, outcome)?;
        for id in &archived {
            in_flight.remove(id);
        }
        self.refresh_counters()?;
        Ok(archived.len())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
        let payload: String = row.get(3)?;
        let values: Vec<TimeValue> = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(CacheEntry {
            id: row.get::<_, i64>(0)? as u64,
            source_id: row.get(1)?,
            created_at: from_millis(row.get(2)?),
            payload: Payload::Values(values),
        })
    }
}

impl CacheQueue for ValueCache {
    fn peek_batch(&self, max: usize) -> Result<Vec<CacheEntry>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut in_flight = self.in_flight.lock();
        let entries = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_id, created_at_ms, payload
                 FROM value_queue
                 ORDER BY id ASC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([max as i64], Self::row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        in_flight.extend(entries.iter().map(|e| e.id));
        Ok(entries)
    }

    fn ack(&self, ids: &[u64]) -> Result<usize> {
        let mut in_flight = self.in_flight.lock();
        self.archive_entries(ids, Outcome::Delivered, &mut in_flight)
    }

    fn release(&self, ids: &[u64]) {
        let mut in_flight = self.in_flight.lock();
        for id in ids {
            in_flight.remove(id);
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    fn queued_bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

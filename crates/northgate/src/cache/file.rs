// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File cache: queued files plus their index.

use super::{expiry_candidates, from_millis, to_millis, CacheDb, CacheQueue};
use crate::archive::{move_file, ArchiveService, QueueTable};
use crate::error::{GatewayError, Result};
use crate::model::{CacheEntry, FileRef, Outcome, Payload};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Durable queue of files.
///
/// Files are copied into the cache `files/` folder as
/// `<stem>-<timestamp><ext>` so several North caches can queue the same
/// South output independently.
pub struct FileCache {
    owner: String,
    db: Arc<CacheDb>,
    archive: Arc<ArchiveService>,
    folder: PathBuf,
    capacity: usize,
    in_flight: Mutex<BTreeSet<u64>>,
    len: AtomicUsize,
    bytes: AtomicU64,
}

impl FileCache {
    /// Open the queue, dropping index rows whose file disappeared.
    pub fn open(
        owner: impl Into<String>,
        db: Arc<CacheDb>,
        archive: Arc<ArchiveService>,
        folder: impl Into<PathBuf>,
        capacity: usize,
    ) -> Result<Self> {
        let folder = folder.into();
        std::fs::create_dir_all(&folder)?;
        let cache = Self {
            owner: owner.into(),
            db,
            archive,
            folder,
            capacity,
            in_flight: Mutex::new(BTreeSet::new()),
            len: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        };
        cache.recover()?;
        Ok(cache)
    }

    fn recover(&self) -> Result<()> {
        let entries = self.all()?;
        let missing: Vec<u64> = entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                Payload::File(file) if !file.path.exists() => Some(entry.id),
                _ => None,
            })
            .collect();
        if !missing.is_empty() {
            warn!(
                "{}: {} queued file(s) missing on disk, dropped from the queue",
                self.owner,
                missing.len()
            );
            self.delete_rows(&missing)?;
        }
        self.refresh_counters()?;
        if !self.is_empty() {
            debug!("{}: recovered {} queued file(s)", self.owner, self.len());
        }
        Ok(())
    }

    fn refresh_counters(&self) -> Result<()> {
        let (len, bytes): (i64, i64) = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM file_queue",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })?;
        self.len.store(len as usize, Ordering::SeqCst);
        self.bytes.store(bytes as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Copy `source` into the cache and queue it.
    pub fn add(&self, source_id: &str, source: &Path) -> Result<u64> {
        let target = self.target_path(source)?;
        std::fs::copy(source, &target)?;
        self.enqueue(source_id, source, target)
    }

    /// Move an already owned file (e.g. taken back from the archive) into
    /// the cache and queue it.
    pub fn restore(&self, source_id: &str, file: &FileRef) -> Result<u64> {
        let target = self.target_path(Path::new(&file.original_name))?;
        move_file(&file.path, &target)?;
        self.enqueue(source_id, Path::new(&file.original_name), target)
    }

    fn enqueue(&self, source_id: &str, original: &Path, target: PathBuf) -> Result<u64> {
        let size = std::fs::metadata(&target)?.len();
        let original_name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = self.db.with(|conn| {
            conn.execute(
                "INSERT INTO file_queue (source_id, created_at_ms, original_name, path, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    source_id,
                    to_millis(Utc::now()),
                    original_name,
                    target.to_string_lossy(),
                    size as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })?;
        self.refresh_counters()?;
        trace!(
            "{}: queued file {} from {} as entry {}",
            self.owner,
            target.display(),
            source_id,
            id
        );

        self.expire_overflow()?;
        Ok(id)
    }

    fn target_path(&self, source: &Path) -> Result<PathBuf> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                GatewayError::Cache(format!("not a file path: {}", source.display()))
            })?;
        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let stamp = Utc::now().timestamp_millis();
        let mut candidate = self.folder.join(format!("{stem}-{stamp}{ext}"));
        let mut suffix = 1;
        while candidate.exists() {
            candidate = self.folder.join(format!("{stem}-{stamp}-{suffix}{ext}"));
            suffix += 1;
        }
        Ok(candidate)
    }

    fn expire_overflow(&self) -> Result<()> {
        // Held through the removal so a concurrent peek cannot pick an
        // entry chosen for expiry.
        let mut in_flight = self.in_flight.lock();
        let len = self.len();
        if len <= self.capacity {
            return Ok(());
        }
        let queued: Vec<u64> = self.all()?.iter().map(|e| e.id).collect();
        let ids = expiry_candidates(queued.into_iter(), &in_flight, len - self.capacity);
        if ids.is_empty() {
            return Ok(());
        }
        warn!(
            "{}: file cache over capacity ({} > {}), expiring {} oldest file(s)",
            self.owner,
            len,
            self.capacity,
            ids.len()
        );
        self.archive_entries(&ids, Outcome::Expired, &mut in_flight)?;
        Ok(())
    }

    /// Every queued entry, oldest first.
    pub fn all(&self) -> Result<Vec<CacheEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_id, created_at_ms, original_name, path, size
                 FROM file_queue
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], Self::row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Drop queued files without delivering them.
    pub fn discard(&self, ids: &[u64]) -> Result<usize> {
        let mut in_flight = self.in_flight.lock();
        let entries = self.select(ids)?;
        let found: Vec<u64> = entries.iter().map(|e| e.id).collect();
        self.delete_rows(&found)?;
        for id in &found {
            in_flight.remove(id);
        }
        self.refresh_counters()?;
        drop(in_flight);

        for entry in &entries {
            if let Payload::File(file) = &entry.payload {
                crate::archive::remove_file_if_exists(&file.path)?;
            }
        }
        Ok(entries.len())
    }

    fn select(&self, ids: &[u64]) -> Result<Vec<CacheEntry>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|e| ids.contains(&e.id))
            .collect())
    }

    /// Move entries to the archive. They stay queued, files included, if
    /// archiving fails.
    fn archive_entries(
        &self,
        ids: &[u64],
        outcome: Outcome,
        in_flight: &mut BTreeSet<u64>,
    ) -> Result<usize> {
        let entries = self.select(ids)?;
        let archived = self
            .archive
            .archive_from(QueueTable::Files, entries, outcome)?;
        for id in &archived {
            in_flight.remove(id);
        }
        self.refresh_counters()?;
        Ok(archived.len())
    }

    fn delete_rows(&self, ids: &[u64]) -> Result<()> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM file_queue WHERE id = ?1")?;
                for id in ids {
                    stmt.execute([*id as i64])?;
                }
            }
            tx.commit()
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
        let created_at = from_millis(row.get(2)?);
        let path: String = row.get(4)?;
        Ok(CacheEntry {
            id: row.get::<_, i64>(0)? as u64,
            source_id: row.get(1)?,
            created_at,
            payload: Payload::File(FileRef {
                path: PathBuf::from(path),
                original_name: row.get(3)?,
                size: row.get::<_, i64>(5)? as u64,
                created_at,
            }),
        })
    }
}

impl CacheQueue for FileCache {
    fn peek_batch(&self, max: usize) -> Result<Vec<CacheEntry>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut in_flight = self.in_flight.lock();
        let entries = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_id, created_at_ms, original_name, path, size
                 FROM file_queue
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;

    struct Fixture {
        dir: tempfile::TempDir,
        cache: FileCache,
        archive: Arc<ArchiveService>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CacheDb::open(&dir.path().join("cache.db")).unwrap());
        let archive = Arc::new(ArchiveService::new(
            "north-1",
            ArchiveConfig {
                enabled: true,
                retention_duration_hours: 24,
            },
            Arc::clone(&db),
            dir.path().join("archive"),
        ));
        let cache = FileCache::open(
            "north-1",
            db,
            Arc::clone(&archive),
            dir.path().join("files"),
            capacity,
        )
        .unwrap();
        Fixture {
            dir,
            cache,
            archive,
        }
    }

    fn source_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_add_copies_and_acks_into_archive() {
        let f = fixture(10);
        let source = source_file(f.dir.path(), "report.csv", b"1,2,3");

        let id = f.cache.add("south-1", &source).unwrap();
        assert!(source.exists(), "source file is left to its producer");
        assert_eq!(f.cache.len(), 1);
        assert_eq!(f.cache.queued_bytes(), 5);

        let batch = f.cache.peek_batch(1).unwrap();
        let Payload::File(file) = &batch[0].payload else {
            panic!("expected a file entry");
        };
        assert_eq!(file.original_name, "report.csv");
        assert!(file.path.starts_with(f.dir.path().join("files")));

        f.cache.ack(&[id]).unwrap();
        assert!(f.cache.is_empty());
        assert!(!file.path.exists());
        let archived = f.archive.list(None).unwrap();
        let Payload::File(archived_file) = &archived[0].payload else {
            panic!("expected a file record");
        };
        assert!(archived_file.path.exists());
    }

    #[test]
    fn test_restore_from_archive() {
        let f = fixture(10);
        let source = source_file(f.dir.path(), "a.txt", b"abc");
        let id = f.cache.add("south-1", &source).unwrap();
        f.cache.peek_batch(1).unwrap();
        f.cache.ack(&[id]).unwrap();

        let archived_id = f.archive.list(None).unwrap()[0].id;
        let record = f.archive.take(&[archived_id]).unwrap();
        let Payload::File(file) = &record[0].payload else {
            panic!("expected a file record");
        };
        let restored = f.cache.restore(&record[0].source_id, file).unwrap();
        assert!(restored > id);
        assert_eq!(f.cache.len(), 1);
        assert!(!file.path.exists());
    }

    #[test]
    fn test_recover_drops_missing_files() {
        let f = fixture(10);
        let source = source_file(f.dir.path(), "a.txt", b"abc");
        f.cache.add("south-1", &source).unwrap();
        let batch = f.cache.peek_batch(1).unwrap();
        let Payload::File(file) = &batch[0].payload else {
            panic!("expected a file entry");
        };
        std::fs::remove_file(&file.path).unwrap();

        f.cache.recover().unwrap();
        assert!(f.cache.is_empty());
    }

    #[test]
    fn test_overflow_expires_oldest() {
        let f = fixture(1);
        let a = source_file(f.dir.path(), "a.txt", b"a");
        let b = source_file(f.dir.path(), "b.txt", b"b");
        let first = f.cache.add("south-1", &a).unwrap();
        f.cache.add("south-1", &b).unwrap();

        assert_eq!(f.cache.len(), 1);
        let expired = f.archive.list(Some(Outcome::Expired)).unwrap();
        assert_eq!(expired[0].entry_id, first);
    }

    #[test]
    fn test_discard() {
        let f = fixture(10);
        let a = source_file(f.dir.path(), "a.txt", b"a");
        let id = f.cache.add("south-1", &a).unwrap();
        assert_eq!(f.cache.discard(&[id]).unwrap(), 1);
        assert!(f.cache.is_empty());
        assert_eq!(f.archive.count().unwrap(), 0);
    }

    #[test]
    fn test_failed_ack_keeps_file_queued() {
        let f = fixture(10);
        // The archive folder cannot be created.
        std::fs::write(f.dir.path().join("archive"), b"not a folder").unwrap();
        let source = source_file(f.dir.path(), "report.csv", b"1,2,3");
        let id = f.cache.add("south-1", &source).unwrap();

        let batch = f.cache.peek_batch(1).unwrap();
        let Payload::File(file) = &batch[0].payload else {
            panic!("expected a file entry");
        };
        assert!(f.cache.ack(&[id]).is_err());
        assert_eq!(f.cache.len(), 1);
        assert_eq!(f.archive.count().unwrap(), 0);
        assert!(file.path.exists());

        std::fs::remove_file(f.dir.path().join("archive")).unwrap();
        assert_eq!(f.cache.ack(&[id]).unwrap(), 1);
        assert!(f.cache.is_empty());
        assert_eq!(f.archive.count().unwrap(), 1);
        assert!(!file.path.exists());
    }
}

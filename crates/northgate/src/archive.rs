// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Archive service.
//!
//! Receives entries leaving a North cache, either delivered or expired by
//! overflow. With archiving enabled, records are kept until
//! `archived_at + retention` and purged by [`ArchiveService::sweep`]; files
//! are moved into the `archive/` folder. With archiving disabled,
//! [`ArchiveService::archive`] deletes immediately.

use crate::cache::{from_millis, to_millis, CacheDb};
use crate::config::ArchiveConfig;
use crate::error::{GatewayError, Result};
use crate::model::{CacheEntry, Outcome, Payload};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Queue table an archived entry is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueTable {
    Values,
    Files,
}

impl QueueTable {
    fn delete_sql(self) -> &'static str {
        match self {
            QueueTable::Values => "DELETE FROM value_queue WHERE id = ?1",
            QueueTable::Files => "DELETE FROM file_queue WHERE id = ?1",
        }
    }
}

/// An entry kept in the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    /// Archive record id.
    pub id: u64,
    /// Sequence id the entry had in its queue.
    pub entry_id: u64,
    pub source_id: String,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    /// Purged by the first sweep at or after this instant.
    pub deadline: DateTime<Utc>,
    pub payload: Payload,
}

/// Archive of one North cache.
pub struct ArchiveService {
    owner: String,
    config: ArchiveConfig,
    db: Arc<CacheDb>,
    folder: PathBuf,
}

impl ArchiveService {
    pub fn new(
        owner: impl Into<String>,
        config: ArchiveConfig,
        db: Arc<CacheDb>,
        folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            owner: owner.into(),
            config,
            db,
            folder: folder.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Archive (or delete, when disabled) an entry.
    pub fn archive(&self, entry: CacheEntry, outcome: Outcome) -> Result<()> {
        self.archive_at(None, vec![entry], outcome, Utc::now())?;
        Ok(())
    }

    /// Move entries out of `queue` into the archive.
    ///
    /// The archive records and the deletion of the queue rows are committed
    /// in one transaction. On any failure the entries stay queued and their
    /// files stay in the cache folder. Returns the ids taken off the queue.
    pub(crate) fn archive_from(
        &self,
        queue: QueueTable,
        entries: Vec<CacheEntry>,
        outcome: Outcome,
    ) -> Result<Vec<u64>> {
        self.archive_at(Some(queue), entries, outcome, Utc::now())
    }

    fn archive_at(
        &self,
        queue: Option<QueueTable>,
        entries: Vec<CacheEntry>,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Vec<u64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if !self.config.enabled {
            return self.drop_entries(queue, entries, outcome);
        }

        let deadline = self
            .config
            .retention()
            .and_then(|retention| now.checked_add_signed(retention))
            .ok_or_else(|| {
                GatewayError::invalid(format!(
                    "{}: archive retention of {} hour(s) is out of range",
                    self.owner, self.config.retention_duration_hours
                ))
            })?;

        let mut moves: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut staged = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.stage(entry).and_then(|(entry, moved)| {
                moves.extend(moved);
                let json = serde_json::to_string(&entry.payload)?;
                Ok((entry, json))
            });
            match result {
                Ok(item) => staged.push(item),
                Err(err) => {
                    self.unstage(&moves);
                    return Err(err);
                }
            }
        }

        let committed = self.db.with(|conn| {
            let tx = conn.transaction()?;
            let mut archived = Vec::with_capacity(staged.len());
            {
                let mut insert = tx.prepare(
                    "INSERT INTO archive
                        (entry_id, source_id, outcome, created_at_ms, archived_at_ms, deadline_ms, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                let mut delete = match queue {
                    Some(queue) => Some(tx.prepare(queue.delete_sql())?),
                    None => None,
                };
                for (entry, json) in &staged {
                    if let Some(delete) = delete.as_mut() {
                        if delete.execute([entry.id as i64])? == 0 {
                            continue;
                        }
                    }
                    insert.execute(params![
                        entry.id as i64,
                        entry.source_id,
                        outcome.as_str(),
                        to_millis(entry.created_at),
                        to_millis(now),
                        to_millis(deadline),
                        json,
                    ])?;
                    archived.push(entry.id);
                }
            }
            tx.commit()?;
            Ok(archived)
        });
        let archived = match committed {
            Ok(archived) => archived,
            Err(err) => {
                self.unstage(&moves);
                return Err(err);
            }
        };

        // Entries no longer queued (taken by someone else) get their file back.
        if archived.len() != staged.len() {
            let orphans: Vec<(PathBuf, PathBuf)> = staged
                .iter()
                .filter(|(entry, _)| !archived.contains(&entry.id))
                .filter_map(|(entry, _)| match &entry.payload {
                    Payload::File(file) => moves.iter().find(|(_, to)| *to == file.path).cloned(),
                    Payload::Values(_) => None,
                })
                .collect();
            self.unstage(&orphans);
        }
        trace!(
            "{}: {} entr(ies) archived as {}",
            self.owner,
            archived.len(),
            outcome
        );
        Ok(archived)
    }

    /// Archiving disabled: delete the queue rows, then the files.
    fn drop_entries(
        &self,
        queue: Option<QueueTable>,
        entries: Vec<CacheEntry>,
        outcome: Outcome,
    ) -> Result<Vec<u64>> {
        let dropped: Vec<u64> = match queue {
            Some(queue) => self.db.with(|conn| {
                let tx = conn.transaction()?;
                let mut dropped = Vec::with_capacity(entries.len());
                {
                    let mut delete = tx.prepare(queue.delete_sql())?;
                    for entry in &entries {
                        if delete.execute([entry.id as i64])? > 0 {
                            dropped.push(entry.id);
                        }
                    }
                }
                tx.commit()?;
                Ok(dropped)
            })?,
            None => entries.iter().map(|e| e.id).collect(),
        };
        for entry in entries.iter().filter(|e| dropped.contains(&e.id)) {
            if let Payload::File(file) = &entry.payload {
                if let Err(err) = remove_file_if_exists(&file.path) {
                    warn!(
                        "{}: could not remove file {}: {}",
                        self.owner,
                        file.path.display(),
                        err
                    );
                }
            }
        }
        trace!("{}: {} entr(ies) {} and dropped", self.owner, dropped.len(), outcome);
        Ok(dropped)
    }

    /// Move the file of a file entry into the archive folder.
    fn stage(&self, mut entry: CacheEntry) -> Result<(CacheEntry, Option<(PathBuf, PathBuf)>)> {
        let moved = match &mut entry.payload {
            Payload::File(file) => {
                std::fs::create_dir_all(&self.folder)?;
                let file_name = file
                    .path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| file.original_name.clone().into());
                let target = self.folder.join(file_name);
                move_file(&file.path, &target)?;
                let from = std::mem::replace(&mut file.path, target.clone());
                Some((from, target))
            }
            Payload::Values(_) => None,
        };
        Ok((entry, moved))
    }

    /// Put staged files back where they came from.
    fn unstage(&self, moves: &[(PathBuf, PathBuf)]) {
        for (from, to) in moves {
            if let Err(err) = move_file(to, from) {
                error!(
                    "{}: could not move {} back to {}: {}",
                    self.owner,
                    to.display(),
                    from.display(),
                    err
                );
            }
        }
    }

    /// Purge records whose deadline has passed. Returns the number purged.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now())
    }

    /// Purge records whose deadline is at or before `now`.
    ///
    /// Works on a snapshot of due records, so entries archived while the
    /// sweep runs are left for the next pass.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entry_id, source_id, outcome, created_at_ms, archived_at_ms, deadline_ms, payload
                 FROM archive
                 WHERE deadline_ms <= ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([to_millis(now)], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        if due.is_empty() {
            return Ok(0);
        }

        let ids: Vec<u64> = due.iter().map(|r| r.id).collect();
        for record in &due {
            if let Payload::File(file) = &record.payload {
                if let Err(err) = remove_file_if_exists(&file.path) {
                    warn!(
                        "{}: could not remove archived file {}: {}",
                        self.owner,
                        file.path.display(),
                        err
                    );
                }
            }
        }
        let purged = self.delete_rows(&ids)?;
        info!("{}: archive sweep purged {} record(s)", self.owner, purged);
        Ok(purged)
    }

    /// Archived records, oldest first, optionally filtered by outcome.
    pub fn list(&self, outcome: Option<Outcome>) -> Result<Vec<ArchiveRecord>> {
        let records = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entry_id, source_id, outcome, created_at_ms, archived_at_ms, deadline_ms, payload
                 FROM archive
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(records
            .into_iter()
            .filter(|r| outcome.map_or(true, |o| r.outcome == o))
            .collect())
    }

    /// Number of archived records.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .with(|conn| conn.query_row("SELECT COUNT(*) FROM archive", [], |row| row.get(0)))?;
        Ok(count as usize)
    }

    /// Remove records from the archive and return them, leaving archived
    /// files in place for the caller to re-queue.
    pub fn take(&self, ids: &[u64]) -> Result<Vec<ArchiveRecord>> {
        let records: Vec<ArchiveRecord> = self
            .list(None)?
            .into_iter()
            .filter(|r| ids.contains(&r.id))
            .collect();
        let taken: Vec<u64> = records.iter().map(|r| r.id).collect();
        self.delete_rows(&taken)?;
        debug!("{}: {} record(s) taken out of the archive", self.owner, taken.len());
        Ok(records)
    }

    /// Delete records and their files.
    pub fn remove(&self, ids: &[u64]) -> Result<usize> {
        let records = self.take(ids)?;
        for record in &records {
            if let Payload::File(file) = &record.payload {
                remove_file_if_exists(&file.path)?;
            }
        }
        Ok(records.len())
    }

    fn delete_rows(&self, ids: &[u64]) -> Result<usize> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM archive WHERE id = ?1")?;
                for id in ids {
                    deleted += stmt.execute([*id as i64])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ArchiveRecord> {
        let outcome: String = row.get(3)?;
        let payload: String = row.get(7)?;
        let payload = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(ArchiveRecord {
            id: row.get::<_, i64>(0)? as u64,
            entry_id: row.get::<_, i64>(1)? as u64,
            source_id: row.get(2)?,
            outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Delivered),
            created_at: from_millis(row.get(4)?),
            archived_at: from_millis(row.get(5)?),
            deadline: from_millis(row.get(6)?),
            payload,
        })
    }
}

/// Delete a file, treating "already gone" as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Rename, falling back to copy + delete across filesystems.
pub(crate) fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

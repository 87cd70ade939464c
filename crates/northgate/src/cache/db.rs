// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite database backing one connector cache directory.

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Connector cache database.
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE value_queue (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     source_id TEXT NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     value_count INTEGER NOT NULL,
///     payload TEXT NOT NULL
/// );
/// CREATE TABLE file_queue (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     source_id TEXT NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     original_name TEXT NOT NULL,
///     path TEXT NOT NULL,
///     size INTEGER NOT NULL
/// );
/// CREATE TABLE archive (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     entry_id INTEGER NOT NULL,
///     source_id TEXT NOT NULL,
///     outcome TEXT NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     archived_at_ms INTEGER NOT NULL,
///     deadline_ms INTEGER NOT NULL,
///     payload TEXT NOT NULL
/// );
/// CREATE TABLE history_cursor (
///     partition TEXT PRIMARY KEY,
///     max_instant_ms INTEGER,
///     exhausted INTEGER NOT NULL DEFAULT 0
/// );
/// ```
pub struct CacheDb {
    conn: Mutex<Connection>,
}

impl CacheDb {
    /// Open (or create) the database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS value_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                value_count INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS file_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                original_name TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS archive (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id INTEGER NOT NULL,
                source_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                archived_at_ms INTEGER NOT NULL,
                deadline_ms INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_archive_deadline ON archive(deadline_ms);
            CREATE TABLE IF NOT EXISTS history_cursor (
                partition TEXT PRIMARY KEY,
                max_instant_ms INTEGER,
                exhausted INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> Result<R> {
        let mut conn = self.conn.lock();
        Ok(f(&mut conn)?)
    }
}

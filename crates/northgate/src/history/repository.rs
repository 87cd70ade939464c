// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! History query storage.
//!
//! Connector settings are read-only for the runtime; the repository is the
//! one place where a history query's `status` and `enabled` flag are
//! written back.

use super::{HistoryQuery, HistoryStatus};
use crate::config::HistoryQueryConfig;
use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Storage of history query definitions and status.
pub trait HistoryQueryRepository: Send + Sync {
    /// Every query, by `order` then id.
    fn list(&self) -> Result<Vec<HistoryQuery>>;

    fn find(&self, id: &str) -> Result<Option<HistoryQuery>>;

    /// Insert a new query as `pending`, or refresh the definition of a
    /// known one while keeping its status and `enabled` flag.
    fn upsert(&self, config: &HistoryQueryConfig) -> Result<()>;

    fn update_status(&self, id: &str, status: HistoryStatus) -> Result<()>;

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()>;

    /// Next query to run: an interrupted `running` one first, then the
    /// first `pending` one by order.
    fn next_runnable(&self) -> Result<Option<HistoryQuery>> {
        let queries: Vec<HistoryQuery> = self
            .list()?
            .into_iter()
            .filter(HistoryQuery::is_runnable)
            .collect();
        let resumed = queries
            .iter()
            .position(|q| q.status == HistoryStatus::Running);
        Ok(match resumed {
            Some(i) => queries.into_iter().nth(i),
            None => queries.into_iter().next(),
        })
    }

    /// Upsert every configured query.
    fn seed(&self, configs: &[HistoryQueryConfig]) -> Result<()> {
        for config in configs {
            self.upsert(config)?;
        }
        Ok(())
    }
}

fn unknown(id: &str) -> GatewayError {
    GatewayError::invalid(format!("unknown history query {id}"))
}

/// In-memory repository (for testing and embedders without a data folder).
#[derive(Default)]
pub struct MemoryHistoryRepository {
    queries: Mutex<BTreeMap<String, HistoryQuery>>,
}

impl MemoryHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryQueryRepository for MemoryHistoryRepository {
    fn list(&self) -> Result<Vec<HistoryQuery>> {
        let mut queries: Vec<HistoryQuery> = self.queries.lock().values().cloned().collect();
        queries.sort_by(|a, b| (a.config.order, a.id()).cmp(&(b.config.order, b.id())));
        Ok(queries)
    }

    fn find(&self, id: &str) -> Result<Option<HistoryQuery>> {
        Ok(self.queries.lock().get(id).cloned())
    }

    fn upsert(&self, config: &HistoryQueryConfig) -> Result<()> {
        let mut queries = self.queries.lock();
        match queries.get_mut(&config.id) {
            Some(existing) => {
                let enabled = existing.config.enabled;
                existing.config = config.clone();
                existing.config.enabled = enabled;
            }
            None => {
                queries.insert(
                    config.id.clone(),
                    HistoryQuery {
                        config: config.clone(),
                        status: HistoryStatus::Pending,
                    },
                );
            }
        }
        Ok(())
    }

    fn update_status(&self, id: &str, status: HistoryStatus) -> Result<()> {
        let mut queries = self.queries.lock();
        let query = queries.get_mut(id).ok_or_else(|| unknown(id))?;
        query.status = status;
        Ok(())
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut queries = self.queries.lock();
        let query = queries.get_mut(id).ok_or_else(|| unknown(id))?;
        query.config.enabled = enabled;
        Ok(())
    }
}

/// SQLite repository, `<data>/history.db`.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE history_query (
///     id TEXT PRIMARY KEY,
///     sort_order INTEGER NOT NULL,
///     name TEXT NOT NULL,
///     status TEXT NOT NULL,
///     enabled INTEGER NOT NULL,
///     south_id TEXT NOT NULL,
///     north_id TEXT NOT NULL,
///     start_time TEXT NOT NULL,
///     end_time TEXT NOT NULL,
///     settings TEXT NOT NULL
/// );
/// ```
///
/// `settings` holds the whole definition as JSON; the other columns are
/// kept for inspection and ordering.
pub struct SqliteHistoryRepository {
    conn: Mutex<Connection>,
}

impl SqliteHistoryRepository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let repository = Self {
            conn: Mutex::new(conn),
        };
        repository.init_schema()?;
        Ok(repository)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let repository = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        repository.init_schema()?;
        Ok(repository)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute(
            "CREATE TABLE IF NOT EXISTS history_query (
                id TEXT PRIMARY KEY,
                sort_order INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                south_id TEXT NOT NULL,
                north_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                settings TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn row_to_query(row: &rusqlite::Row) -> rusqlite::Result<HistoryQuery> {
        let status: String = row.get(0)?;
        let enabled: bool = row.get(1)?;
        let settings: String = row.get(2)?;
        let mut config: HistoryQueryConfig = serde_json::from_str(&settings).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        config.enabled = enabled;
        Ok(HistoryQuery {
            config,
            status: HistoryStatus::parse(&status).unwrap_or(HistoryStatus::Pending),
        })
    }

    fn changed(&self, id: &str, updated: usize) -> Result<()> {
        if updated == 0 {
            return Err(unknown(id));
        }
        Ok(())
    }
}

impl HistoryQueryRepository for SqliteHistoryRepository {
    fn list(&self) -> Result<Vec<HistoryQuery>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, enabled, settings FROM history_query ORDER BY sort_order ASC, id ASC",
        )?;
        let queries = stmt
            .query_map([], Self::row_to_query)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(queries)
    }

    fn find(&self, id: &str) -> Result<Option<HistoryQuery>> {
        let query = self
            .conn
            .lock()
            .query_row(
                "SELECT status, enabled, settings FROM history_query WHERE id = ?1",
                [id],
                Self::row_to_query,
            )
            .optional()?;
        Ok(query)
    }

    fn upsert(&self, config: &HistoryQueryConfig) -> Result<()> {
        let settings = serde_json::to_string(config)?;
        self.conn.lock().execute(
            "INSERT INTO history_query
                (id, sort_order, name, status, enabled, south_id, north_id, start_time, end_time, settings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                sort_order = ?2, name = ?3, south_id = ?6, north_id = ?7,
                start_time = ?8, end_time = ?9, settings = ?10",
            params![
                config.id,
                config.order,
                config.name,
                HistoryStatus::Pending.as_str(),
                config.enabled,
                config.south_id,
                config.north_id,
                config.start_time.to_rfc3339(),
                config.end_time.to_rfc3339(),
                settings,
            ],
        )?;
        Ok(())
    }

    fn update_status(&self, id: &str, status: HistoryStatus) -> Result<()> {
        let updated = self.conn.lock().execute(
            "UPDATE history_query SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        self.changed(id, updated)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let updated = self.conn.lock().execute(
            "UPDATE history_query SET enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        self.changed(id, updated)
    }
}

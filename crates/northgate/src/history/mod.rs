// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! History queries: bounded South-to-North backfills.
//!
//! ```text
//!            scheduler pass           exhausted + North cache empty
//!  pending ─────────────────> running ──────────────────────────────> finished
//!                               │  ^
//!                   engine stop │  │ next start (cursors resume)
//!                               v  │
//!                             running (idle)
//! ```
//!
//! A query runs with its own South/North pair, scoped to
//! `<data>/history-query/<query-id>/`. At most one query runs at a time
//! across the whole engine. Failing to set a query up disables it.

mod job;
mod orchestrator;
mod repository;

pub use job::HistoryQueryJob;
pub use orchestrator::HistoryQueryOrchestrator;
pub use repository::{HistoryQueryRepository, MemoryHistoryRepository, SqliteHistoryRepository};

use crate::config::HistoryQueryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted progress of a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Pending,
    Running,
    Finished,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Pending => "pending",
            HistoryStatus::Running => "running",
            HistoryStatus::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(HistoryStatus::Pending),
            "running" => Some(HistoryStatus::Running),
            "finished" => Some(HistoryStatus::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A history query definition with its runtime status.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub config: HistoryQueryConfig,
    pub status: HistoryStatus,
}

impl HistoryQuery {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Enabled and not finished.
    pub fn is_runnable(&self) -> bool {
        self.config.enabled && self.status != HistoryStatus::Finished
    }
}

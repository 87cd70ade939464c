// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status events and connector statistics.

use crate::model::ConnectorInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event published by connectors and the history orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Connected {
        connector: String,
    },
    Disconnected {
        connector: String,
    },
    Reconnecting {
        connector: String,
        retry_in: Duration,
    },
    Error {
        connector: String,
        message: String,
    },
    /// Cache size after an add, ack or expiry.
    CacheSize {
        connector: String,
        values: usize,
        files: usize,
    },
    HistoryQuery {
        query: String,
        status: String,
    },
}

/// Receiver of status events.
pub trait StatusSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, event: StatusEvent) {
        match event {
            StatusEvent::Connected { connector } => info!("{} connected", connector),
            StatusEvent::Disconnected { connector } => info!("{} disconnected", connector),
            StatusEvent::Reconnecting {
                connector,
                retry_in,
            } => info!("{} reconnecting in {:?}", connector, retry_in),
            StatusEvent::Error { connector, message } => warn!("{}: {}", connector, message),
            StatusEvent::CacheSize {
                connector,
                values,
                files,
            } => debug!("{} cache: {} value entries, {} files", connector, values, files),
            StatusEvent::HistoryQuery { query, status } => {
                info!("History query {} is {}", query, status)
            }
        }
    }
}

/// Forwards events into an unbounded channel (useful for tests and
/// external status consumers).
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatusSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatusSink {
    fn publish(&self, event: StatusEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// Shared status sink handle.
pub type SharedStatusSink = Arc<dyn StatusSink>;

/// Statistics of a connector.
#[derive(Debug)]
pub struct ConnectorStats {
    pub connector: ConnectorInfo,

    /// Values handed to the driver (North) or received from it (South).
    pub values: AtomicU64,

    /// Files handed to the driver (North) or received from it (South).
    pub files: AtomicU64,

    /// Entries discarded (unsubscribed content type, size limit, overflow).
    pub discarded: AtomicU64,

    /// Failed handshakes or deliveries.
    pub errors: AtomicU64,

    /// Creation time.
    pub created: Instant,
}

impl ConnectorStats {
    pub fn new(connector: ConnectorInfo) -> Self {
        Self {
            connector,
            values: AtomicU64::new(0),
            files: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn record_values(&self, count: u64) {
        self.values.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> ConnectorStatsSnapshot {
        ConnectorStatsSnapshot {
            connector_id: self.connector.id.clone(),
            values: self.values.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of connector statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorStatsSnapshot {
    pub connector_id: String,
    pub values: u64,
    pub files: u64,
    pub discarded: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl ConnectorStatsSnapshot {
    /// Average values per second since creation.
    pub fn values_per_sec(&self) -> f64 {
        if self.uptime_secs == 0 {
            return self.values as f64;
        }
        self.values as f64 / self.uptime_secs as f64
    }
}

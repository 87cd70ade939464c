// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! South connector.
//!
//! Wraps a [`SouthDriver`] with its lifecycle, its scan loops and the
//! history cursors kept in `<folder>/cache.db`.
//!
//! Items are read per partition: one partition per scan mode, or one per
//! item with `max_instant_per_item`. A partition's cursor only moves when
//! the driver returned data for it, so a resumed read continues from the
//! latest instant actually received.
//!
//! Only one run (scan or history read) is in progress at a time; a scan
//! tick arriving while a run is busy is skipped.

mod cursor;
mod interval;

pub use cursor::{CursorStore, PartitionCursor};
pub use interval::{generate_intervals, Interval};

use crate::cache::CacheDb;
use crate::config::{ItemConfig, ScanModeConfig, SouthConfig};
use crate::driver::{ContentSink, DriverRegistry, Emitter, SouthContext, SouthDriver};
use crate::error::{GatewayError, Result};
use crate::lifecycle::{ConnectionState, ConnectorLifecycle, FailureNotifier};
use crate::model::{ConnectorInfo, ConnectorKind};
use crate::status::{ConnectorStats, ConnectorStatsSnapshot, SharedStatusSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a South driver.
pub type SouthLifecycle = ConnectorLifecycle<dyn SouthDriver>;

/// Items sharing one read cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub key: String,
    pub items: Vec<ItemConfig>,
}

/// Group enabled items by scan mode, or one partition per item.
pub fn partitions(items: &[ItemConfig], per_item: bool) -> Vec<Partition> {
    let mut groups: BTreeMap<String, Vec<ItemConfig>> = BTreeMap::new();
    for item in items.iter().filter(|i| i.enabled) {
        let key = if per_item {
            format!("{}/{}", item.scan_mode_id, item.id)
        } else {
            item.scan_mode_id.clone()
        };
        groups.entry(key).or_default().push(item.clone());
    }
    groups
        .into_iter()
        .map(|(key, items)| Partition { key, items })
        .collect()
}

struct ScanLoops {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// A South driver with its lifecycle, scan loops and read cursors.
pub struct SouthConnector {
    config: SouthConfig,
    folder: PathBuf,
    lifecycle: Arc<SouthLifecycle>,
    cursors: CursorStore,
    stats: Arc<ConnectorStats>,
    /// Held for the duration of a scan or history run.
    run_lock: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
    scans: Mutex<Option<ScanLoops>>,
}

impl SouthConnector {
    /// Build the connector; whatever the driver reads goes to `sink`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn create(
        config: SouthConfig,
        folder: impl Into<PathBuf>,
        registry: &DriverRegistry,
        sink: Arc<dyn ContentSink>,
        status: SharedStatusSink,
    ) -> Result<Arc<Self>> {
        let folder = folder.into();
        let info = ConnectorInfo {
            id: config.id.clone(),
            name: config.name.clone(),
            type_name: config.type_name.clone(),
            kind: ConnectorKind::South,
        };
        let stats = Arc::new(ConnectorStats::new(info.clone()));
        let failures = FailureNotifier::default();
        let driver = registry.create_south(SouthContext {
            info: info.clone(),
            settings: config.settings.clone(),
            emitter: Emitter::new(config.id.clone(), sink, Arc::clone(&stats)),
            failures: failures.clone(),
        })?;

        std::fs::create_dir_all(&folder)?;
        let db = Arc::new(CacheDb::open(&folder.join("cache.db"))?);
        let lifecycle = ConnectorLifecycle::new(
            info,
            driver,
            config.retry_interval(),
            status,
            Arc::clone(&stats),
        );
        lifecycle.bind_failures(&failures);

        Ok(Arc::new(Self {
            config,
            folder,
            lifecycle,
            cursors: CursorStore::new(db),
            stats,
            run_lock: tokio::sync::Mutex::new(()),
            stopping: AtomicBool::new(false),
            scans: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SouthConfig {
        &self.config
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Arc<SouthLifecycle> {
        &self.lifecycle
    }

    pub fn stats(&self) -> ConnectorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Open the session without starting scan loops.
    ///
    /// Transport failures keep being retried by the lifecycle and are only
    /// logged; configuration failures are returned.
    pub async fn connect(&self) -> Result<()> {
        self.stopping.store(false, Ordering::SeqCst);
        if let Err(err) = self.lifecycle.connect().await {
            if err.is_configuration() || !self.lifecycle.is_enabled() {
                return Err(err);
            }
            warn!("South {}: not connected yet: {}", self.config.id, err);
        }
        Ok(())
    }

    /// Connect and run one loop per scan mode used by an enabled item.
    pub async fn start(self: &Arc<Self>, scan_modes: &[ScanModeConfig]) -> Result<()> {
        self.connect().await?;

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();
        for mode in scan_modes {
            let used = self
                .config
                .items
                .iter()
                .any(|i| i.enabled && i.scan_mode_id == mode.id);
            if !used {
                continue;
            }
            let south = Arc::clone(self);
            let mode = mode.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                south.scan_loop(mode, shutdown).await;
            }));
        }

        info!(
            "South {} started with {} scan mode(s)",
            self.config.id,
            handles.len()
        );
        *self.scans.lock() = Some(ScanLoops { shutdown, handles });
        Ok(())
    }

    /// Stop scan loops and any history read (between two sub-intervals),
    /// then disconnect. Safe to call more than once.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let scans = self.scans.lock().take();
        if let Some(scans) = scans {
            scans.shutdown.cancel();
            for handle in scans.handles {
                if let Err(err) = handle.await {
                    warn!("South {}: scan task ended abnormally: {}", self.config.id, err);
                }
            }
        }
        if let Err(err) = self.lifecycle.disconnect().await {
            warn!("South {}: {}", self.config.id, err);
        }
        info!("South {} stopped", self.config.id);
    }

    async fn scan_loop(&self, mode: ScanModeConfig, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(mode.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("South {}: scan mode {} started", self.config.id, mode.id);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.run_scan(&mode).await {
                self.report_failure(err).await;
            }
        }

        debug!("South {}: scan mode {} stopped", self.config.id, mode.id);
    }

    /// Read the items of `mode` once. Returns `false` when the run was
    /// skipped (busy or not connected).
    pub async fn run_scan(&self, mode: &ScanModeConfig) -> Result<bool> {
        let Ok(_run) = self.run_lock.try_lock() else {
            debug!(
                "South {}: scan {} skipped, previous run still in progress",
                self.config.id, mode.id
            );
            return Ok(false);
        };
        if !self.lifecycle.is_connected() {
            trace!("South {}: scan {} skipped, not connected", self.config.id, mode.id);
            return Ok(false);
        }

        let items: Vec<ItemConfig> = self
            .config
            .items
            .iter()
            .filter(|i| i.enabled && i.scan_mode_id == mode.id)
            .cloned()
            .collect();
        if items.is_empty() {
            return Ok(false);
        }

        let driver = self.lifecycle.driver();
        let capabilities = driver.capabilities();
        if capabilities.history {
            let now = Utc::now();
            let lookback = chrono::Duration::milliseconds(mode.interval_ms as i64);
            for partition in partitions(&items, self.config.history.max_instant_per_item) {
                let cursor = self.cursors.get(&partition.key)?;
                let start = cursor.max_instant.unwrap_or(now - lookback);
                self.read_partition(&partition, start, now).await?;
            }
        } else {
            if capabilities.last_point {
                driver.last_point_query(&items).await?;
            }
            if capabilities.file {
                driver.file_query(&items).await?;
            }
        }
        Ok(true)
    }

    /// Read `[start, end)` for `items`, resuming each partition from its
    /// cursor and skipping exhausted ones. A partition is marked exhausted
    /// once its whole range was read.
    ///
    /// Returns early (without error) when [`Self::stop`] is called.
    pub async fn run_history(
        &self,
        items: &[ItemConfig],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let _run = self.run_lock.lock().await;
        if !self.lifecycle.driver().capabilities().history {
            return Err(GatewayError::CapabilityMismatch {
                connector: self.config.id.clone(),
                capability: "history queries".into(),
            });
        }

        for partition in partitions(items, self.config.history.max_instant_per_item) {
            let cursor = self.cursors.get(&partition.key)?;
            if cursor.exhausted {
                trace!("South {}: partition {} already read", self.config.id, partition.key);
                continue;
            }
            let from = cursor.max_instant.map_or(start, |instant| instant.max(start));
            if !self.read_partition(&partition, from, end).await? {
                return Ok(());
            }
            self.cursors.mark_exhausted(&partition.key)?;
            info!(
                "South {}: partition {} read up to {}",
                self.config.id, partition.key, end
            );
        }
        Ok(())
    }

    /// Returns `false` if interrupted by a stop.
    async fn read_partition(
        &self,
        partition: &Partition,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool> {
        let history = &self.config.history;
        let intervals = generate_intervals(start, end, history.max_read_interval());
        let last = intervals.len().saturating_sub(1);

        for (i, interval) in intervals.iter().enumerate() {
            if self.stopping.load(Ordering::SeqCst) {
                debug!(
                    "South {}: read of {} interrupted at {}",
                    self.config.id, partition.key, interval.start
                );
                return Ok(false);
            }
            trace!(
                "South {}: reading {} in [{}, {})",
                self.config.id,
                partition.key,
                interval.start,
                interval.end
            );
            let latest = self
                .lifecycle
                .driver()
                .history_query(&partition.items, interval.start, interval.end)
                .await?;
            if let Some(instant) = latest {
                self.cursors.advance(&partition.key, instant)?;
            }
            if i < last && !history.read_delay().is_zero() {
                tokio::time::sleep(history.read_delay()).await;
            }
        }
        Ok(true)
    }

    /// Whether every partition of `items` has read its whole range.
    pub fn history_exhausted(&self, items: &[ItemConfig]) -> Result<bool> {
        for partition in partitions(items, self.config.history.max_instant_per_item) {
            if !self.cursors.get(&partition.key)?.exhausted {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cursor of every partition of `items`.
    pub fn history_progress(&self, items: &[ItemConfig]) -> Result<Vec<PartitionCursor>> {
        partitions(items, self.config.history.max_instant_per_item)
            .iter()
            .map(|p| self.cursors.get(&p.key))
            .collect()
    }

    /// Hand a read failure to the lifecycle, which cycles the session for
    /// transport errors and disables the connector for configuration ones.
    pub async fn report_failure(&self, err: GatewayError) {
        if err.is_configuration() {
            error!("South {}: {}", self.config.id, err);
        } else {
            warn!("South {}: read failed: {}", self.config.id, err);
        }
        self.lifecycle.on_failure(err).await;
    }
}

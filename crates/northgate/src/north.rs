// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! North connector.
//!
//! Owns everything between the South output and one North driver:
//!
//! ```text
//!  cache_values / cache_file
//!          │
//!          v
//!  ValueCache + FileCache ──> DeliveryScheduler ──> NorthDriver
//!          │                         │
//!          └──── ArchiveService <────┘ (ack / overflow)
//! ```
//!
//! Content is refused (and counted as discarded) when the driver does not
//! accept its content type or when the cache reached `max_size_mb`.

use crate::archive::{ArchiveRecord, ArchiveService};
use crate::cache::{CacheDb, CacheQueue, FileCache, ValueCache};
use crate::config::NorthConfig;
use crate::delivery::DeliveryScheduler;
use crate::driver::{ContentSink, DriverRegistry, NorthContext, NorthDriver};
use crate::error::Result;
use crate::lifecycle::{ConnectionState, ConnectorLifecycle, FailureNotifier};
use crate::model::{CacheEntry, ConnectorInfo, ConnectorKind, ContentType, Outcome, Payload, TimeValue};
use crate::status::{ConnectorStats, ConnectorStatsSnapshot, SharedStatusSink, StatusEvent};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a North driver.
pub type NorthLifecycle = ConnectorLifecycle<dyn NorthDriver>;

struct Runner {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// A North driver with its caches, archive and delivery scheduler.
pub struct NorthConnector {
    config: NorthConfig,
    folder: PathBuf,
    content_types: Vec<ContentType>,
    lifecycle: Arc<NorthLifecycle>,
    values: Arc<ValueCache>,
    files: Arc<FileCache>,
    archive: Arc<ArchiveService>,
    scheduler: Arc<DeliveryScheduler>,
    stats: Arc<ConnectorStats>,
    status: SharedStatusSink,
    runner: Mutex<Option<Runner>>,
}

impl NorthConnector {
    /// Build the connector and open (or recover) its cache in `folder`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn create(
        config: NorthConfig,
        folder: impl Into<PathBuf>,
        registry: &DriverRegistry,
        status: SharedStatusSink,
    ) -> Result<Arc<Self>> {
        let folder = folder.into();
        let info = ConnectorInfo {
            id: config.id.clone(),
            name: config.name.clone(),
            type_name: config.type_name.clone(),
            kind: ConnectorKind::North,
        };
        let failures = FailureNotifier::default();
        let driver = registry.create_north(NorthContext {
            info: info.clone(),
            settings: config.settings.clone(),
            failures: failures.clone(),
        })?;
        let content_types = driver.supported_content_types();

        std::fs::create_dir_all(&folder)?;
        let db = Arc::new(CacheDb::open(&folder.join("cache.db"))?);
        let capacity = config.caching.capacity();
        let archive = Arc::new(ArchiveService::new(
            config.id.clone(),
            config.caching.archive.clone(),
            Arc::clone(&db),
            folder.join("archive"),
        ));
        let values = Arc::new(ValueCache::open(
            config.id.clone(),
            Arc::clone(&db),
            Arc::clone(&archive),
            capacity,
        )?);
        let files = Arc::new(FileCache::open(
            config.id.clone(),
            db,
            Arc::clone(&archive),
            folder.join("files"),
            capacity,
        )?);

        let stats = Arc::new(ConnectorStats::new(info.clone()));
        let lifecycle = ConnectorLifecycle::new(
            info,
            driver,
            config.retry_interval(),
            Arc::clone(&status),
            Arc::clone(&stats),
        );
        lifecycle.bind_failures(&failures);

        let scheduler = Arc::new(DeliveryScheduler::new(
            Arc::clone(&lifecycle),
            Arc::clone(&values) as Arc<dyn CacheQueue>,
            Arc::clone(&files) as Arc<dyn CacheQueue>,
            config.caching.clone(),
            Arc::clone(&stats),
            Arc::clone(&status),
        ));

        debug!(
            "North {}: cache opened in {} ({} value entries, {} files)",
            config.id,
            folder.display(),
            values.len(),
            files.len()
        );

        Ok(Arc::new(Self {
            config,
            folder,
            content_types,
            lifecycle,
            values,
            files,
            archive,
            scheduler,
            stats,
            status,
            runner: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn info(&self) -> &ConnectorInfo {
        self.lifecycle.info()
    }

    pub fn config(&self) -> &NorthConfig {
        &self.config
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Arc<NorthLifecycle> {
        &self.lifecycle
    }

    pub fn scheduler(&self) -> &Arc<DeliveryScheduler> {
        &self.scheduler
    }

    pub fn archive(&self) -> &Arc<ArchiveService> {
        &self.archive
    }

    pub fn is_running(&self) -> bool {
        self.runner.lock().is_some()
    }

    /// Whether this connector takes content coming from `south_id`.
    pub fn is_subscribed(&self, south_id: &str) -> bool {
        self.config.is_subscribed(south_id)
    }

    /// Connect and start the delivery scheduler.
    ///
    /// A transport failure is not fatal: the lifecycle keeps retrying and
    /// content keeps being cached meanwhile. Configuration failures are
    /// returned.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Err(err) = self.lifecycle.connect().await {
            if err.is_configuration() || !self.lifecycle.is_enabled() {
                return Err(err);
            }
            warn!("North {}: not connected yet: {}", self.config.id, err);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.scheduler).run(shutdown.clone()));
        *self.runner.lock() = Some(Runner { shutdown, handle });
        info!("North {} started", self.config.id);
        Ok(())
    }

    /// Stop the scheduler (letting an in-flight delivery finish) and
    /// disconnect. Safe to call more than once.
    pub async fn stop(&self) {
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            runner.shutdown.cancel();
            if let Err(err) = runner.handle.await {
                warn!("North {}: scheduler task ended abnormally: {}", self.config.id, err);
            }
        }
        if let Err(err) = self.lifecycle.disconnect().await {
            warn!("North {}: {}", self.config.id, err);
        }
        info!("North {} stopped", self.config.id);
    }

    fn accepts(&self, content_type: ContentType) -> bool {
        self.content_types.contains(&content_type)
    }

    fn cache_full(&self) -> bool {
        match self.config.caching.max_size_bytes() {
            Some(limit) => self.values.queued_bytes() + self.files.queued_bytes() >= limit,
            None => false,
        }
    }

    /// Queue values coming from `source_id`.
    pub fn cache_values(&self, source_id: &str, values: Vec<TimeValue>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        if !self.accepts(ContentType::TimeValues) {
            warn!(
                "North {}: {} value(s) from {} discarded, content type {} not supported",
                self.config.id,
                values.len(),
                source_id,
                ContentType::TimeValues
            );
            self.stats.record_discarded(values.len() as u64);
            return Ok(());
        }
        if self.cache_full() {
            warn!(
                "North {}: cache reached {} MB, {} value(s) from {} discarded",
                self.config.id,
                self.config.caching.max_size_mb,
                values.len(),
                source_id
            );
            self.stats.record_discarded(values.len() as u64);
            return Ok(());
        }

        let chunk = self.config.caching.max_send_count.max(1);
        for values in values.chunks(chunk) {
            self.values.add(source_id, values.to_vec())?;
        }
        self.publish_cache_size();
        if self.values.len() >= self.config.caching.group_count {
            self.scheduler.wake();
        }
        Ok(())
    }

    /// Queue a copy of the file at `path` coming from `source_id`.
    pub fn cache_file(&self, source_id: &str, path: &Path) -> Result<()> {
        if !self.accepts(ContentType::Any) {
            warn!(
                "North {}: file {} from {} discarded, content type {} not supported",
                self.config.id,
                path.display(),
                source_id,
                ContentType::Any
            );
            self.stats.record_discarded(1);
            return Ok(());
        }
        if self.cache_full() {
            warn!(
                "North {}: cache reached {} MB, file {} from {} discarded",
                self.config.id,
                self.config.caching.max_size_mb,
                path.display(),
                source_id
            );
            self.stats.record_discarded(1);
            return Ok(());
        }
        self.files.add(source_id, path)?;
        self.publish_cache_size();
        Ok(())
    }

    fn publish_cache_size(&self) {
        self.status.publish(StatusEvent::CacheSize {
            connector: self.config.id.clone(),
            values: self.values.len(),
            files: self.files.len(),
        });
    }

    /// No value entry and no file queued.
    pub fn is_cache_empty(&self) -> bool {
        self.values.is_empty() && self.files.is_empty()
    }

    /// Number of queued (value entries, files).
    pub fn cache_size(&self) -> (usize, usize) {
        (self.values.len(), self.files.len())
    }

    /// Queued files, oldest first.
    pub fn cached_files(&self) -> Result<Vec<CacheEntry>> {
        self.files.all()
    }

    /// Drop queued files without sending them.
    pub fn remove_cached_files(&self, ids: &[u64]) -> Result<usize> {
        let removed = self.files.discard(ids)?;
        self.stats.record_discarded(removed as u64);
        self.publish_cache_size();
        Ok(removed)
    }

    pub fn list_archive(&self, outcome: Option<Outcome>) -> Result<Vec<ArchiveRecord>> {
        self.archive.list(outcome)
    }

    /// Put archived entries back in the cache. Returns how many were
    /// re-queued.
    pub fn retry_archived(&self, ids: &[u64]) -> Result<usize> {
        let records = self.archive.take(ids)?;
        for record in &records {
            match &record.payload {
                Payload::Values(values) => {
                    self.values.add(&record.source_id, values.clone())?;
                }
                Payload::File(file) => {
                    self.files.restore(&record.source_id, file)?;
                }
            }
        }
        if !records.is_empty() {
            info!(
                "North {}: {} archived entr(ies) queued again",
                self.config.id,
                records.len()
            );
            self.publish_cache_size();
            self.scheduler.wake();
        }
        Ok(records.len())
    }

    /// Delete archived records and their files.
    pub fn remove_archived(&self, ids: &[u64]) -> Result<usize> {
        self.archive.remove(ids)
    }

    /// Purge archive records past their deadline.
    pub fn sweep_archive(&self) -> Result<usize> {
        self.archive.sweep()
    }

    pub fn stats(&self) -> ConnectorStatsSnapshot {
        self.stats.snapshot()
    }
}

impl ContentSink for NorthConnector {
    fn add_values(&self, source_id: &str, values: Vec<TimeValue>) -> Result<()> {
        self.cache_values(source_id, values)
    }

    fn add_file(&self, source_id: &str, path: &Path) -> Result<()> {
        self.cache_file(source_id, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachingConfig;
    use crate::drivers::memory::MemoryNorth;
    use crate::model::Content;
    use crate::status::LogStatusSink;
    use chrono::Utc;
    use std::time::Duration;

    fn config(caching: CachingConfig) -> NorthConfig {
        NorthConfig {
            id: "n1".into(),
            name: "North 1".into(),
            type_name: "memory".into(),
            enabled: true,
            retry_interval_ms: 20,
            subscriptions: vec!["s1".into()],
            settings: serde_json::Value::Null,
            caching,
        }
    }

    fn registry(driver: Arc<MemoryNorth>) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register_north("memory", move |_ctx| {
            Ok(Arc::clone(&driver) as Arc<dyn NorthDriver>)
        });
        registry
    }

    fn values(n: usize) -> Vec<TimeValue> {
        (0..n)
            .map(|i| TimeValue::new("p", Utc::now(), serde_json::json!(i)))
            .collect()
    }

    #[tokio::test]
    async fn test_values_chunked_by_max_send_count() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryNorth::new());
        let caching = CachingConfig::builder().group_count(100).max_send_count(4).build();
        let north = NorthConnector::create(
            config(caching),
            dir.path().join("north-n1"),
            &registry(driver),
            Arc::new(LogStatusSink),
        )
        .unwrap();

        north.cache_values("s1", values(10)).unwrap();
        assert_eq!(north.cache_size(), (3, 0));
        assert!(dir.path().join("north-n1").join("cache.db").exists());
    }

    #[tokio::test]
    async fn test_unsupported_content_type_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryNorth::with_content_types(vec![ContentType::TimeValues]));
        let north = NorthConnector::create(
            config(CachingConfig::default()),
            dir.path().join("north-n1"),
            &registry(driver),
            Arc::new(LogStatusSink),
        )
        .unwrap();

        let file = dir.path().join("report.csv");
        std::fs::write(&file, b"a,b").unwrap();
        north.cache_file("s1", &file).unwrap();
        assert!(north.is_cache_empty());
        assert_eq!(north.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_max_size_discards_new_content() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryNorth::new());
        let caching = CachingConfig::builder().max_size_mb(1).build();
        let north = NorthConnector::create(
            config(caching),
            dir.path().join("north-n1"),
            &registry(driver),
            Arc::new(LogStatusSink),
        )
        .unwrap();

        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 1024 * 1024]).unwrap();
        north.cache_file("s1", &big).unwrap();
        assert_eq!(north.cache_size(), (0, 1));

        north.cache_values("s1", values(1)).unwrap();
        assert_eq!(north.cache_size(), (0, 1));
        assert_eq!(north.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_group_count_wakes_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryNorth::new());
        let caching = CachingConfig::builder()
            .send_interval(Duration::from_secs(3600))
            .group_count(2)
            .max_send_count(10)
            .build();
        let north = NorthConnector::create(
            config(caching),
            dir.path().join("north-n1"),
            &registry(Arc::clone(&driver)),
            Arc::new(LogStatusSink),
        )
        .unwrap();
        north.start().await.unwrap();
        // Let the scheduler consume its immediate first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;

        north.cache_values("s1", values(1)).unwrap();
        north.cache_values("s1", values(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(driver.received().len(), 1);
        assert!(north.is_cache_empty());
        north.stop().await;
        assert!(!north.is_running());
    }

    #[tokio::test]
    async fn test_retry_archived_entries() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryNorth::new());
        let caching = CachingConfig::builder()
            .send_interval(Duration::from_secs(3600))
            .archive(1)
            .build();
        let north = NorthConnector::create(
            config(caching),
            dir.path().join("north-n1"),
            &registry(Arc::clone(&driver)),
            Arc::new(LogStatusSink),
        )
        .unwrap();
        north.lifecycle().connect().await.unwrap();

        north.cache_values("s1", values(3)).unwrap();
        north.scheduler().tick().await;
        let archived = north.list_archive(Some(Outcome::Delivered)).unwrap();
        assert_eq!(archived.len(), 1);

        let ids: Vec<u64> = archived.iter().map(|r| r.id).collect();
        assert_eq!(north.retry_archived(&ids).unwrap(), 1);
        assert!(north.list_archive(None).unwrap().is_empty());
        north.scheduler().tick().await;

        let received = driver.received();
        assert_eq!(received.len(), 2);
        assert!(matches!(&received[1], Content::TimeValues(v) if v.len() == 3));
        assert_eq!(north.remove_archived(&[archived[0].id]).unwrap(), 0);
    }
}

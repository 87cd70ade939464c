// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data-stream engine.
//!
//! Builds every enabled connector from the configuration, routes South
//! output to the subscribed Norths, sweeps archives and runs the history
//! query scheduler.

use crate::config::GatewayConfig;
use crate::driver::{ContentSink, DriverRegistry};
use crate::error::Result;
use crate::history::{HistoryQueryOrchestrator, HistoryQueryRepository, SqliteHistoryRepository};
use crate::model::TimeValue;
use crate::north::NorthConnector;
use crate::south::SouthConnector;
use crate::status::{ConnectorStatsSnapshot, SharedStatusSink};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fans South output out to the subscribed North caches.
#[derive(Default)]
pub struct NorthRouter {
    norths: RwLock<Vec<Arc<NorthConnector>>>,
}

impl NorthRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, north: Arc<NorthConnector>) {
        self.norths.write().push(north);
    }

    fn targets(&self, source_id: &str) -> Vec<Arc<NorthConnector>> {
        self.norths
            .read()
            .iter()
            .filter(|n| n.is_subscribed(source_id) && n.lifecycle().is_enabled())
            .cloned()
            .collect()
    }
}

impl ContentSink for NorthRouter {
    fn add_values(&self, source_id: &str, values: Vec<TimeValue>) -> Result<()> {
        let targets = self.targets(source_id);
        if targets.is_empty() {
            debug!("{} value(s) from {} not routed: no subscriber", values.len(), source_id);
        }
        // One North failing to cache does not keep the others from it.
        for north in targets {
            if let Err(err) = north.cache_values(source_id, values.clone()) {
                error!("North {}: cannot cache values from {}: {}", north.id(), source_id, err);
            }
        }
        Ok(())
    }

    fn add_file(&self, source_id: &str, path: &Path) -> Result<()> {
        for north in self.targets(source_id) {
            if let Err(err) = north.cache_file(source_id, path) {
                error!(
                    "North {}: cannot cache file {} from {}: {}",
                    north.id(),
                    path.display(),
                    source_id,
                    err
                );
            }
        }
        Ok(())
    }
}

/// The running gateway.
pub struct Engine {
    config: GatewayConfig,
    registry: DriverRegistry,
    status: SharedStatusSink,
    router: Arc<NorthRouter>,
    norths: Vec<Arc<NorthConnector>>,
    souths: Vec<Arc<SouthConnector>>,
    history: Arc<HistoryQueryOrchestrator>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Engine with its history queries stored in `<data>/history.db`.
    pub fn new(
        config: GatewayConfig,
        registry: DriverRegistry,
        status: SharedStatusSink,
    ) -> Result<Self> {
        let repository =
            SqliteHistoryRepository::open(&config.engine.data_folder.join("history.db"))?;
        Self::with_repository(config, registry, status, Arc::new(repository))
    }

    /// Engine using `repository` for history queries. Configured queries are
    /// seeded into it.
    pub fn with_repository(
        config: GatewayConfig,
        registry: DriverRegistry,
        status: SharedStatusSink,
        repository: Arc<dyn HistoryQueryRepository>,
    ) -> Result<Self> {
        repository.seed(&config.history_queries)?;
        let history = Arc::new(HistoryQueryOrchestrator::new(
            config.clone(),
            repository,
            registry.clone(),
            Arc::clone(&status),
        ));
        Ok(Self {
            config,
            registry,
            status,
            router: Arc::new(NorthRouter::new()),
            norths: Vec::new(),
            souths: Vec::new(),
            history,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn norths(&self) -> &[Arc<NorthConnector>] {
        &self.norths
    }

    pub fn souths(&self) -> &[Arc<SouthConnector>] {
        &self.souths
    }

    pub fn north(&self, id: &str) -> Option<&Arc<NorthConnector>> {
        self.norths.iter().find(|n| n.id() == id)
    }

    pub fn south(&self, id: &str) -> Option<&Arc<SouthConnector>> {
        self.souths.iter().find(|s| s.id() == id)
    }

    pub fn history(&self) -> &Arc<HistoryQueryOrchestrator> {
        &self.history
    }

    /// Start every enabled connector, then the archive sweep and the
    /// history scheduler.
    ///
    /// A connector that cannot be built or started is logged and left out;
    /// the others keep running.
    pub async fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.engine.data_folder)?;
        self.remove_orphan_caches();
        info!(
            "Engine {} starting: {} south(s), {} north(s), {} history quer(ies)",
            self.config.engine.name,
            self.config.souths.len(),
            self.config.norths.len(),
            self.config.history_queries.len()
        );

        for config in self.config.norths.iter().filter(|n| n.enabled) {
            let folder = self.config.engine.cache_folder("north", &config.id);
            let north = match NorthConnector::create(
                config.clone(),
                folder,
                &self.registry,
                Arc::clone(&self.status),
            ) {
                Ok(north) => north,
                Err(err) => {
                    error!("North {}: cannot be created: {}", config.id, err);
                    continue;
                }
            };
            if let Err(err) = north.start().await {
                error!("North {}: cannot be started: {}", config.id, err);
                continue;
            }
            self.router.add(Arc::clone(&north));
            self.norths.push(north);
        }

        for config in self.config.souths.iter().filter(|s| s.enabled) {
            let folder = self.config.engine.cache_folder("south", &config.id);
            let south = match SouthConnector::create(
                config.clone(),
                folder,
                &self.registry,
                Arc::clone(&self.router) as Arc<dyn ContentSink>,
                Arc::clone(&self.status),
            ) {
                Ok(south) => south,
                Err(err) => {
                    error!("South {}: cannot be created: {}", config.id, err);
                    continue;
                }
            };
            if let Err(err) = south.start(&self.config.scan_modes).await {
                error!("South {}: cannot be started: {}", config.id, err);
                continue;
            }
            self.souths.push(south);
        }

        self.tasks.push(self.spawn_archive_sweep());
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.history).run(self.shutdown.clone()),
        ));
        info!("Engine {} started", self.config.engine.name);
        Ok(())
    }

    fn spawn_archive_sweep(&self) -> JoinHandle<()> {
        let norths = self.norths.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.engine.archive_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for north in &norths {
                    if let Err(err) = north.sweep_archive() {
                        warn!("North {}: archive sweep failed: {}", north.id(), err);
                    }
                }
            }
        })
    }

    /// Stop Souths first so nothing new is cached, then the background
    /// tasks (and a running history query), then the Norths.
    pub async fn stop(&mut self) {
        info!("Engine {} stopping", self.config.engine.name);
        for south in self.souths.drain(..) {
            south.stop().await;
        }
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("Engine task ended abnormally: {}", err);
            }
        }
        for north in self.norths.drain(..) {
            north.stop().await;
        }
        info!("Engine {} stopped", self.config.engine.name);
    }

    /// Statistics of every running connector.
    pub fn stats(&self) -> Vec<ConnectorStatsSnapshot> {
        self.souths
            .iter()
            .map(|s| s.stats())
            .chain(self.norths.iter().map(|n| n.stats()))
            .collect()
    }

    /// Delete cache folders of connectors no longer in the configuration.
    fn remove_orphan_caches(&self) {
        let root = self.config.engine.data_folder.join("cache");
        let Ok(entries) = std::fs::read_dir(&root) else {
            return;
        };
        let known: HashSet<String> = self
            .config
            .norths
            .iter()
            .map(|n| format!("north-{}", n.id))
            .chain(self.config.souths.iter().map(|s| format!("south-{}", s.id)))
            .collect();

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_cache = name.starts_with("north-") || name.starts_with("south-");
            if !is_cache || known.contains(&name) || !entry.path().is_dir() {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => info!("Removed cache of deleted connector: {}", name),
                Err(err) => warn!("Cannot remove orphan cache {}: {}", name, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CachingConfig, NorthConfig};
    use crate::driver::NorthDriver;
    use crate::drivers::memory::MemoryNorth;
    use crate::history::MemoryHistoryRepository;
    use crate::status::LogStatusSink;
    use chrono::Utc;

    fn north(id: &str, subscriptions: Vec<&str>) -> NorthConfig {
        NorthConfig {
            id: id.into(),
            name: id.into(),
            type_name: "memory".into(),
            enabled: true,
            retry_interval_ms: 20,
            subscriptions: subscriptions.into_iter().map(String::from).collect(),
            settings: serde_json::json!({}),
            caching: CachingConfig::builder()
                .send_interval(std::time::Duration::from_secs(3600))
                .build(),
        }
    }

    fn engine(dir: &Path, norths: Vec<NorthConfig>) -> Engine {
        let mut registry = DriverRegistry::new();
        registry.register_north("memory", |_ctx| {
            Ok(Arc::new(MemoryNorth::new()) as Arc<dyn NorthDriver>)
        });
        let mut config = GatewayConfig::default();
        config.engine.data_folder = dir.to_path_buf();
        config.norths = norths;
        Engine::with_repository(
            config,
            registry,
            Arc::new(LogStatusSink),
            Arc::new(MemoryHistoryRepository::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_router_follows_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(
            dir.path(),
            vec![north("all", vec![]), north("only-s2", vec!["s2"])],
        );
        engine.start().await.unwrap();

        let value = TimeValue::new("p", Utc::now(), serde_json::json!(1));
        engine.router.add_values("s1", vec![value.clone()]).unwrap();
        engine.router.add_values("s2", vec![value]).unwrap();

        assert_eq!(engine.north("all").unwrap().cache_size(), (2, 0));
        assert_eq!(engine.north("only-s2").unwrap().cache_size(), (1, 0));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_orphan_caches_removed() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join("cache").join("north-gone");
        std::fs::create_dir_all(&orphan).unwrap();
        let kept = dir.path().join("cache").join("north-n1");
        std::fs::create_dir_all(&kept).unwrap();

        let mut engine = engine(dir.path(), vec![north("n1", vec![])]);
        engine.start().await.unwrap();
        assert!(!orphan.exists());
        assert!(kept.join("cache.db").exists());
        engine.stop().await;
    }
}

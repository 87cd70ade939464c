// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine-wide history query scheduler.

use super::{HistoryQuery, HistoryQueryJob, HistoryQueryRepository, HistoryStatus};
use crate::config::GatewayConfig;
use crate::driver::DriverRegistry;
use crate::error::{GatewayError, Result};
use crate::status::{SharedStatusSink, StatusEvent};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs history queries one at a time, by order.
///
/// Every `history_check_interval` a pass picks the next runnable query when
/// none is ongoing. While a query runs, its completion is polled every
/// `history_finish_interval`.
pub struct HistoryQueryOrchestrator {
    config: GatewayConfig,
    repository: Arc<dyn HistoryQueryRepository>,
    registry: DriverRegistry,
    status: SharedStatusSink,
    /// The single ongoing query.
    ongoing: tokio::sync::Mutex<Option<Arc<HistoryQueryJob>>>,
}

impl HistoryQueryOrchestrator {
    pub fn new(
        config: GatewayConfig,
        repository: Arc<dyn HistoryQueryRepository>,
        registry: DriverRegistry,
        status: SharedStatusSink,
    ) -> Self {
        Self {
            config,
            repository,
            registry,
            status,
            ongoing: tokio::sync::Mutex::new(None),
        }
    }

    pub fn repository(&self) -> &Arc<dyn HistoryQueryRepository> {
        &self.repository
    }

    /// Id of the ongoing query.
    pub async fn ongoing(&self) -> Option<String> {
        self.ongoing.lock().await.as_ref().map(|job| job.id().to_string())
    }

    /// Handle of the ongoing job.
    pub async fn ongoing_job(&self) -> Option<Arc<HistoryQueryJob>> {
        self.ongoing.lock().await.clone()
    }

    pub fn list(&self) -> Result<Vec<HistoryQuery>> {
        self.repository.list()
    }

    /// Schedule and poll until `shutdown`, then stop the ongoing query
    /// (which stays `running` and resumes on the next start).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut check = tokio::time::interval(self.config.engine.history_check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut finish = tokio::time::interval(self.config.engine.history_finish_interval());
        finish.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("History query scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = check.tick() => {
                    if let Err(err) = self.tick().await {
                        error!("History query scheduler: {}", err);
                    }
                }
                _ = finish.tick() => {
                    if let Err(err) = self.poll().await {
                        error!("History query completion check: {}", err);
                    }
                }
            }
        }

        self.stop().await;
        debug!("History query scheduler stopped");
    }

    /// One scheduling pass. Returns the id of the query started, if any.
    pub async fn tick(&self) -> Result<Option<String>> {
        let mut ongoing = self.ongoing.lock().await;
        if let Some(job) = ongoing.as_ref() {
            debug!("History query {} still running, pass skipped", job.id());
            return Ok(None);
        }
        let Some(query) = self.repository.next_runnable()? else {
            return Ok(None);
        };
        let id = query.id().to_string();

        match self.start_query(&query).await {
            Ok(job) => {
                if let Err(err) = self.repository.update_status(&id, HistoryStatus::Running) {
                    job.stop().await;
                    return Err(err);
                }
                self.publish(&id, HistoryStatus::Running.as_str());
                *ongoing = Some(job);
                Ok(Some(id))
            }
            Err(err) => {
                error!("History query {}: cannot start: {}; query disabled", id, err);
                self.repository.set_enabled(&id, false)?;
                self.publish(&id, "disabled");
                Ok(None)
            }
        }
    }

    async fn start_query(&self, query: &HistoryQuery) -> Result<Arc<HistoryQueryJob>> {
        let config = &query.config;
        let south = self
            .config
            .south(&config.south_id)
            .ok_or_else(|| GatewayError::invalid(format!("unknown south {}", config.south_id)))?;
        let north = self
            .config
            .north(&config.north_id)
            .ok_or_else(|| GatewayError::invalid(format!("unknown north {}", config.north_id)))?;

        let job = HistoryQueryJob::create(
            config.clone(),
            south,
            north,
            &self.config.engine.history_folder(&config.id),
            &self.registry,
            Arc::clone(&self.status),
            self.config.engine.history_finish_interval(),
        )?;
        if let Err(err) = job.start().await {
            job.stop().await;
            return Err(err);
        }
        Ok(job)
    }

    /// Completion check of the ongoing query. Returns `true` when it just
    /// finished.
    pub async fn poll(&self) -> Result<bool> {
        let mut ongoing = self.ongoing.lock().await;
        let Some(job) = ongoing.clone() else {
            return Ok(false);
        };

        if let Some(failure) = job.failure() {
            error!("History query {}: {}; query disabled", job.id(), failure);
            job.stop().await;
            *ongoing = None;
            self.repository.set_enabled(job.id(), false)?;
            self.publish(job.id(), "disabled");
            return Ok(false);
        }

        if !job.is_complete()? {
            return Ok(false);
        }

        self.repository
            .update_status(job.id(), HistoryStatus::Finished)?;
        job.stop().await;
        *ongoing = None;
        info!("History query {} finished", job.id());
        self.publish(job.id(), HistoryStatus::Finished.as_str());
        Ok(true)
    }

    /// Enable or disable a query. Disabling the ongoing query stops it.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.repository.set_enabled(id, enabled)?;
        if !enabled {
            let mut ongoing = self.ongoing.lock().await;
            if ongoing.as_ref().is_some_and(|job| job.id() == id) {
                if let Some(job) = ongoing.take() {
                    job.stop().await;
                }
                warn!("History query {} disabled while running", id);
            }
        }
        Ok(())
    }

    /// Stop the ongoing query, keeping its status.
    pub async fn stop(&self) {
        let job = self.ongoing.lock().await.take();
        if let Some(job) = job {
            info!("History query {} interrupted", job.id());
            job.stop().await;
        }
    }

    fn publish(&self, query: &str, status: &str) {
        self.status.publish(StatusEvent::HistoryQuery {
            query: query.to_string(),
            status: status.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CachingConfig, HistoryQueryConfig, HistorySettings, ItemConfig, NorthConfig, SouthConfig,
    };
    use crate::driver::{NorthDriver, SouthDriver};
    use crate::drivers::memory::{MemoryHistorian, MemoryNorth, MemorySouth};
    use crate::history::MemoryHistoryRepository;
    use crate::model::TimeValue;
    use crate::status::LogStatusSink;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        historian: Arc<MemoryHistorian>,
        north: Arc<MemoryNorth>,
        orchestrator: HistoryQueryOrchestrator,
    }

    fn fixture(queries: Vec<HistoryQueryConfig>, south_type: &str) -> Fixture {
        fixture_with(queries, south_type, Arc::new(MemoryHistoryRepository::new()))
    }

    fn fixture_with(
        queries: Vec<HistoryQueryConfig>,
        south_type: &str,
        repository: Arc<dyn HistoryQueryRepository>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let historian = MemoryHistorian::new();
        let north = Arc::new(MemoryNorth::new());

        let mut registry = DriverRegistry::new();
        {
            let historian = Arc::clone(&historian);
            registry.register_south("memory", move |ctx| {
                Ok(Arc::new(MemorySouth::new(ctx.emitter, Arc::clone(&historian)))
                    as Arc<dyn SouthDriver>)
            });
        }
        {
            let north = Arc::clone(&north);
            registry.register_north("memory", move |_ctx| {
                Ok(Arc::clone(&north) as Arc<dyn NorthDriver>)
            });
        }

        let mut config = GatewayConfig::default();
        config.engine.data_folder = dir.path().to_path_buf();
        config.souths.push(SouthConfig {
            id: "s1".into(),
            name: "South".into(),
            type_name: south_type.into(),
            enabled: true,
            retry_interval_ms: 20,
            settings: serde_json::json!({}),
            history: HistorySettings {
                max_read_interval_secs: 0,
                read_delay_ms: 0,
                max_instant_per_item: false,
            },
            items: vec![],
        });
        config.norths.push(NorthConfig {
            id: "n1".into(),
            name: "North".into(),
            type_name: "memory".into(),
            enabled: true,
            retry_interval_ms: 20,
            subscriptions: vec![],
            settings: serde_json::json!({}),
            caching: CachingConfig::builder()
                .send_interval(Duration::from_millis(20))
                .group_count(10)
                .build(),
        });

        repository.seed(&queries).unwrap();
        config.history_queries = queries;

        let orchestrator = HistoryQueryOrchestrator::new(
            config,
            repository,
            registry,
            Arc::new(LogStatusSink),
        );
        Fixture {
            _dir: dir,
            historian,
            north,
            orchestrator,
        }
    }

    fn query(id: &str, order: i64, items: Vec<ItemConfig>) -> HistoryQueryConfig {
        HistoryQueryConfig {
            id: id.into(),
            name: id.into(),
            order,
            enabled: true,
            south_id: "s1".into(),
            north_id: "n1".into(),
            start_time: at(0),
            end_time: at(1000),
            items,
            south_settings: serde_json::json!({}),
            north_settings: serde_json::json!({}),
            caching: None,
            history: None,
        }
    }

    fn item(id: &str, scan_mode: &str) -> ItemConfig {
        ItemConfig {
            id: id.into(),
            name: id.into(),
            enabled: true,
            scan_mode_id: scan_mode.into(),
            settings: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_runs_to_finished() {
        let f = fixture(vec![query("q1", 1, vec![item("a", "fast")])], "memory");
        f.historian
            .insert(vec![TimeValue::new("a", at(10), serde_json::json!(1))]);

        assert_eq!(f.orchestrator.tick().await.unwrap().as_deref(), Some("q1"));
        let mut finished = false;
        for _ in 0..50 {
            if f.orchestrator.poll().await.unwrap() {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(finished);
        assert_eq!(f.north.received_values().len(), 1);
        let status = f.orchestrator.repository().find("q1").unwrap().unwrap().status;
        assert_eq!(status, HistoryStatus::Finished);
        assert_eq!(f.orchestrator.ongoing().await, None);
    }

    #[tokio::test]
    async fn test_one_query_at_a_time() {
        let f = fixture(
            vec![
                query("q1", 1, vec![item("a", "fast")]),
                query("q2", 2, vec![item("b", "fast")]),
            ],
            "memory",
        );
        f.historian.hold("a");

        assert_eq!(f.orchestrator.tick().await.unwrap().as_deref(), Some("q1"));
        assert_eq!(f.orchestrator.tick().await.unwrap(), None);
        assert!(!f.orchestrator.poll().await.unwrap());
        assert_eq!(f.orchestrator.ongoing().await.as_deref(), Some("q1"));

        let q2 = f.orchestrator.repository().find("q2").unwrap().unwrap();
        assert_eq!(q2.status, HistoryStatus::Pending);

        f.historian.release_all();
        f.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_driver_disables_query() {
        let f = fixture(vec![query("q1", 1, vec![item("a", "fast")])], "opcua");

        assert_eq!(f.orchestrator.tick().await.unwrap(), None);
        let q1 = f.orchestrator.repository().find("q1").unwrap().unwrap();
        assert!(!q1.config.enabled);
        assert_eq!(q1.status, HistoryStatus::Pending);
        assert_eq!(f.orchestrator.ongoing().await, None);
        // Not retried.
        assert_eq!(f.orchestrator.tick().await.unwrap(), None);
    }

    /// Repository whose status writes fail.
    #[derive(Default)]
    struct StatusWriteFails {
        inner: MemoryHistoryRepository,
    }

    impl HistoryQueryRepository for StatusWriteFails {
        fn list(&self) -> Result<Vec<HistoryQuery>> {
            self.inner.list()
        }

        fn find(&self, id: &str) -> Result<Option<HistoryQuery>> {
            self.inner.find(id)
        }

        fn upsert(&self, config: &HistoryQueryConfig) -> Result<()> {
            self.inner.upsert(config)
        }

        fn update_status(&self, _id: &str, _status: HistoryStatus) -> Result<()> {
            Err(GatewayError::Cache("database is locked".into()))
        }

        fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
            self.inner.set_enabled(id, enabled)
        }
    }

    #[tokio::test]
    async fn test_status_write_failure_stops_started_job() {
        let f = fixture_with(
            vec![query("q1", 1, vec![item("a", "fast")])],
            "memory",
            Arc::new(StatusWriteFails::default()),
        );

        assert!(f.orchestrator.tick().await.is_err());
        assert_eq!(f.orchestrator.ongoing().await, None);
        assert!(!f.north.is_connected());

        // The next pass starts it again, never alongside a leftover job.
        assert!(f.orchestrator.tick().await.is_err());
        assert!(!f.north.is_connected());
    }
}

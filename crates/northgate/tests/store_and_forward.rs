// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::too_many_lines)] // Test scenarios
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Store-and-forward integration tests
//!
//! Drives North connectors, the history orchestrator and the engine through
//! the public API with in-memory drivers.

use chrono::{DateTime, Utc};
use northgate::config::{EngineConfig, HistorySettings, ScanModeConfig};
use northgate::drivers::memory::{MemoryHistorian, MemoryNorth, MemorySouth};
use northgate::history::MemoryHistoryRepository;
use northgate::status::LogStatusSink;
use northgate::{
    CachingConfig, ConnectionState, Content, DriverRegistry, Engine, GatewayConfig,
    HistoryQueryConfig, HistoryQueryOrchestrator, HistoryQueryRepository, HistoryStatus,
    ItemConfig, NorthConfig, NorthConnector, NorthDriver, SouthConfig, SouthDriver, TickOutcome,
    TimeValue,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn value(point: &str, n: i64) -> TimeValue {
    TimeValue::new(point, Utc::now(), serde_json::json!({ "value": n }))
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

fn north_config(caching: CachingConfig) -> NorthConfig {
    NorthConfig {
        id: "n1".into(),
        name: "North".into(),
        type_name: "memory".into(),
        enabled: true,
        retry_interval_ms: 50,
        subscriptions: vec![],
        settings: serde_json::json!({}),
        caching,
    }
}

fn registry(north: &Arc<MemoryNorth>, historian: &Arc<MemoryHistorian>) -> DriverRegistry {
    let mut registry = DriverRegistry::with_builtins();
    let north = Arc::clone(north);
    registry.register_north("memory", move |_ctx| {
        Ok(Arc::clone(&north) as Arc<dyn NorthDriver>)
    });
    let historian = Arc::clone(historian);
    registry.register_south("memory", move |ctx| {
        Ok(Arc::new(MemorySouth::new(ctx.emitter, Arc::clone(&historian))) as Arc<dyn SouthDriver>)
    });
    registry
}

fn open_north(dir: &Path, driver: &Arc<MemoryNorth>, caching: CachingConfig) -> Arc<NorthConnector> {
    NorthConnector::create(
        north_config(caching),
        dir.join("cache").join("north-n1"),
        &registry(driver, &MemoryHistorian::new()),
        Arc::new(LogStatusSink),
    )
    .unwrap()
}

fn batch_sizes(received: &[Content]) -> Vec<usize> {
    received
        .iter()
        .map(|c| match c {
            Content::TimeValues(values) => values.len(),
            Content::File(_) => 1,
        })
        .collect()
}

#[tokio::test]
async fn test_five_entries_in_groups_of_two() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MemoryNorth::new());
    let caching = CachingConfig::builder()
        .send_interval(Duration::from_secs(3600))
        .group_count(2)
        .max_send_count(10)
        .build();
    let north = open_north(dir.path(), &driver, caching);
    north.lifecycle().connect().await.unwrap();

    for n in 0..5 {
        north.cache_values("s1", vec![value("p", n)]).unwrap();
    }
    assert_eq!(
        north.scheduler().tick().await,
        TickOutcome::Delivered { entries: 5 }
    );
    assert_eq!(batch_sizes(&driver.received()), vec![2, 2, 1]);
    assert!(north.is_cache_empty());
}

#[tokio::test]
async fn test_failed_batch_is_retried_identically() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MemoryNorth::new());
    let caching = CachingConfig::builder()
        .send_interval(Duration::from_millis(20))
        .group_count(10)
        .build();
    let north = open_north(dir.path(), &driver, caching);
    driver.fail_next(1);
    north.cache_values("s1", vec![value("p", 1), value("p", 2)]).unwrap();
    north.start().await.unwrap();

    let mut delivered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if north.is_cache_empty() {
            delivered = true;
            break;
        }
    }
    assert!(delivered);

    let attempts = driver.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], attempts[1]);
    assert_eq!(driver.received_values().len(), 2);
    assert_eq!(north.stats().errors, 1);
    north.stop().await;
}

#[tokio::test]
async fn test_zero_retention_purges_on_next_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MemoryNorth::new());
    let caching = CachingConfig::builder()
        .send_interval(Duration::from_secs(3600))
        .group_count(1)
        .archive(0)
        .build();
    let north = open_north(dir.path(), &driver, caching);
    north.lifecycle().connect().await.unwrap();

    let file = dir.path().join("report.csv");
    std::fs::write(&file, b"a;b").unwrap();
    north.cache_file("s1", &file).unwrap();
    for n in 0..3 {
        north.cache_values("s1", vec![value("p", n)]).unwrap();
    }
    north.scheduler().tick().await;
    assert_eq!(north.archive().count().unwrap(), 4);

    assert_eq!(north.sweep_archive().unwrap(), 4);
    assert_eq!(north.archive().count().unwrap(), 0);
    let archived_files = std::fs::read_dir(north.archive().folder()).unwrap().count();
    assert_eq!(archived_files, 0);
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MemoryNorth::new());
    let caching = || {
        CachingConfig::builder()
            .send_interval(Duration::from_secs(3600))
            .group_count(10)
            .build()
    };
    {
        let north = open_north(dir.path(), &driver, caching());
        north.cache_values("s1", vec![value("p", 1)]).unwrap();
        north.cache_values("s1", vec![value("p", 2)]).unwrap();
    }

    let north = open_north(dir.path(), &driver, caching());
    assert_eq!(north.cache_size(), (2, 0));
    north.lifecycle().connect().await.unwrap();
    north.scheduler().tick().await;

    let values = driver.received_values();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].data, serde_json::json!({ "value": 1 }));
    assert_eq!(values[1].data, serde_json::json!({ "value": 2 }));
}

#[tokio::test]
async fn test_double_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MemoryNorth::new());
    let north = open_north(dir.path(), &driver, CachingConfig::default());
    north.start().await.unwrap();
    assert_eq!(north.state(), ConnectionState::Connected);

    north.stop().await;
    north.stop().await;
    assert_eq!(north.state(), ConnectionState::Disconnected);
    assert!(!driver.is_connected());
    assert!(!north.lifecycle().retry_pending());
}

struct HistoryFixture {
    _dir: tempfile::TempDir,
    historian: Arc<MemoryHistorian>,
    north: Arc<MemoryNorth>,
    orchestrator: HistoryQueryOrchestrator,
}

fn history_fixture(queries: Vec<HistoryQueryConfig>) -> HistoryFixture {
    let dir = tempfile::tempdir().unwrap();
    let historian = MemoryHistorian::new();
    let north = Arc::new(MemoryNorth::new());

    let config = GatewayConfig {
        engine: EngineConfig {
            data_folder: dir.path().to_path_buf(),
            ..EngineConfig::default()
        },
        scan_modes: vec![],
        souths: vec![SouthConfig {
            id: "historian".into(),
            name: "Historian".into(),
            type_name: "memory".into(),
            enabled: true,
            retry_interval_ms: 50,
            settings: serde_json::json!({}),
            history: HistorySettings {
                max_read_interval_secs: 100,
                read_delay_ms: 0,
                max_instant_per_item: false,
            },
            items: vec![],
        }],
        norths: vec![north_config(
            CachingConfig::builder()
                .send_interval(Duration::from_millis(20))
                .build(),
        )],
        history_queries: queries.clone(),
    };

    let repository = Arc::new(MemoryHistoryRepository::new());
    repository.seed(&queries).unwrap();
    let orchestrator = HistoryQueryOrchestrator::new(
        config,
        repository,
        registry(&north, &historian),
        Arc::new(LogStatusSink),
    );
    HistoryFixture {
        _dir: dir,
        historian,
        north,
        orchestrator,
    }
}

fn history_query(id: &str, order: i64, items: Vec<ItemConfig>) -> HistoryQueryConfig {
    HistoryQueryConfig {
        id: id.into(),
        name: id.into(),
        order,
        enabled: true,
        south_id: "historian".into(),
        north_id: "n1".into(),
        start_time: at(0),
        end_time: at(300),
        items,
        south_settings: serde_json::json!({}),
        north_settings: serde_json::json!({}),
        caching: None,
        history: None,
    }
}

async fn poll_until_finished(orchestrator: &HistoryQueryOrchestrator) -> bool {
    for _ in 0..100 {
        if orchestrator.poll().await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_query_stays_running_until_every_group_is_exhausted() {
    let f = history_fixture(vec![history_query(
        "backfill",
        1,
        vec![item("flow", "fast"), item("level", "slow")],
    )]);
    f.historian.insert(vec![
        TimeValue::new("flow", at(10), serde_json::json!(1.0)),
        TimeValue::new("flow", at(250), serde_json::json!(2.0)),
        TimeValue::new("level", at(20), serde_json::json!(3.0)),
    ]);
    f.historian.hold("level");

    assert_eq!(
        f.orchestrator.tick().await.unwrap().as_deref(),
        Some("backfill")
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!f.orchestrator.poll().await.unwrap());
    let job = f.orchestrator.ongoing_job().await.unwrap();
    let progress = job.progress().unwrap();
    assert_eq!(progress[0].partition, "fast");
    assert!(progress[0].exhausted);
    assert_eq!(progress[0].max_instant, Some(at(250)));
    assert!(!progress[1].exhausted);
    let status = f.orchestrator.repository().find("backfill").unwrap().unwrap().status;
    assert_eq!(status, HistoryStatus::Running);

    f.historian.release_all();
    assert!(poll_until_finished(&f.orchestrator).await);
    let status = f.orchestrator.repository().find("backfill").unwrap().unwrap().status;
    assert_eq!(status, HistoryStatus::Finished);
    assert_eq!(f.north.received_values().len(), 3);
}

#[tokio::test]
async fn test_history_queries_run_one_after_another() {
    let f = history_fixture(vec![
        history_query("second", 2, vec![item("level", "slow")]),
        history_query("first", 1, vec![item("flow", "fast")]),
    ]);
    f.historian
        .insert(vec![TimeValue::new("flow", at(10), serde_json::json!(1.0))]);
    f.historian.hold("flow");

    assert_eq!(f.orchestrator.tick().await.unwrap().as_deref(), Some("first"));
    assert_eq!(f.orchestrator.tick().await.unwrap(), None);
    assert_eq!(f.orchestrator.ongoing().await.as_deref(), Some("first"));

    f.historian.release_all();
    assert!(poll_until_finished(&f.orchestrator).await);
    assert_eq!(f.orchestrator.tick().await.unwrap().as_deref(), Some("second"));
    assert!(poll_until_finished(&f.orchestrator).await);

    let statuses: Vec<HistoryStatus> = f
        .orchestrator
        .list()
        .unwrap()
        .iter()
        .map(|q| q.status)
        .collect();
    assert_eq!(statuses, vec![HistoryStatus::Finished, HistoryStatus::Finished]);
}

#[tokio::test]
async fn test_interrupted_query_resumes_from_cursor() {
    let f = history_fixture(vec![history_query(
        "backfill",
        1,
        vec![item("flow", "fast")],
    )]);
    f.historian.insert(vec![
        TimeValue::new("flow", at(10), serde_json::json!(1.0)),
        TimeValue::new("flow", at(150), serde_json::json!(2.0)),
    ]);

    assert!(f.orchestrator.tick().await.unwrap().is_some());
    f.historian.hold("flow");
    // Interrupt the query around its first read.
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.historian.release_all();
    f.orchestrator.stop().await;
    let status = f.orchestrator.repository().find("backfill").unwrap().unwrap().status;
    assert_eq!(status, HistoryStatus::Running);

    assert_eq!(
        f.orchestrator.tick().await.unwrap().as_deref(),
        Some("backfill")
    );
    assert!(poll_until_finished(&f.orchestrator).await);
    let mut instants: Vec<DateTime<Utc>> = f
        .north
        .received_values()
        .iter()
        .map(|v| v.timestamp)
        .collect();
    instants.dedup();
    assert_eq!(instants, vec![at(10), at(150)]);
}

#[tokio::test]
async fn test_engine_moves_simulated_values_to_folder() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("output");
    let config = GatewayConfig {
        engine: EngineConfig {
            data_folder: dir.path().join("data"),
            ..EngineConfig::default()
        },
        scan_modes: vec![ScanModeConfig {
            id: "fast".into(),
            name: "Fast".into(),
            interval_ms: 50,
        }],
        souths: vec![SouthConfig {
            id: "sim".into(),
            name: "Simulated".into(),
            type_name: "simulated".into(),
            enabled: true,
            retry_interval_ms: 50,
            settings: serde_json::json!({ "points_per_minute": 6000 }),
            history: HistorySettings::default(),
            items: vec![item("temperature", "fast")],
        }],
        norths: vec![NorthConfig {
            id: "files".into(),
            name: "Files".into(),
            type_name: "folder".into(),
            enabled: true,
            retry_interval_ms: 50,
            subscriptions: vec!["sim".into()],
            settings: serde_json::json!({ "output_folder": output.to_string_lossy() }),
            caching: CachingConfig::builder()
                .send_interval(Duration::from_millis(50))
                .build(),
        }],
        history_queries: vec![],
    };
    config.validate().unwrap();

    let mut engine = Engine::with_repository(
        config,
        DriverRegistry::with_builtins(),
        Arc::new(LogStatusSink),
        Arc::new(MemoryHistoryRepository::new()),
    )
    .unwrap();
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.stop().await;

    let written = std::fs::read_dir(&output).unwrap().count();
    assert!(written > 0);
    assert!(dir.path().join("data/cache/north-files/cache.db").exists());
    assert!(dir.path().join("data/cache/south-sim/cache.db").exists());
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Northgate store-and-forward gateway core
//!
//! Moves time-series values and files from South (source) connectors to
//! North (destination) connectors, surviving network outages and restarts.
//!
//! # Features
//!
//! - **Connector Lifecycle**: connect / disconnect / failure handling with
//!   unbounded fixed-interval reconnects
//! - **Durable Caches**: per-North SQLite value queue and file queue with
//!   overflow expiry and a size limit
//! - **Archive**: delivered and expired entries kept for a retention period
//! - **Delivery Scheduler**: grouped, bounded, single-in-flight delivery
//! - **History Queries**: resumable backfills, one at a time
//!
//! # Architecture
//!
//! ```text
//!  SouthConnector ──> NorthRouter ──> NorthConnector
//!   (scan loops,       (subscriptions)   ├── ValueCache / FileCache
//!    cursors)                            ├── DeliveryScheduler ──> NorthDriver
//!                                        └── ArchiveService
//!
//!  HistoryQueryOrchestrator ──> HistoryQueryJob (own South + North pair)
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! northgate gen-config --output gateway.toml
//! northgate validate --config gateway.toml
//! northgate run --config gateway.toml
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [engine]
//! data_folder = "./data"
//!
//! [[scan_modes]]
//! id = "every-10s"
//! interval_ms = 10000
//!
//! [[souths]]
//! id = "plant-sim"
//! type = "simulated"
//!
//! [[souths.items]]
//! id = "temperature"
//! scan_mode_id = "every-10s"
//!
//! [[norths]]
//! id = "console"
//! type = "console"
//! ```

pub mod archive;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod driver;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod model;
pub mod north;
pub mod south;
pub mod status;
pub mod timer;

pub use archive::{ArchiveRecord, ArchiveService};
pub use cache::{CacheQueue, FileCache, ValueCache};
pub use config::{
    CachingConfig, GatewayConfig, HistoryQueryConfig, ItemConfig, NorthConfig, SouthConfig,
};
pub use delivery::{DeliveryScheduler, DeliveryState, TickOutcome};
pub use driver::{
    Connectable, ContentSink, DriverRegistry, Emitter, NorthDriver, SouthCapabilities,
    SouthDriver,
};
pub use engine::{Engine, NorthRouter};
pub use error::{ErrorClass, GatewayError, Result};
pub use history::{
    HistoryQuery, HistoryQueryOrchestrator, HistoryQueryRepository, HistoryStatus,
    SqliteHistoryRepository,
};
pub use lifecycle::{ConnectionState, ConnectorLifecycle, FailureNotifier};
pub use model::{CacheEntry, Content, ContentType, FileRef, Outcome, Payload, TimeValue};
pub use north::{NorthConnector, NorthLifecycle};
pub use south::{SouthConnector, SouthLifecycle};
pub use status::{ConnectorStats, ConnectorStatsSnapshot, StatusEvent, StatusSink};
pub use timer::RetryTimer;

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Driver interfaces and the driver registry.
//!
//! Protocol implementations live outside the core. A driver only knows how
//! to open a session and move data; caching, retries and scheduling are
//! handled by the connector wrapping it.
//!
//! ```text
//!  SouthDriver ──emit──> Emitter ──> ContentSink ──> North caches
//!                                                          │
//!  NorthDriver <──handle_content── DeliveryScheduler <─────┘
//! ```

use crate::config::ItemConfig;
use crate::error::{GatewayError, Result};
use crate::lifecycle::FailureNotifier;
use crate::model::{ConnectorInfo, Content, ContentType, TimeValue};
use crate::status::ConnectorStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Session management shared by South and North drivers.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Open the protocol session.
    async fn connect(&self) -> Result<()>;

    /// Release the protocol session. Must be safe to call when no session
    /// is open.
    async fn disconnect(&self) -> Result<()>;
}

/// What a South driver is able to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SouthCapabilities {
    pub history: bool,
    pub last_point: bool,
    pub file: bool,
}

/// Source-side protocol driver.
#[async_trait]
pub trait SouthDriver: Connectable {
    fn capabilities(&self) -> SouthCapabilities;

    /// Read `[start, end)` for `items`, emitting data through the driver's
    /// [`Emitter`]. Returns the latest instant retrieved, `None` when the
    /// interval held no data.
    async fn history_query(
        &self,
        _items: &[ItemConfig],
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Err(GatewayError::CapabilityMismatch {
            connector: "south driver".into(),
            capability: "history queries".into(),
        })
    }

    /// Read the current value of `items`.
    async fn last_point_query(&self, _items: &[ItemConfig]) -> Result<()> {
        Ok(())
    }

    /// Collect files matching `items`.
    async fn file_query(&self, _items: &[ItemConfig]) -> Result<()> {
        Ok(())
    }
}

/// Destination-side protocol driver.
#[async_trait]
pub trait NorthDriver: Connectable {
    /// Content types this driver accepts.
    fn supported_content_types(&self) -> Vec<ContentType>;

    /// Send one batch. An error leaves the batch queued.
    async fn handle_content(&self, content: &Content) -> Result<()>;

    /// Check that the target is reachable without keeping a session.
    async fn test_connection(&self) -> Result<()> {
        self.connect().await?;
        self.disconnect().await
    }
}

/// Receiver of South output. Implemented by the engine router and by the
/// history query pipe.
pub trait ContentSink: Send + Sync {
    fn add_values(&self, source_id: &str, values: Vec<TimeValue>) -> Result<()>;

    fn add_file(&self, source_id: &str, path: &Path) -> Result<()>;
}

/// Handle given to a South driver to publish what it reads.
#[derive(Clone)]
pub struct Emitter {
    source_id: String,
    sink: Arc<dyn ContentSink>,
    stats: Arc<ConnectorStats>,
}

impl Emitter {
    pub fn new(
        source_id: impl Into<String>,
        sink: Arc<dyn ContentSink>,
        stats: Arc<ConnectorStats>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            sink,
            stats,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn add_values(&self, values: Vec<TimeValue>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.stats.record_values(values.len() as u64);
        self.sink.add_values(&self.source_id, values)
    }

    pub fn add_file(&self, path: &Path) -> Result<()> {
        self.stats.record_file();
        self.sink.add_file(&self.source_id, path)
    }
}

/// Everything a South factory receives.
pub struct SouthContext {
    pub info: ConnectorInfo,
    pub settings: Value,
    pub emitter: Emitter,
    pub failures: FailureNotifier,
}

/// Everything a North factory receives.
pub struct NorthContext {
    pub info: ConnectorInfo,
    pub settings: Value,
    pub failures: FailureNotifier,
}

pub type SouthFactory = Arc<dyn Fn(SouthContext) -> Result<Arc<dyn SouthDriver>> + Send + Sync>;
pub type NorthFactory = Arc<dyn Fn(NorthContext) -> Result<Arc<dyn NorthDriver>> + Send + Sync>;

/// Maps a connector type string to a driver factory.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    souths: HashMap<String, SouthFactory>,
    norths: HashMap<String, NorthFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in drivers (`simulated`, `console`, `folder`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::drivers::register_builtins(&mut registry);
        registry
    }

    pub fn register_south<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(SouthContext) -> Result<Arc<dyn SouthDriver>> + Send + Sync + 'static,
    {
        self.souths.insert(type_name.into(), Arc::new(factory));
    }

    pub fn register_north<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(NorthContext) -> Result<Arc<dyn NorthDriver>> + Send + Sync + 'static,
    {
        self.norths.insert(type_name.into(), Arc::new(factory));
    }

    pub fn create_south(&self, ctx: SouthContext) -> Result<Arc<dyn SouthDriver>> {
        let factory = self.souths.get(&ctx.info.type_name).ok_or_else(|| {
            GatewayError::DriverNotFound {
                kind: "south",
                type_name: ctx.info.type_name.clone(),
            }
        })?;
        factory(ctx)
    }

    pub fn create_north(&self, ctx: NorthContext) -> Result<Arc<dyn NorthDriver>> {
        let factory = self.norths.get(&ctx.info.type_name).ok_or_else(|| {
            GatewayError::DriverNotFound {
                kind: "north",
                type_name: ctx.info.type_name.clone(),
            }
        })?;
        factory(ctx)
    }

    /// Registered South types, sorted.
    pub fn south_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.souths.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Registered North types, sorted.
    pub fn north_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.norths.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

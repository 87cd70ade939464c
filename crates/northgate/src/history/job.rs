// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One running history query: a dedicated South/North pair and its reader.

use crate::config::{merge_settings, HistoryQueryConfig, NorthConfig, SouthConfig};
use crate::driver::{ContentSink, DriverRegistry};
use crate::error::{GatewayError, Result};
use crate::north::NorthConnector;
use crate::south::{PartitionCursor, SouthConnector};
use crate::status::SharedStatusSink;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connectors and reader task of a running history query.
///
/// The South writes straight into the North cache; no subscription routing
/// is involved.
pub struct HistoryQueryJob {
    query: HistoryQueryConfig,
    south: Arc<SouthConnector>,
    north: Arc<NorthConnector>,
    /// Delay before a failed read is retried.
    retry_delay: Duration,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Set when the reader hit an error that will not go away by retrying.
    failure: Mutex<Option<String>>,
}

impl HistoryQueryJob {
    /// Build the connector pair in `folder`, merging the query overrides
    /// over the base connector settings.
    pub fn create(
        query: HistoryQueryConfig,
        south_base: &SouthConfig,
        north_base: &NorthConfig,
        folder: &Path,
        registry: &DriverRegistry,
        status: SharedStatusSink,
        retry_delay: Duration,
    ) -> Result<Arc<Self>> {
        let north_config = NorthConfig {
            enabled: true,
            subscriptions: Vec::new(),
            settings: merge_settings(&north_base.settings, &query.north_settings),
            caching: query
                .caching
                .clone()
                .unwrap_or_else(|| north_base.caching.clone()),
            ..north_base.clone()
        };
        let north = NorthConnector::create(
            north_config,
            folder.join(format!("north-{}", north_base.id)),
            registry,
            Arc::clone(&status),
        )?;

        let south_config = SouthConfig {
            enabled: true,
            settings: merge_settings(&south_base.settings, &query.south_settings),
            history: query
                .history
                .clone()
                .unwrap_or_else(|| south_base.history.clone()),
            items: query.items.clone(),
            ..south_base.clone()
        };
        let south = SouthConnector::create(
            south_config,
            folder.join(format!("south-{}", south_base.id)),
            registry,
            Arc::clone(&north) as Arc<dyn ContentSink>,
            status,
        )?;

        Ok(Arc::new(Self {
            query,
            south,
            north,
            retry_delay,
            shutdown: CancellationToken::new(),
            reader: Mutex::new(None),
            failure: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.query.id
    }

    pub fn south(&self) -> &Arc<SouthConnector> {
        &self.south
    }

    pub fn north(&self) -> &Arc<NorthConnector> {
        &self.north
    }

    /// Connect both connectors and start reading.
    ///
    /// Any connection error is returned, leaving the caller to
    /// [`Self::stop`] the job.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.south.lifecycle().driver().capabilities().history {
            return Err(GatewayError::CapabilityMismatch {
                connector: self.south.id().to_string(),
                capability: "history queries".into(),
            });
        }
        self.north.lifecycle().connect().await?;
        self.south.lifecycle().connect().await?;
        self.north.start().await?;

        let job = Arc::clone(self);
        *self.reader.lock() = Some(tokio::spawn(async move { job.read().await }));
        info!(
            "History query {}: reading [{}, {}) from {} into {}",
            self.query.id,
            self.query.start_time,
            self.query.end_time,
            self.south.id(),
            self.north.id()
        );
        Ok(())
    }

    async fn read(&self) {
        let items = &self.query.items;
        loop {
            let lifecycle = self.south.lifecycle();
            if lifecycle.is_connected() {
                let result = self
                    .south
                    .run_history(items, self.query.start_time, self.query.end_time)
                    .await;
                match result {
                    Ok(()) => {
                        debug!("History query {}: reader done", self.query.id);
                        return;
                    }
                    Err(err) if err.is_configuration() => {
                        error!("History query {}: {}", self.query.id, err);
                        *self.failure.lock() = Some(err.to_string());
                        return;
                    }
                    Err(err) => self.south.report_failure(err).await,
                }
            } else if !lifecycle.is_enabled() {
                *self.failure.lock() = Some(format!("South {} disabled", self.south.id()));
                return;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Error that stopped the reader for good, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Every partition read its range and the North cache drained.
    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.south.history_exhausted(&self.query.items)? && self.north.is_cache_empty())
    }

    pub fn progress(&self) -> Result<Vec<PartitionCursor>> {
        self.south.history_progress(&self.query.items)
    }

    /// Stop reading and disconnect both connectors. An in-flight delivery
    /// is allowed to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.south.stop().await;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(err) = reader.await {
                warn!("History query {}: reader ended abnormally: {}", self.query.id, err);
            }
        }
        self.north.stop().await;
        debug!("History query {}: connectors stopped", self.query.id);
    }
}

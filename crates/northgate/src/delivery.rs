// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery scheduler.
//!
//! Drains a North connector's caches towards its driver:
//!
//! ```text
//!            tick / wake (connected)
//!   Idle ───────────────────────────> Sending ──ok──> Idle
//!    ^                                   │
//!    │        next tick once             │ handle_content failed
//!    └──────── reconnected ─────── Retrying <┘
//! ```
//!
//! Each tick sends groups of at most `group_count` entries and keeps going
//! until `max_send_count` entries were delivered or the caches are empty.
//! A failed group stays at the head of its queue and is retried as-is once
//! the connector lifecycle has cycled the session.

use crate::cache::CacheQueue;
use crate::config::CachingConfig;
use crate::error::{GatewayError, Result};
use crate::model::{CacheEntry, Content, Payload};
use crate::north::NorthLifecycle;
use crate::status::{ConnectorStats, SharedStatusSink, StatusEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Sending,
    Retrying,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Connector not connected, nothing attempted.
    NotConnected,
    /// Another tick is still sending.
    Busy,
    /// `entries` entries delivered (possibly zero).
    Delivered { entries: usize },
    /// A delivery failed after `entries` entries were delivered.
    Failed { entries: usize },
}

/// Drains the value and file caches of one North connector.
pub struct DeliveryScheduler {
    lifecycle: Arc<NorthLifecycle>,
    values: Arc<dyn CacheQueue>,
    files: Arc<dyn CacheQueue>,
    settings: CachingConfig,
    state: Mutex<DeliveryState>,
    wake: Notify,
    stats: Arc<ConnectorStats>,
    status: SharedStatusSink,
}

impl DeliveryScheduler {
    pub fn new(
        lifecycle: Arc<NorthLifecycle>,
        values: Arc<dyn CacheQueue>,
        files: Arc<dyn CacheQueue>,
        settings: CachingConfig,
        stats: Arc<ConnectorStats>,
        status: SharedStatusSink,
    ) -> Self {
        Self {
            lifecycle,
            values,
            files,
            settings,
            state: Mutex::new(DeliveryState::Idle),
            wake: Notify::new(),
            stats,
            status,
        }
    }

    pub fn state(&self) -> DeliveryState {
        *self.state.lock()
    }

    /// Trigger a tick without waiting for the send interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Tick on `send_interval` (or on [`Self::wake`]) until `shutdown` is
    /// cancelled. A tick in progress is allowed to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.send_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let owner = self.lifecycle.info().id.clone();
        debug!("{}: delivery scheduler started", owner);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.tick().await;
        }

        debug!("{}: delivery scheduler stopped", owner);
    }

    /// Run one delivery pass.
    pub async fn tick(&self) -> TickOutcome {
        if !self.lifecycle.is_connected() {
            return TickOutcome::NotConnected;
        }
        {
            let mut state = self.state.lock();
            if *state == DeliveryState::Sending {
                return TickOutcome::Busy;
            }
            *state = DeliveryState::Sending;
        }

        let outcome = self.drain().await;

        *self.state.lock() = match outcome {
            TickOutcome::Failed { .. } => DeliveryState::Retrying,
            _ => DeliveryState::Idle,
        };
        self.status.publish(StatusEvent::CacheSize {
            connector: self.lifecycle.info().id.clone(),
            values: self.values.len(),
            files: self.files.len(),
        });
        outcome
    }

    async fn drain(&self) -> TickOutcome {
        let owner = &self.lifecycle.info().id;
        let budget = self.settings.max_send_count;
        let mut sent = 0;

        while sent < budget {
            let room = (budget - sent).min(self.settings.group_count);
            let batch = match self.values.peek_batch(room) {
                Ok(batch) => batch,
                Err(err) => {
                    error!("{}: cannot read value cache: {}", owner, err);
                    return TickOutcome::Failed { entries: sent };
                }
            };
            if !batch.is_empty() {
                match self.deliver(self.values.as_ref(), &batch, values_content(&batch)).await {
                    Ok(()) => {
                        sent += batch.len();
                        continue;
                    }
                    Err(()) => return TickOutcome::Failed { entries: sent },
                }
            }

            // Files go out one per call.
            let batch = match self.files.peek_batch(1) {
                Ok(batch) => batch,
                Err(err) => {
                    error!("{}: cannot read file cache: {}", owner, err);
                    return TickOutcome::Failed { entries: sent };
                }
            };
            let Some(Payload::File(file)) = batch.first().map(|e| e.payload.clone()) else {
                break;
            };
            match self.deliver(self.files.as_ref(), &batch, Content::File(file)).await {
                Ok(()) => sent += 1,
                Err(()) => return TickOutcome::Failed { entries: sent },
            }
        }

        if sent > 0 {
            debug!("{}: delivered {} cache entries", owner, sent);
        }
        TickOutcome::Delivered { entries: sent }
    }

    /// Send `content` built from `batch`; ack on success, release and
    /// report to the lifecycle on failure.
    async fn deliver(
        &self,
        queue: &dyn CacheQueue,
        batch: &[CacheEntry],
        content: Content,
    ) -> std::result::Result<(), ()> {
        let owner = &self.lifecycle.info().id;
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        trace!("{}: sending entries {:?}", owner, ids);

        match self.lifecycle.driver().handle_content(&content).await {
            Ok(()) => {
                if let Err(err) = self.ack(queue, &ids) {
                    // Delivered but still queued: it will be sent again.
                    error!("{}: cannot ack entries {:?}: {}", owner, ids, err);
                    queue.release(&ids);
                    return Err(());
                }
                match &content {
                    Content::TimeValues(values) => self.stats.record_values(values.len() as u64),
                    Content::File(_) => self.stats.record_file(),
                }
                Ok(())
            }
            Err(err) => {
                queue.release(&ids);
                warn!("{}: delivery of entries {:?} failed: {}", owner, ids, err);
                self.lifecycle.on_failure(err).await;
                Err(())
            }
        }
    }

    fn ack(&self, queue: &dyn CacheQueue, ids: &[u64]) -> Result<()> {
        let acked = queue.ack(ids)?;
        if acked != ids.len() {
            return Err(GatewayError::Cache(format!(
                "acked {} of {} entries",
                acked,
                ids.len()
            )));
        }
        Ok(())
    }
}

fn values_content(batch: &[CacheEntry]) -> Content {
    let values = batch
        .iter()
        .filter_map(|entry| match &entry.payload {
            Payload::Values(values) => Some(values.iter().cloned()),
            Payload::File(_) => None,
        })
        .flatten()
        .collect();
    Content::TimeValues(values)
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory drivers for embedding and tests.
//!
//! [`MemoryNorth`] records what it receives and can be told to fail.
//! [`MemorySouth`] reads from a shared [`MemoryHistorian`] acting as the
//! remote system.

use crate::config::ItemConfig;
use crate::driver::{Connectable, Emitter, NorthDriver, SouthCapabilities, SouthDriver};
use crate::error::{GatewayError, Result};
use crate::model::{Content, ContentType, TimeValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// North driver keeping every batch in memory.
pub struct MemoryNorth {
    content_types: Vec<ContentType>,
    attempts: Mutex<Vec<Content>>,
    received: Mutex<Vec<Content>>,
    fail_next: AtomicUsize,
    fail_connect: AtomicUsize,
    delay: Mutex<Duration>,
    connected: AtomicBool,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl Default for MemoryNorth {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNorth {
    /// Accepts values and files.
    pub fn new() -> Self {
        Self::with_content_types(vec![ContentType::TimeValues, ContentType::Any])
    }

    pub fn with_content_types(content_types: Vec<ContentType>) -> Self {
        Self {
            content_types,
            attempts: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            fail_connect: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            connected: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Reject the next `n` deliveries with a delivery error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` connection attempts with a transport error.
    pub fn fail_connect(&self, n: usize) {
        self.fail_connect.store(n, Ordering::SeqCst);
    }

    /// Simulated network latency of each delivery.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every delivery attempt, failed ones included.
    pub fn attempts(&self) -> Vec<Content> {
        self.attempts.lock().clone()
    }

    /// Successfully delivered batches.
    pub fn received(&self) -> Vec<Content> {
        self.received.lock().clone()
    }

    /// Values delivered, in delivery order.
    pub fn received_values(&self) -> Vec<TimeValue> {
        self.received
            .lock()
            .iter()
            .filter_map(|c| match c {
                Content::TimeValues(values) => Some(values.clone()),
                Content::File(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Number of delivery attempts.
    pub fn calls(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Highest number of deliveries observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connectable for MemoryNorth {
    async fn connect(&self) -> Result<()> {
        if take_one(&self.fail_connect) {
            return Err(GatewayError::Transport("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl NorthDriver for MemoryNorth {
    fn supported_content_types(&self) -> Vec<ContentType> {
        self.content_types.clone()
    }

    async fn handle_content(&self, content: &Content) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);
        self.attempts.lock().push(content.clone());

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if take_one(&self.fail_next) {
            return Err(GatewayError::Delivery("target rejected the batch".into()));
        }
        self.received.lock().push(content.clone());
        Ok(())
    }
}

/// Remote historian served by [`MemorySouth`].
#[derive(Default)]
pub struct MemoryHistorian {
    points: Mutex<BTreeMap<String, Vec<TimeValue>>>,
    held: Mutex<HashSet<String>>,
    release: Notify,
    queries: AtomicUsize,
}

impl MemoryHistorian {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store readings of a point.
    pub fn insert(&self, values: Vec<TimeValue>) {
        let mut points = self.points.lock();
        for value in values {
            points.entry(value.point_id.clone()).or_default().push(value);
        }
        for series in points.values_mut() {
            series.sort_by_key(|v| v.timestamp);
        }
    }

    /// Make queries touching `item_id` wait until [`Self::release_all`].
    pub fn hold(&self, item_id: impl Into<String>) {
        self.held.lock().insert(item_id.into());
    }

    pub fn release_all(&self) {
        self.held.lock().clear();
        self.release.notify_waiters();
    }

    /// Number of history queries served.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn is_held(&self, items: &[ItemConfig]) -> bool {
        let held = self.held.lock();
        items.iter().any(|i| held.contains(&i.id))
    }

    fn read(
        &self,
        items: &[ItemConfig],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<TimeValue> {
        let points = self.points.lock();
        let mut values: Vec<TimeValue> = items
            .iter()
            .filter_map(|item| points.get(&item.id))
            .flatten()
            .filter(|v| v.timestamp >= start && v.timestamp < end)
            .cloned()
            .collect();
        values.sort_by_key(|v| v.timestamp);
        values
    }

    fn latest(&self, items: &[ItemConfig]) -> Vec<TimeValue> {
        let points = self.points.lock();
        items
            .iter()
            .filter_map(|item| points.get(&item.id).and_then(|s| s.last()).cloned())
            .collect()
    }
}

/// South driver reading a [`MemoryHistorian`].
pub struct MemorySouth {
    emitter: Emitter,
    historian: Arc<MemoryHistorian>,
}

impl MemorySouth {
    pub fn new(emitter: Emitter, historian: Arc<MemoryHistorian>) -> Self {
        Self { emitter, historian }
    }
}

#[async_trait]
impl Connectable for MemorySouth {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SouthDriver for MemorySouth {
    fn capabilities(&self) -> SouthCapabilities {
        SouthCapabilities {
            history: true,
            last_point: true,
            file: false,
        }
    }

    async fn history_query(
        &self,
        items: &[ItemConfig],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        loop {
            // Register interest before checking, so a release in between is
            // not missed.
            let released = self.historian.release.notified();
            if !self.historian.is_held(items) {
                break;
            }
            released.await;
        }
        self.historian.queries.fetch_add(1, Ordering::SeqCst);
        let values = self.historian.read(items, start, end);
        let latest = values.iter().map(|v| v.timestamp).max();
        self.emitter.add_values(values)?;
        Ok(latest)
    }

    async fn last_point_query(&self, items: &[ItemConfig]) -> Result<()> {
        self.emitter.add_values(self.historian.latest(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_north_failures() {
        let north = MemoryNorth::new();
        north.fail_connect(1);
        assert!(north.connect().await.is_err());
        north.connect().await.unwrap();
        assert!(north.is_connected());

        north.fail_next(1);
        let content = Content::TimeValues(Vec::new());
        assert!(north.handle_content(&content).await.is_err());
        north.handle_content(&content).await.unwrap();
        assert_eq!(north.calls(), 2);
        assert_eq!(north.received().len(), 1);
    }

    #[test]
    fn test_historian_range_is_half_open() {
        let historian = MemoryHistorian::new();
        let t0 = DateTime::from_timestamp(1_000, 0).unwrap();
        let t1 = DateTime::from_timestamp(2_000, 0).unwrap();
        historian.insert(vec![
            TimeValue::new("a", t0, serde_json::json!(1)),
            TimeValue::new("a", t1, serde_json::json!(2)),
        ]);
        let item = ItemConfig {
            id: "a".into(),
            name: String::new(),
            enabled: true,
            scan_mode_id: "m".into(),
            settings: serde_json::Value::Null,
        };
        let values = historian.read(std::slice::from_ref(&item), t0, t1);
        assert_eq!(values.len(), 1);
        assert_eq!(historian.latest(&[item])[0].timestamp, t1);
    }
}

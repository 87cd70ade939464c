// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `simulated` South: deterministic sine signals.
//!
//! Each item produces `amplitude * sin(t)` sampled `points_per_minute`
//! times per minute, so history reads are reproducible.

use crate::config::ItemConfig;
use crate::driver::{Connectable, Emitter, SouthCapabilities, SouthDriver};
use crate::error::{GatewayError, Result};
use crate::model::{ConnectorInfo, TimeValue};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimulatedSettings {
    amplitude: f64,
    points_per_minute: u32,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            points_per_minute: 6,
        }
    }
}

pub struct SimulatedSouth {
    info: ConnectorInfo,
    settings: SimulatedSettings,
    emitter: Emitter,
}

impl SimulatedSouth {
    pub fn new(info: ConnectorInfo, settings: &Value, emitter: Emitter) -> Result<Self> {
        let settings: SimulatedSettings = if settings.is_null() {
            SimulatedSettings::default()
        } else {
            serde_json::from_value(settings.clone())
                .map_err(|e| GatewayError::invalid(format!("{info}: {e}")))?
        };
        if settings.points_per_minute == 0 || settings.points_per_minute > 60_000 {
            return Err(GatewayError::invalid(format!(
                "{info}: points_per_minute must be within 1..=60000"
            )));
        }
        Ok(Self {
            info,
            settings,
            emitter,
        })
    }

    fn step(&self) -> Duration {
        Duration::milliseconds(60_000 / self.settings.points_per_minute as i64)
    }

    fn sample(&self, item: &ItemConfig, at: DateTime<Utc>) -> TimeValue {
        // Offset each item so signals differ.
        let phase = item.id.bytes().map(f64::from).sum::<f64>();
        let t = at.timestamp_millis() as f64 / 60_000.0 + phase;
        TimeValue::new(
            item.id.clone(),
            at,
            json!({ "value": self.settings.amplitude * t.sin(), "quality": "good" }),
        )
    }

    fn first_sample_at_or_after(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.step();
        match start.duration_trunc(step) {
            Ok(floor) if floor == start => floor,
            Ok(floor) => floor + step,
            Err(_) => start,
        }
    }
}

#[async_trait]
impl Connectable for SimulatedSouth {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SouthDriver for SimulatedSouth {
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
        let step = self.step();
        let mut values = Vec::new();
        let mut at = self.first_sample_at_or_after(start);
        while at < end {
            values.extend(items.iter().map(|item| self.sample(item, at)));
            at += step;
        }
        let latest = values.iter().map(|v| v.timestamp).max();
        trace!(
            "{}: {} simulated value(s) for [{}, {})",
            self.info,
            values.len(),
            start,
            end
        );
        self.emitter.add_values(values)?;
        Ok(latest)
    }

    async fn last_point_query(&self, items: &[ItemConfig]) -> Result<()> {
        let now = Utc::now();
        let values = items.iter().map(|item| self.sample(item, now)).collect();
        self.emitter.add_values(values)
    }
}

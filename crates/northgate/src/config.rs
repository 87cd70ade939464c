// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration.
//!
//! Supports both programmatic and file-based configuration. Connector
//! settings are read-only for the runtime; only history query status and
//! the `enabled` flag are written back (see [`crate::history`]).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Engine-wide settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Scan modes shared by South items.
    #[serde(default)]
    pub scan_modes: Vec<ScanModeConfig>,

    /// South (source) connectors.
    #[serde(default)]
    pub souths: Vec<SouthConfig>,

    /// North (destination) connectors.
    #[serde(default)]
    pub norths: Vec<NorthConfig>,

    /// Bounded backfill jobs.
    #[serde(default)]
    pub history_queries: Vec<HistoryQueryConfig>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Gateway name (for identification).
    #[serde(default = "default_engine_name")]
    pub name: String,

    /// Root folder for caches, archives and the history query database.
    #[serde(default = "default_data_folder")]
    pub data_folder: PathBuf,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Archive sweep interval (seconds).
    #[serde(default = "default_sweep_interval")]
    pub archive_sweep_interval_secs: u64,

    /// Interval between two history scheduler passes (seconds).
    #[serde(default = "default_history_check_interval")]
    pub history_check_interval_secs: u64,

    /// Completion poll interval of a running history query (seconds).
    #[serde(default = "default_history_finish_interval")]
    pub history_finish_interval_secs: u64,
}

fn default_engine_name() -> String {
    "northgate".to_string()
}

fn default_data_folder() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_history_check_interval() -> u64 {
    10
}

fn default_history_finish_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_retry_interval() -> u64 {
    10_000
}

fn default_settings() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            data_folder: default_data_folder(),
            log_level: default_log_level(),
            archive_sweep_interval_secs: default_sweep_interval(),
            history_check_interval_secs: default_history_check_interval(),
            history_finish_interval_secs: default_history_finish_interval(),
        }
    }
}

impl EngineConfig {
    pub fn archive_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.archive_sweep_interval_secs.max(1))
    }

    pub fn history_check_interval(&self) -> Duration {
        Duration::from_secs(self.history_check_interval_secs.max(1))
    }

    pub fn history_finish_interval(&self) -> Duration {
        Duration::from_secs(self.history_finish_interval_secs.max(1))
    }

    /// Cache folder of a live connector, e.g. `<data>/cache/north-<id>`.
    pub fn cache_folder(&self, kind: &str, id: &str) -> PathBuf {
        self.data_folder.join("cache").join(format!("{kind}-{id}"))
    }

    /// Root folder of a history query.
    pub fn history_folder(&self, query_id: &str) -> PathBuf {
        self.data_folder.join("history-query").join(query_id)
    }
}

/// Fixed-interval scan mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanModeConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Scan period (milliseconds).
    pub interval_ms: u64,
}

impl ScanModeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// A point (or file pattern) read by a South connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scan mode driving this item. Items sharing a scan mode form one
    /// history partition.
    pub scan_mode_id: String,

    /// Protocol-specific item settings.
    #[serde(default = "default_settings")]
    pub settings: Value,
}

/// Historical read tuning of a South connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySettings {
    /// Largest sub-interval requested from the driver (seconds, 0 = no split).
    #[serde(default = "default_max_read_interval")]
    pub max_read_interval_secs: u64,

    /// Pause between two sub-intervals (milliseconds).
    #[serde(default = "default_read_delay")]
    pub read_delay_ms: u64,

    /// Keep one read cursor per item instead of one per scan mode.
    #[serde(default)]
    pub max_instant_per_item: bool,
}

fn default_max_read_interval() -> u64 {
    3600
}

fn default_read_delay() -> u64 {
    200
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_read_interval_secs: default_max_read_interval(),
            read_delay_ms: default_read_delay(),
            max_instant_per_item: false,
        }
    }
}

impl HistorySettings {
    pub fn max_read_interval(&self) -> Option<chrono::Duration> {
        match self.max_read_interval_secs {
            0 => None,
            secs => Some(chrono::Duration::seconds(secs as i64)),
        }
    }

    pub fn read_delay(&self) -> Duration {
        Duration::from_millis(self.read_delay_ms)
    }
}

/// South (source) connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SouthConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Driver type looked up in the driver registry.
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before a reconnect attempt (milliseconds).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Protocol-specific settings.
    #[serde(default = "default_settings")]
    pub settings: Value,

    #[serde(default)]
    pub history: HistorySettings,

    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl SouthConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// North (destination) connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NorthConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Driver type looked up in the driver registry.
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before a reconnect attempt (milliseconds).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// South ids this North accepts content from (empty = all).
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Protocol-specific settings.
    #[serde(default = "default_settings")]
    pub settings: Value,

    #[serde(default)]
    pub caching: CachingConfig,
}

impl NorthConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Whether content coming from `south_id` is routed to this North.
    pub fn is_subscribed(&self, south_id: &str) -> bool {
        self.subscriptions.is_empty() || self.subscriptions.iter().any(|s| s == south_id)
    }
}

/// Cache and delivery tuning of a North connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachingConfig {
    /// Delivery tick period (milliseconds).
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,

    /// Entries per delivery call.
    #[serde(default = "default_group_count")]
    pub group_count: usize,

    /// Entries drained per tick; also the value chunk size of one entry.
    #[serde(default = "default_max_send_count")]
    pub max_send_count: usize,

    /// Queue capacity is `max_send_count * overflow_factor` entries.
    #[serde(default = "default_overflow_factor")]
    pub overflow_factor: usize,

    /// On-disk cache size limit in MB (0 = unlimited).
    #[serde(default)]
    pub max_size_mb: u64,

    #[serde(default)]
    pub archive: ArchiveConfig,
}

fn default_send_interval() -> u64 {
    10_000
}

fn default_group_count() -> usize {
    100
}

fn default_max_send_count() -> usize {
    1000
}

fn default_overflow_factor() -> usize {
    10
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval(),
            group_count: default_group_count(),
            max_send_count: default_max_send_count(),
            overflow_factor: default_overflow_factor(),
            max_size_mb: 0,
            archive: ArchiveConfig::default(),
        }
    }
}

impl CachingConfig {
    /// Create a new caching config builder.
    pub fn builder() -> CachingConfigBuilder {
        CachingConfigBuilder::default()
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.max(1))
    }

    /// Maximum number of queued entries before the oldest expire.
    pub fn capacity(&self) -> usize {
        self.max_send_count.saturating_mul(self.overflow_factor.max(1))
    }

    /// Size limit in bytes, `None` when unlimited.
    pub fn max_size_bytes(&self) -> Option<u64> {
        match self.max_size_mb {
            0 => None,
            mb => Some(mb.saturating_mul(1024 * 1024)),
        }
    }

    fn validate(&self, owner: &str) -> Result<(), ConfigError> {
        if self.group_count == 0 {
            return Err(ConfigError::Invalid(format!(
                "{owner}: group_count must be > 0"
            )));
        }
        if self.max_send_count < self.group_count {
            return Err(ConfigError::Invalid(format!(
                "{owner}: max_send_count ({}) must be >= group_count ({})",
                self.max_send_count, self.group_count
            )));
        }
        if self.archive.retention_duration_hours > MAX_RETENTION_HOURS {
            return Err(ConfigError::Invalid(format!(
                "{owner}: retention_duration_hours ({}) must be <= {}",
                self.archive.retention_duration_hours, MAX_RETENTION_HOURS
            )));
        }
        Ok(())
    }
}

/// Caching config builder for fluent API.
#[derive(Debug, Default)]
pub struct CachingConfigBuilder {
    send_interval_ms: Option<u64>,
    group_count: Option<usize>,
    max_send_count: Option<usize>,
    overflow_factor: Option<usize>,
    max_size_mb: Option<u64>,
    archive: Option<ArchiveConfig>,
}

impl CachingConfigBuilder {
    /// Set the delivery tick period.
    pub fn send_interval(mut self, interval: Duration) -> Self {
        self.send_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Set the number of entries per delivery call.
    pub fn group_count(mut self, count: usize) -> Self {
        self.group_count = Some(count);
        self
    }

    /// Set the number of entries drained per tick.
    pub fn max_send_count(mut self, count: usize) -> Self {
        self.max_send_count = Some(count);
        self
    }

    pub fn overflow_factor(mut self, factor: usize) -> Self {
        self.overflow_factor = Some(factor);
        self
    }

    /// Set the on-disk size limit (0 = unlimited).
    pub fn max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_mb = Some(mb);
        self
    }

    /// Keep delivered entries for `retention` before the sweep purges them.
    pub fn archive(mut self, retention_hours: u64) -> Self {
        self.archive = Some(ArchiveConfig {
            enabled: true,
            retention_duration_hours: retention_hours,
        });
        self
    }

    /// Build the config.
    pub fn build(self) -> CachingConfig {
        let defaults = CachingConfig::default();
        CachingConfig {
            send_interval_ms: self.send_interval_ms.unwrap_or(defaults.send_interval_ms),
            group_count: self.group_count.unwrap_or(defaults.group_count),
            max_send_count: self.max_send_count.unwrap_or(defaults.max_send_count),
            overflow_factor: self.overflow_factor.unwrap_or(defaults.overflow_factor),
            max_size_mb: self.max_size_mb.unwrap_or(defaults.max_size_mb),
            archive: self.archive.unwrap_or(defaults.archive),
        }
    }
}

/// Archive settings of a North cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Keep delivered entries. When false, delivered entries are deleted.
    #[serde(default)]
    pub enabled: bool,

    /// Retention of archived entries (hours, 0 = purge on next sweep).
    #[serde(default = "default_retention")]
    pub retention_duration_hours: u64,
}

fn default_retention() -> u64 {
    72
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_duration_hours: default_retention(),
        }
    }
}

/// Longest accepted archive retention (100 years).
pub const MAX_RETENTION_HOURS: u64 = 100 * 365 * 24;

impl ArchiveConfig {
    /// Retention as a duration, `None` when out of range.
    pub fn retention(&self) -> Option<chrono::Duration> {
        i64::try_from(self.retention_duration_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
    }
}

/// Bounded South-to-North backfill job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQueryConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Execution order (lowest first).
    #[serde(default)]
    pub order: i64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// South connector providing type and base settings.
    pub south_id: String,

    /// North connector providing type and base settings.
    pub north_id: String,

    pub start_time: DateTime<Utc>,

    pub end_time: DateTime<Utc>,

    /// Items to backfill.
    #[serde(default)]
    pub items: Vec<ItemConfig>,

    /// Settings merged over the South connector settings.
    #[serde(default = "default_settings")]
    pub south_settings: Value,

    /// Settings merged over the North connector settings.
    #[serde(default = "default_settings")]
    pub north_settings: Value,

    /// Caching override for the history North.
    #[serde(default)]
    pub caching: Option<CachingConfig>,

    /// Read tuning override for the history South.
    #[serde(default)]
    pub history: Option<HistorySettings>,
}

/// Shallow merge of two JSON objects, `overrides` winning.
pub fn merge_settings(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overrides) => overrides.clone(),
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn south(&self, id: &str) -> Option<&SouthConfig> {
        self.souths.iter().find(|s| s.id == id)
    }

    pub fn north(&self, id: &str) -> Option<&NorthConfig> {
        self.norths.iter().find(|n| n.id == id)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scan_modes = unique_ids("scan mode", self.scan_modes.iter().map(|s| &s.id))?;
        let souths = unique_ids("south", self.souths.iter().map(|s| &s.id))?;
        unique_ids("north", self.norths.iter().map(|n| &n.id))?;
        unique_ids("history query", self.history_queries.iter().map(|h| &h.id))?;

        for south in &self.souths {
            if south.type_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "South {}: missing type",
                    south.id
                )));
            }
            unique_ids(
                &format!("item of south {}", south.id),
                south.items.iter().map(|i| &i.id),
            )?;
            for item in &south.items {
                if !scan_modes.contains(item.scan_mode_id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "South {}: item {} references unknown scan mode {}",
                        south.id, item.id, item.scan_mode_id
                    )));
                }
            }
        }

        for north in &self.norths {
            if north.type_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "North {}: missing type",
                    north.id
                )));
            }
            north.caching.validate(&format!("North {}", north.id))?;
            for sub in &north.subscriptions {
                if !souths.contains(sub.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "North {}: subscription to unknown south {}",
                        north.id, sub
                    )));
                }
            }
        }

        for query in &self.history_queries {
            if query.start_time >= query.end_time {
                return Err(ConfigError::Invalid(format!(
                    "History query {}: start_time must be before end_time",
                    query.id
                )));
            }
            if let Some(caching) = &query.caching {
                caching.validate(&format!("History query {}", query.id))?;
            }
            unique_ids(
                &format!("item of history query {}", query.id),
                query.items.iter().map(|i| &i.id),
            )?;
        }

        Ok(())
    }

    /// Example configuration used by `northgate gen-config`.
    pub fn example() -> Self {
        let mut sim_settings = serde_json::Map::new();
        sim_settings.insert("amplitude".into(), Value::from(10.0));
        sim_settings.insert("points_per_minute".into(), Value::from(6));

        let mut folder_settings = serde_json::Map::new();
        folder_settings.insert("output_folder".into(), Value::from("./output"));

        let items = vec![
            ItemConfig {
                id: "temperature".into(),
                name: "Boiler temperature".into(),
                enabled: true,
                scan_mode_id: "every-10s".into(),
                settings: default_settings(),
            },
            ItemConfig {
                id: "pressure".into(),
                name: "Boiler pressure".into(),
                enabled: true,
                scan_mode_id: "every-minute".into(),
                settings: default_settings(),
            },
        ];

        Self {
            engine: EngineConfig::default(),
            scan_modes: vec![
                ScanModeConfig {
                    id: "every-10s".into(),
                    name: "Every 10 seconds".into(),
                    interval_ms: 10_000,
                },
                ScanModeConfig {
                    id: "every-minute".into(),
                    name: "Every minute".into(),
                    interval_ms: 60_000,
                },
            ],
            souths: vec![SouthConfig {
                id: "plant-sim".into(),
                name: "Simulated plant".into(),
                type_name: "simulated".into(),
                enabled: true,
                retry_interval_ms: default_retry_interval(),
                settings: Value::Object(sim_settings),
                history: HistorySettings::default(),
                items: items.clone(),
            }],
            norths: vec![
                NorthConfig {
                    id: "console".into(),
                    name: "Console".into(),
                    type_name: "console".into(),
                    enabled: true,
                    retry_interval_ms: default_retry_interval(),
                    subscriptions: Vec::new(),
                    settings: default_settings(),
                    caching: CachingConfig::default(),
                },
                NorthConfig {
                    id: "archive-folder".into(),
                    name: "Output folder".into(),
                    type_name: "folder".into(),
                    enabled: true,
                    retry_interval_ms: default_retry_interval(),
                    subscriptions: vec!["plant-sim".into()],
                    settings: Value::Object(folder_settings),
                    caching: CachingConfig::builder().archive(24).build(),
                },
            ],
            history_queries: vec![HistoryQueryConfig {
                id: "backfill-2024".into(),
                name: "Backfill January 2024".into(),
                order: 1,
                enabled: false,
                south_id: "plant-sim".into(),
                north_id: "archive-folder".into(),
                start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                    .single()
                    .unwrap_or_default(),
                end_time: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0)
                    .single()
                    .unwrap_or_default(),
                items,
                south_settings: default_settings(),
                north_settings: default_settings(),
                caching: None,
                history: None,
            }],
        }
    }
}

fn unique_ids<'a>(
    what: &str,
    ids: impl Iterator<Item = &'a String>,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(ConfigError::Invalid(format!("Empty {what} id")));
        }
        if !seen.insert(id.as_str()) {
            return Err(ConfigError::Invalid(format!("Duplicate {what} id: {id}")));
        }
    }
    Ok(seen)
}

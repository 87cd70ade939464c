// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data carried between South and North connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One timestamped reading of a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValue {
    /// Point (item) identifier.
    pub point_id: String,

    /// Source timestamp.
    pub timestamp: DateTime<Utc>,

    /// Value and quality, protocol-defined.
    pub data: serde_json::Value,
}

impl TimeValue {
    pub fn new(
        point_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            point_id: point_id.into(),
            timestamp,
            data,
        }
    }
}

/// Content type a North connector can accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// Batches of [`TimeValue`].
    TimeValues,
    /// Opaque files.
    Any,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::TimeValues => write!(f, "time-values"),
            ContentType::Any => write!(f, "any"),
        }
    }
}

/// A file waiting in (or delivered from) a file cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    /// Current location of the file.
    pub path: PathBuf,

    /// Name as produced by the South connector.
    pub original_name: String,

    /// Size in bytes.
    pub size: u64,

    pub created_at: DateTime<Utc>,
}

/// Payload of a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Payload {
    Values(Vec<TimeValue>),
    File(FileRef),
}

impl Payload {
    pub fn content_type(&self) -> ContentType {
        match self {
            Payload::Values(_) => ContentType::TimeValues,
            Payload::File(_) => ContentType::Any,
        }
    }

    /// Number of values, or 1 for a file.
    pub fn weight(&self) -> usize {
        match self {
            Payload::Values(values) => values.len(),
            Payload::File(_) => 1,
        }
    }
}

/// Unit of work held by a North cache.
///
/// Entries are immutable once written and identified by a sequence id that
/// is monotonic within their queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// South connector that produced the content.
    pub source_id: String,
    pub payload: Payload,
}

/// Content handed to a North driver in one delivery call.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Values of one or more entries, concatenated in sequence order.
    TimeValues(Vec<TimeValue>),
    File(FileRef),
}

impl Content {
    pub fn content_type(&self) -> ContentType {
        match self {
            Content::TimeValues(_) => ContentType::TimeValues,
            Content::File(_) => ContentType::Any,
        }
    }
}

/// Why an entry left the active queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Delivered,
    Expired,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(Outcome::Delivered),
            "expired" => Some(Outcome::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a connector, carried in logs and status events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: String,
    pub name: String,
    pub type_name: String,
    pub kind: ConnectorKind,
}

impl fmt::Display for ConnectorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.id, self.type_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    South,
    North,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::South => "south",
            ConnectorKind::North => "north",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

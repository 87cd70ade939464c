// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Splitting of history ranges into bounded sub-intervals.

use chrono::{DateTime, Duration, Utc};

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Split `[start, end)` into consecutive intervals no longer than
/// `max_interval`. `None` (or a non-positive length) keeps a single interval.
pub fn generate_intervals(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_interval: Option<Duration>,
) -> Vec<Interval> {
    if start >= end {
        return Vec::new();
    }
    let step = match max_interval {
        Some(step) if step > Duration::zero() => step,
        _ => return vec![Interval { start, end }],
    };

    let mut intervals = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        intervals.push(Interval {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    intervals
}

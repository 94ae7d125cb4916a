//! Single-pass running statistics
//!
//! Count, mean, min and max over an unbounded stream in O(1) memory, used to
//! compress high-frequency observations into one statistics observation per
//! aggregation window.

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Closed aggregate as stored and transmitted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatisticsSummary {
    pub count: u64,
    pub mean: OrderedFloat<f64>,
    pub min: OrderedFloat<f64>,
    pub max: OrderedFloat<f64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Incremental aggregator (Welford update for the mean)
#[derive(Debug, Clone, Default)]
pub struct RunningStatistics {
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl RunningStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the aggregate.
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        if self.count == 1 {
            self.mean = x;
            self.min = x;
            self.max = x;
            return;
        }

        self.mean += (x - self.mean) / self.count as f64;
        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
    }

    /// Fold a timestamped sample, widening the window bounds.
    pub fn push_at(&mut self, x: f64, at: DateTime<Utc>) {
        self.push(x);
        self.start = Some(self.start.map_or(at, |s| s.min(at)));
        self.end = Some(self.end.map_or(at, |e| e.max(at)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Snapshot the aggregate. `None` until at least one sample was pushed.
    pub fn summary(&self) -> Option<StatisticsSummary> {
        if self.is_empty() {
            return None;
        }
        let now = Utc::now();
        Some(StatisticsSummary {
            count: self.count,
            mean: OrderedFloat(self.mean),
            min: OrderedFloat(self.min),
            max: OrderedFloat(self.max),
            start: self.start.unwrap_or(now),
            end: self.end.unwrap_or(now),
        })
    }
}

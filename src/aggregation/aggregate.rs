use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::AggregationKey;

/// Count, sum, min and max of observed durations in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    /// Records a single duration.
    pub fn record(&mut self, value_ms: u64) {
        if self.count == 0 {
            self.min_ms = value_ms;
            self.max_ms = value_ms;
        } else {
            self.min_ms = self.min_ms.min(value_ms);
            self.max_ms = self.max_ms.max(value_ms);
        }
        self.count = self.count.saturating_add(1);
        self.sum_ms = self.sum_ms.saturating_add(value_ms);
    }
}

/// One statistics update applied to an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationDelta<'a> {
    /// Subject counted toward the unique-subject total.
    pub subject: Option<&'a str>,
    pub duration_ms: Option<u64>,
}

impl<'a> AggregationDelta<'a> {
    pub fn count_only() -> Self {
        Self {
            subject: None,
            duration_ms: None,
        }
    }
}

/// Open accumulator for one bucket.
///
/// Closing consumes the accumulator and yields a [`ClosedAggregation`], so a
/// closed bucket can never be mutated again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    key: AggregationKey,
    bucket_end: DateTime<Utc>,
    count: u64,
    subjects: HashSet<String>,
    duration: DurationStats,
}

impl Aggregation {
    /// Creates a zero-valued accumulator.
    pub fn new(key: AggregationKey, bucket_end: DateTime<Utc>) -> Self {
        Self {
            key,
            bucket_end,
            count: 0,
            subjects: HashSet::new(),
            duration: DurationStats::default(),
        }
    }

    /// Rebuilds an accumulator from a persisted checkpoint.
    pub fn restore(
        key: AggregationKey,
        bucket_end: DateTime<Utc>,
        count: u64,
        subjects: HashSet<String>,
        duration: DurationStats,
    ) -> Self {
        Self {
            key,
            bucket_end,
            count,
            subjects,
            duration,
        }
    }

    /// Applies one statistics update.
    pub fn apply(&mut self, delta: &AggregationDelta<'_>) {
        self.count = self.count.saturating_add(1);
        if let Some(subject) = delta.subject {
            if !self.subjects.contains(subject) {
                self.subjects.insert(subject.to_string());
            }
        }
        if let Some(ms) = delta.duration_ms {
            self.duration.record(ms);
        }
    }

    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_end
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn unique_count(&self) -> u64 {
        self.subjects.len() as u64
    }

    pub fn subjects(&self) -> &HashSet<String> {
        &self.subjects
    }

    pub fn duration(&self) -> &DurationStats {
        &self.duration
    }

    /// Transitions to the immutable closed form.
    pub fn close(self, closed_at: DateTime<Utc>) -> ClosedAggregation {
        ClosedAggregation {
            unique_count: self.unique_count(),
            key: self.key,
            bucket_end: self.bucket_end,
            count: self.count,
            duration: self.duration,
            closed_at,
        }
    }
}

/// Immutable, persisted result of a completed bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedAggregation {
    pub key: AggregationKey,
    pub bucket_end: DateTime<Utc>,
    pub count: u64,
    pub unique_count: u64,
    pub duration: DurationStats,
    pub closed_at: DateTime<Utc>,
}

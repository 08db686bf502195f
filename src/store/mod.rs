//! Persistence contracts for raw events, aggregations and event sessions.
//!
//! The engine only talks to these traits. [`memory::MemoryStore`] backs tests
//! and single-node runs; [`sqlite::SqliteStore`] is the shared database of
//! record for a cluster and also implements the lock-store traits.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::aggregation::{
    Aggregation, AggregationInterval, AggregationKey, AggregationType, ClosedAggregation,
    DurationStats,
};
use crate::event::{EventSession, EventStatus, RawEvent};

/// Backend failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted row in {table}: {reason}")]
    Corrupted { table: &'static str, reason: String },

    /// Another writer committed since the expected checkpoint.
    #[error("checkpoint conflict: expected sequence {expected}, found {found}")]
    CheckpointConflict { expected: u64, found: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Commit marker written with every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Server identity of the committing node.
    pub owner: String,
    /// Incremented by one on every commit.
    pub sequence: u64,
    /// Closure watermark after the batch.
    pub closed_through: Option<DateTime<Utc>>,
}

/// Everything one engine batch persists. Applied atomically or not at all.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub closed: Vec<ClosedAggregation>,
    /// Snapshots of open accumulators touched by the batch.
    pub open: Vec<Aggregation>,
    pub aggregated_events: Vec<i64>,
    pub late_events: Vec<i64>,
    /// Events consumed without contributing to any bucket.
    pub unaggregatable_events: Vec<i64>,
    /// Latest access per session seen in the batch.
    pub sessions: Vec<EventSession>,
    /// Must be exactly one past the stored sequence.
    pub checkpoint: Checkpoint,
}

impl CommitBatch {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            closed: Vec::new(),
            open: Vec::new(),
            aggregated_events: Vec::new(),
            late_events: Vec::new(),
            unaggregatable_events: Vec::new(),
            sessions: Vec::new(),
            checkpoint,
        }
    }

    pub fn event_count(&self) -> usize {
        self.aggregated_events.len() + self.late_events.len() + self.unaggregatable_events.len()
    }
}

/// Persisted aggregation row, open or closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRecord {
    pub key: AggregationKey,
    pub bucket_end: DateTime<Utc>,
    pub count: u64,
    pub unique_count: u64,
    pub subjects: HashSet<String>,
    pub duration: DurationStats,
    pub closed_at: Option<DateTime<Utc>>,
}

impl AggregationRecord {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn from_open(agg: &Aggregation) -> Self {
        Self {
            key: agg.key().clone(),
            bucket_end: agg.bucket_end(),
            count: agg.count(),
            unique_count: agg.unique_count(),
            subjects: agg.subjects().clone(),
            duration: *agg.duration(),
            closed_at: None,
        }
    }

    pub fn from_closed(agg: &ClosedAggregation) -> Self {
        Self {
            key: agg.key.clone(),
            bucket_end: agg.bucket_end,
            count: agg.count,
            unique_count: agg.unique_count,
            subjects: HashSet::new(),
            duration: agg.duration,
            closed_at: Some(agg.closed_at),
        }
    }

    /// Rebuilds the open accumulator, or `None` for closed rows.
    pub fn into_open(self) -> Option<Aggregation> {
        if self.is_closed() {
            return None;
        }
        Some(Aggregation::restore(
            self.key,
            self.bucket_end,
            self.count,
            self.subjects,
            self.duration,
        ))
    }

    pub fn into_closed(self) -> Option<ClosedAggregation> {
        let closed_at = self.closed_at?;
        Some(ClosedAggregation {
            key: self.key,
            bucket_end: self.bucket_end,
            count: self.count,
            unique_count: self.unique_count,
            duration: self.duration,
            closed_at,
        })
    }
}

/// Selection over closed aggregations. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ClosedFilter {
    pub aggregation_type: Option<AggregationType>,
    pub interval: Option<AggregationInterval>,
}

impl ClosedFilter {
    pub fn matches(&self, key: &AggregationKey) -> bool {
        self.aggregation_type
            .map_or(true, |t| t == key.aggregation_type)
            && self.interval.map_or(true, |i| i == key.interval)
    }
}

/// Durable raw event log.
pub trait RawEventStore: Send + Sync {
    /// Appends events as pending and returns the assigned ids in input order.
    fn append(&self, events: &[RawEvent]) -> Result<Vec<i64>, StoreError>;

    /// Up to `limit` pending events ordered by `(occurred_at, id)`.
    fn read_pending(&self, limit: usize) -> Result<Vec<RawEvent>, StoreError>;

    fn event_status(&self, id: i64) -> Result<Option<EventStatus>, StoreError>;

    /// Deletes consumed events that occurred before `before`.
    fn purge_processed(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Aggregation results and the commit checkpoint.
pub trait AggregationStore: Send + Sync {
    /// Applies a batch atomically. Closed rows are never modified by later
    /// batches. Fails with [`StoreError::CheckpointConflict`] if the stored
    /// sequence is not `batch.checkpoint.sequence - 1`.
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError>;

    fn load_open(&self) -> Result<Vec<Aggregation>, StoreError>;

    /// Closed rows whose bucket ends after `after`; these were closed early.
    fn load_force_closed_after(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<(AggregationKey, DateTime<Utc>)>, StoreError>;

    fn get_aggregation(&self, key: &AggregationKey) -> Result<Option<AggregationRecord>, StoreError>;

    /// Closed rows ordered by key.
    fn list_closed(&self, filter: &ClosedFilter) -> Result<Vec<ClosedAggregation>, StoreError>;
}

/// Login sessions tracked alongside the event log.
pub trait EventSessionStore: Send + Sync {
    /// Creates the session or moves its last access forward.
    fn touch(&self, session: &EventSession) -> Result<(), StoreError>;

    fn get_session(&self, session_id: &str) -> Result<Option<EventSession>, StoreError>;

    /// Deletes sessions last accessed before `idle_before`.
    fn purge_expired(&self, idle_before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Verifies that `next` directly follows `stored`.
pub(crate) fn check_sequence(
    stored: Option<&Checkpoint>,
    next: &Checkpoint,
) -> Result<(), StoreError> {
    let found = stored.map_or(0, |c| c.sequence);
    let expected = next.sequence.saturating_sub(1);
    if next.sequence == 0 || found != expected {
        return Err(StoreError::CheckpointConflict { expected, found });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    use super::*;
    use crate::aggregation::{AggregationDelta, Discriminator, GroupMapping};

    fn key() -> AggregationKey {
        AggregationKey {
            aggregation_type: AggregationType::Login,
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            interval: AggregationInterval::Hour,
            group: GroupMapping::AllUsers,
            discriminator: Discriminator::None,
        }
    }

    fn checkpoint(sequence: u64) -> Checkpoint {
        Checkpoint {
            owner: "node-a".to_string(),
            sequence,
            closed_through: None,
        }
    }

    #[test]
    fn test_check_sequence() {
        assert!(check_sequence(None, &checkpoint(1)).is_ok());
        assert!(check_sequence(Some(&checkpoint(4)), &checkpoint(5)).is_ok());
        assert!(matches!(
            check_sequence(Some(&checkpoint(4)), &checkpoint(4)),
            Err(StoreError::CheckpointConflict {
                expected: 3,
                found: 4
            })
        ));
        assert!(check_sequence(None, &checkpoint(0)).is_err());
    }

    #[test]
    fn test_record_open_and_closed_forms() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut agg = Aggregation::new(key(), end);
        agg.apply(&AggregationDelta {
            subject: Some("alice"),
            duration_ms: None,
        });

        let open = AggregationRecord::from_open(&agg);
        assert!(!open.is_closed());
        assert!(open.clone().into_closed().is_none());
        let restored = open.into_open().expect("open record");
        assert_eq!(restored, agg);

        let closed = AggregationRecord::from_closed(&agg.close(end));
        assert!(closed.is_closed());
        assert!(closed.clone().into_open().is_none());
        assert_eq!(closed.into_closed().map(|c| c.count), Some(1));
    }

    #[test]
    fn test_closed_filter() {
        let all = ClosedFilter::default();
        assert!(all.matches(&key()));

        let days = ClosedFilter {
            interval: Some(AggregationInterval::Day),
            ..Default::default()
        };
        assert!(!days.matches(&key()));

        let logins = ClosedFilter {
            aggregation_type: Some(AggregationType::Login),
            interval: Some(AggregationInterval::Hour),
        };
        assert!(logins.matches(&key()));
    }
}

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dimension::Calendar;

use super::aggregate::{Aggregation, AggregationDelta, ClosedAggregation};
use super::key::AggregationKey;

/// An update addressed a bucket that has already closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bucket {key} already closed (ended {bucket_end})")]
pub struct LateEvent {
    pub key: AggregationKey,
    pub bucket_end: DateTime<Utc>,
    /// Raw event that carried the update, when known.
    pub event_id: Option<i64>,
}

impl LateEvent {
    pub fn with_event(mut self, event_id: i64) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

/// Errors raised by [`AggregationCache`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error(transparent)]
    Late(#[from] LateEvent),

    #[error("cannot compute bucket for {key}")]
    UnknownBucket { key: AggregationKey },
}

/// Working set of open accumulators, closed by interval completeness.
///
/// Buckets close when [`evict_closable`](Self::evict_closable) is called with
/// an instant at or after their end. The greatest such instant is kept as a
/// watermark: any later update for a bucket ending at or before it is a
/// [`LateEvent`], never a silent reopen.
///
/// `max_open` is a degraded-mode safety valve. When exceeded, the
/// earliest-ending buckets are closed early and remembered until the
/// watermark passes them.
///
/// Node-local and single-threaded: the engine owns it under the cluster lock.
pub struct AggregationCache {
    calendar: Arc<Calendar>,
    max_open: Option<usize>,
    open: HashMap<AggregationKey, Aggregation>,
    /// Eviction order: bucket end, then key.
    by_end: BTreeSet<(DateTime<Utc>, AggregationKey)>,
    /// Keys modified since the last flush.
    dirty: HashSet<AggregationKey>,
    closed_through: Option<DateTime<Utc>>,
    /// Buckets closed early by the memory cap, with their end.
    force_closed: HashMap<AggregationKey, DateTime<Utc>>,
    /// Force-closed accumulators not yet handed out for persistence.
    pending_forced: Vec<Aggregation>,
}

impl AggregationCache {
    pub fn new(calendar: Arc<Calendar>, max_open: Option<usize>) -> Self {
        Self {
            calendar,
            max_open: max_open.filter(|m| *m > 0),
            open: HashMap::with_capacity(256),
            by_end: BTreeSet::new(),
            dirty: HashSet::with_capacity(256),
            closed_through: None,
            force_closed: HashMap::new(),
            pending_forced: Vec::new(),
        }
    }

    /// Returns the open accumulator for `key`, creating a zero-valued one if
    /// needed. Fails for buckets that have already closed.
    pub fn get_or_create(&mut self, key: &AggregationKey) -> Result<&mut Aggregation, CacheError> {
        if !self.open.contains_key(key) {
            let end = key
                .bucket(&self.calendar)
                .ok_or_else(|| CacheError::UnknownBucket { key: key.clone() })?
                .end;

            if let Some(late) = self.closed_bucket(key, end) {
                return Err(late.into());
            }

            self.open
                .insert(key.clone(), Aggregation::new(key.clone(), end));
            self.by_end.insert((end, key.clone()));
            self.enforce_cap(key);
        }

        self.dirty.insert(key.clone());
        self.open
            .get_mut(key)
            .ok_or_else(|| CacheError::UnknownBucket { key: key.clone() })
    }

    /// Applies one statistics update to `key`'s accumulator.
    pub fn increment(
        &mut self,
        key: &AggregationKey,
        delta: &AggregationDelta<'_>,
    ) -> Result<(), CacheError> {
        self.get_or_create(key)?.apply(delta);
        Ok(())
    }

    /// Closes and removes every accumulator whose bucket ended at or before
    /// `as_of`, plus anything the memory cap closed early.
    pub fn evict_closable(&mut self, as_of: DateTime<Utc>) -> Vec<ClosedAggregation> {
        let watermark = match self.closed_through {
            Some(current) if current > as_of => current,
            _ => as_of,
        };
        self.closed_through = Some(watermark);

        let mut closed: Vec<ClosedAggregation> = self
            .pending_forced
            .drain(..)
            .map(|agg| agg.close(as_of))
            .collect();

        while let Some((end, _)) = self.by_end.first() {
            if *end > watermark {
                break;
            }
            let Some((_, key)) = self.by_end.pop_first() else {
                break;
            };
            self.dirty.remove(&key);
            if let Some(agg) = self.open.remove(&key) {
                closed.push(agg.close(as_of));
            }
        }

        self.force_closed.retain(|_, end| *end > watermark);

        if !closed.is_empty() {
            debug!(
                closed = closed.len(),
                open = self.open.len(),
                %watermark,
                "evicted closable aggregations",
            );
        }

        closed
    }

    /// Snapshots of accumulators modified since the previous flush.
    pub fn flush(&mut self) -> Vec<Aggregation> {
        let mut out = Vec::with_capacity(self.dirty.len());
        for key in self.dirty.drain() {
            if let Some(agg) = self.open.get(&key) {
                out.push(agg.clone());
            }
        }
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    /// Replaces the contents with persisted state.
    pub fn restore(
        &mut self,
        open: Vec<Aggregation>,
        closed_through: Option<DateTime<Utc>>,
        force_closed: Vec<(AggregationKey, DateTime<Utc>)>,
    ) {
        self.clear();
        self.closed_through = closed_through;
        self.force_closed = force_closed.into_iter().collect();
        for agg in open {
            self.by_end.insert((agg.bucket_end(), agg.key().clone()));
            self.open.insert(agg.key().clone(), agg);
        }
    }

    /// Drops everything, watermark included.
    pub fn clear(&mut self) {
        self.open.clear();
        self.by_end.clear();
        self.dirty.clear();
        self.force_closed.clear();
        self.pending_forced.clear();
        self.closed_through = None;
    }

    pub fn get(&self, key: &AggregationKey) -> Option<&Aggregation> {
        self.open.get(key)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn closed_through(&self) -> Option<DateTime<Utc>> {
        self.closed_through
    }

    /// Keys closed early by the memory cap that the watermark has not passed.
    pub fn force_closed(&self) -> impl Iterator<Item = (&AggregationKey, &DateTime<Utc>)> {
        self.force_closed.iter()
    }

    fn closed_bucket(&self, key: &AggregationKey, end: DateTime<Utc>) -> Option<LateEvent> {
        let by_watermark = self.closed_through.is_some_and(|w| end <= w);
        if by_watermark || self.force_closed.contains_key(key) {
            return Some(LateEvent {
                key: key.clone(),
                bucket_end: end,
                event_id: None,
            });
        }
        None
    }

    /// Force-closes the earliest-ending buckets, never `protect`, until the
    /// cache is back under its cap.
    fn enforce_cap(&mut self, protect: &AggregationKey) {
        let Some(max_open) = self.max_open else {
            return;
        };

        while self.open.len() > max_open {
            let victim = self
                .by_end
                .iter()
                .find(|(_, k)| k != protect)
                .cloned();
            let Some((end, key)) = victim else {
                break;
            };

            self.by_end.remove(&(end, key.clone()));
            self.dirty.remove(&key);
            if let Some(agg) = self.open.remove(&key) {
                warn!(
                    key = %key,
                    bucket_end = %end,
                    max_open,
                    "aggregation cache over capacity, closing bucket early",
                );
                self.pending_forced.push(agg);
                self.force_closed.insert(key, end);
            }
        }
    }
}

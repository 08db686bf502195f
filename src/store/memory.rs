//! In-process store backing tests and single-node runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;

use crate::aggregation::{Aggregation, AggregationKey, ClosedAggregation};
use crate::dimension::{DateDimension, DimensionStore, TimeDimension};
use crate::event::{EventSession, EventStatus, RawEvent};

use super::{
    check_sequence, AggregationRecord, AggregationStore, Checkpoint, ClosedFilter, CommitBatch,
    EventSessionStore, RawEventStore, StoreError,
};

#[derive(Default)]
struct Inner {
    next_event_id: i64,
    events: BTreeMap<i64, (RawEvent, EventStatus)>,
    sessions: HashMap<String, EventSession>,
    aggregations: BTreeMap<AggregationKey, AggregationRecord>,
    checkpoint: Option<Checkpoint>,
    dates: BTreeMap<NaiveDate, DateDimension>,
    times: BTreeMap<NaiveTime, TimeDimension>,
}

/// Every store contract over one mutex-guarded state.
///
/// Commits validate first and then apply without any fallible step, so a
/// batch is all-or-nothing. [`fail_next_commits`](Self::fail_next_commits)
/// injects backend failures.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn touch_session(sessions: &mut HashMap<String, EventSession>, session: &EventSession) {
    match sessions.get_mut(&session.session_id) {
        Some(existing) => {
            if session.last_accessed > existing.last_accessed {
                existing.last_accessed = session.last_accessed;
            }
        }
        None => {
            sessions.insert(session.session_id.clone(), session.clone());
        }
    }
}

impl RawEventStore for MemoryStore {
    fn append(&self, events: &[RawEvent]) -> Result<Vec<i64>, StoreError> {
        let mut inner = self.inner.lock();
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            inner.next_event_id += 1;
            let id = inner.next_event_id;
            let mut stored = event.clone();
            stored.id = id;
            inner.events.insert(id, (stored, EventStatus::Pending));
            ids.push(id);
        }
        Ok(ids)
    }

    fn read_pending(&self, limit: usize) -> Result<Vec<RawEvent>, StoreError> {
        let inner = self.inner.lock();
        let mut pending: Vec<RawEvent> = inner
            .events
            .values()
            .filter(|(_, status)| *status == EventStatus::Pending)
            .map(|(event, _)| event.clone())
            .collect();
        pending.sort_by(|a, b| (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn event_status(&self, id: i64) -> Result<Option<EventStatus>, StoreError> {
        Ok(self.inner.lock().events.get(&id).map(|(_, status)| *status))
    }

    fn purge_processed(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let len = inner.events.len();
        inner.events.retain(|_, (event, status)| {
            *status == EventStatus::Pending || event.occurred_at >= before
        });
        Ok(len - inner.events.len())
    }
}

impl AggregationStore for MemoryStore {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut inner = self.inner.lock();
        check_sequence(inner.checkpoint.as_ref(), &batch.checkpoint)?;

        for agg in &batch.open {
            let record = AggregationRecord::from_open(agg);
            upsert_unless_closed(&mut inner.aggregations, record);
        }
        for agg in &batch.closed {
            let record = AggregationRecord::from_closed(agg);
            upsert_unless_closed(&mut inner.aggregations, record);
        }

        let marks = batch
            .aggregated_events
            .iter()
            .map(|id| (id, EventStatus::Aggregated))
            .chain(batch.late_events.iter().map(|id| (id, EventStatus::Late)))
            .chain(
                batch
                    .unaggregatable_events
                    .iter()
                    .map(|id| (id, EventStatus::Unaggregatable)),
            );
        for (id, status) in marks {
            if let Some((_, current)) = inner.events.get_mut(id) {
                *current = status;
            }
        }

        for session in &batch.sessions {
            touch_session(&mut inner.sessions, session);
        }

        inner.checkpoint = Some(batch.checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.inner.lock().checkpoint.clone())
    }

    fn load_open(&self) -> Result<Vec<Aggregation>, StoreError> {
        Ok(self
            .inner
            .lock()
            .aggregations
            .values()
            .filter_map(|r| r.clone().into_open())
            .collect())
    }

    fn load_force_closed_after(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<(AggregationKey, DateTime<Utc>)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .aggregations
            .values()
            .filter(|r| r.is_closed() && after.map_or(true, |w| r.bucket_end > w))
            .map(|r| (r.key.clone(), r.bucket_end))
            .collect())
    }

    fn get_aggregation(&self, key: &AggregationKey) -> Result<Option<AggregationRecord>, StoreError> {
        Ok(self.inner.lock().aggregations.get(key).cloned())
    }

    fn list_closed(&self, filter: &ClosedFilter) -> Result<Vec<ClosedAggregation>, StoreError> {
        Ok(self
            .inner
            .lock()
            .aggregations
            .values()
            .filter(|r| filter.matches(&r.key))
            .filter_map(|r| r.clone().into_closed())
            .collect())
    }
}

fn upsert_unless_closed(
    rows: &mut BTreeMap<AggregationKey, AggregationRecord>,
    record: AggregationRecord,
) {
    if rows.get(&record.key).is_some_and(AggregationRecord::is_closed) {
        return;
    }
    rows.insert(record.key.clone(), record);
}

impl EventSessionStore for MemoryStore {
    fn touch(&self, session: &EventSession) -> Result<(), StoreError> {
        touch_session(&mut self.inner.lock().sessions, session);
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<EventSession>, StoreError> {
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    fn purge_expired(&self, idle_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let len = inner.sessions.len();
        inner
            .sessions
            .retain(|_, s| s.last_accessed >= idle_before);
        Ok(len - inner.sessions.len())
    }
}

impl DimensionStore for MemoryStore {
    fn insert_date_if_absent(&self, row: &DateDimension) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.dates.contains_key(&row.date) {
            return Ok(false);
        }
        inner.dates.insert(row.date, row.clone());
        Ok(true)
    }

    fn insert_time_if_absent(&self, row: &TimeDimension) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.times.contains_key(&row.time) {
            return Ok(false);
        }
        inner.times.insert(row.time, *row);
        Ok(true)
    }

    fn get_date(&self, date: NaiveDate) -> Result<Option<DateDimension>, StoreError> {
        Ok(self.inner.lock().dates.get(&date).cloned())
    }

    fn get_time(&self, time: NaiveTime) -> Result<Option<TimeDimension>, StoreError> {
        Ok(self.inner.lock().times.get(&time).copied())
    }

    fn date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError> {
        let inner = self.inner.lock();
        let first = inner.dates.keys().next().copied();
        let last = inner.dates.keys().next_back().copied();
        Ok(first.zip(last))
    }

    fn time_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().times.len())
    }
}

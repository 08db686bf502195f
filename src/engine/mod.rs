//! Lock-protected aggregation runs and maintenance jobs.
//!
//! Every job is guarded by its own cluster mutex, so at most one node in the
//! cluster executes a given job at a time. Aggregation consumes pending raw
//! events in batches; each batch is committed atomically together with a
//! checkpoint whose sequence fences out a node that lost its mutex.

pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregation::{
    AggregationCache, AggregationDelta, AggregationInterval, AggregationKeying, CacheError,
    GroupCatalog, LateEvent,
};
use crate::clock::{expiry, to_chrono, ProcessingClock};
use crate::config::Config;
use crate::dimension::{DateDimension, DimensionCatalog, DimensionError, PopulateReport};
use crate::event::{EventSession, RawEvent};
use crate::export::HealthMetrics;
use crate::lock::service::Lease;
use crate::lock::{ClusterLockService, LockResult, LockStoreError};
use crate::store::{
    AggregationStore, Checkpoint, CommitBatch, EventSessionStore, RawEventStore, StoreError,
};

pub use self::scheduler::Scheduler;

/// Mutex guarding aggregation runs.
pub const AGGREGATION_LOCK: &str = "aggregation";
/// Mutex guarding date/time dimension population.
pub const DIMENSION_LOCK: &str = "dimension-population";
/// Mutex guarding raw event retention.
pub const RAW_EVENT_PURGE_LOCK: &str = "raw-event-purge";
/// Mutex guarding event session expiry.
pub const SESSION_PURGE_LOCK: &str = "event-session-purge";

/// Where an aggregation run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    LockAcquiring,
    Aggregating,
    Closing,
    Persisting,
}

/// Errors surfaced by engine jobs. Lock contention is not an error; see
/// [`RunOutcome::Skipped`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("lock store: {0}")]
    Lock(#[from] LockStoreError),

    #[error("reading pending events: {0}")]
    EventRead(#[source] StoreError),

    #[error("restoring aggregation state: {0}")]
    Restore(#[source] StoreError),

    #[error("persisting batch: {0}")]
    BatchPersistence(#[source] StoreError),

    #[error(transparent)]
    Dimension(#[from] DimensionError),

    #[error("purging {kind}: {source}")]
    Purge {
        kind: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Result of a lock-protected job.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    /// This node held the mutex and ran the job.
    Completed(T),
    /// Another run held the mutex.
    Skipped,
}

impl<T> RunOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

/// Event consumed without contributing to any bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaggregatableEvent {
    pub event_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub reason: String,
}

/// Summary of one aggregation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationReport {
    /// Batches committed.
    pub batches: usize,
    /// Raw events consumed, late ones included.
    pub events_processed: usize,
    /// Updates that addressed an already closed bucket.
    pub late_events: Vec<LateEvent>,
    /// Events whose date or buckets could not be resolved.
    pub unaggregatable: Vec<UnaggregatableEvent>,
    pub aggregations_closed: usize,
    /// Open accumulators persisted for failover.
    pub aggregations_flushed: usize,
    /// The cache was rebuilt from persisted state at the start of the run.
    pub restored: bool,
    /// A renewal failed; the run stopped early and the cache was discarded.
    pub lock_lost: bool,
    pub closed_through: Option<DateTime<Utc>>,
}

/// Tunables for aggregation and maintenance jobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub intervals: Vec<AggregationInterval>,
    pub batch_size: usize,
    pub max_batches_per_run: usize,
    pub run_budget: Duration,
    pub close_delay: Duration,
    pub max_open: Option<usize>,
    pub populate_lookahead: Duration,
    pub event_retention: Duration,
    pub session_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            intervals: vec![
                AggregationInterval::Hour,
                AggregationInterval::Day,
                AggregationInterval::Month,
            ],
            batch_size: 1000,
            max_batches_per_run: 100,
            run_budget: Duration::from_secs(60),
            close_delay: Duration::ZERO,
            max_open: None,
            populate_lookahead: Duration::from_secs(30 * 86_400),
            event_retention: Duration::from_secs(30 * 86_400),
            session_ttl: Duration::from_secs(86_400),
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            intervals: cfg.aggregation.intervals.clone(),
            batch_size: cfg.aggregation.batch_size,
            max_batches_per_run: cfg.aggregation.max_batches_per_run,
            run_budget: cfg.aggregation.run_budget,
            close_delay: cfg.aggregation.close_delay,
            max_open: cfg.aggregation.max_open,
            populate_lookahead: cfg.dimensions.lookahead,
            event_retention: cfg.purge.event_retention,
            session_ttl: cfg.purge.session_ttl,
        }
    }
}

/// Stores the engine reads from and commits to.
#[derive(Clone)]
pub struct EngineStores {
    pub events: Arc<dyn RawEventStore>,
    pub aggregations: Arc<dyn AggregationStore>,
    pub sessions: Arc<dyn EventSessionStore>,
}

struct EngineState {
    cache: AggregationCache,
    /// Checkpoint sequence the cache reflects. `None` when the cache must be
    /// rebuilt before use.
    synced_sequence: Option<u64>,
}

impl EngineState {
    fn invalidate(&mut self) {
        self.cache.clear();
        self.synced_sequence = None;
    }
}

enum BatchProgress {
    /// Fewer than `batch_size` events were pending.
    Drained,
    More,
}

/// Cluster-coordinated aggregation of raw events into time buckets.
pub struct AggregationEngine {
    locks: Arc<ClusterLockService>,
    dimensions: Arc<DimensionCatalog>,
    keying: AggregationKeying,
    stores: EngineStores,
    clock: Arc<dyn ProcessingClock>,
    settings: EngineSettings,
    metrics: Option<Arc<HealthMetrics>>,
    phase: Mutex<EnginePhase>,
    state: Mutex<EngineState>,
}

impl AggregationEngine {
    pub fn new(
        locks: Arc<ClusterLockService>,
        dimensions: Arc<DimensionCatalog>,
        groups: Arc<GroupCatalog>,
        stores: EngineStores,
        clock: Arc<dyn ProcessingClock>,
        settings: EngineSettings,
    ) -> Self {
        let calendar = Arc::clone(dimensions.calendar());
        let cache = AggregationCache::new(Arc::clone(&calendar), settings.max_open);

        Self {
            locks,
            dimensions,
            keying: AggregationKeying::new(calendar, groups),
            stores,
            clock,
            settings,
            metrics: None,
            phase: Mutex::new(EnginePhase::Idle),
            state: Mutex::new(EngineState {
                cache,
                synced_sequence: None,
            }),
        }
    }

    /// Reports progress to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.lock()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn locks(&self) -> &Arc<ClusterLockService> {
        &self.locks
    }

    /// Consumes pending raw events under the aggregation mutex.
    ///
    /// Returns [`RunOutcome::Skipped`] when another run holds the mutex. A
    /// failed batch discards the cache and commits nothing; its events stay
    /// pending for the next run.
    pub fn run_aggregation(&self) -> Result<RunOutcome<AggregationReport>, EngineError> {
        let started = Instant::now();
        self.set_phase(EnginePhase::LockAcquiring);

        let result = self
            .locks
            .do_under_lease(AGGREGATION_LOCK, |lease| self.aggregate_locked(lease, started));

        self.set_phase(EnginePhase::Idle);

        let outcome = match result {
            Err(e) => Err(EngineError::from(e)),
            Ok(LockResult::Skipped) => Ok(RunOutcome::Skipped),
            Ok(LockResult::Executed { value, lock_lost }) => {
                if lock_lost {
                    self.state.lock().invalidate();
                    if let Some(m) = &self.metrics {
                        m.lock_lost.inc();
                    }
                }
                value.map(|mut report| {
                    report.lock_lost |= lock_lost;
                    RunOutcome::Completed(report)
                })
            }
        };

        match &outcome {
            Ok(RunOutcome::Completed(report)) => {
                if report.events_processed > 0 || report.aggregations_closed > 0 {
                    info!(
                        batches = report.batches,
                        events = report.events_processed,
                        late = report.late_events.len(),
                        unaggregatable = report.unaggregatable.len(),
                        closed = report.aggregations_closed,
                        flushed = report.aggregations_flushed,
                        restored = report.restored,
                        lock_lost = report.lock_lost,
                        "aggregation run completed",
                    );
                }
            }
            Ok(RunOutcome::Skipped) => debug!("aggregation run skipped, lock held elsewhere"),
            Err(e) => warn!(error = %e, "aggregation run failed"),
        }

        self.record_run("aggregation", &outcome, started);
        outcome
    }

    /// Keeps the date dimension populated through `now + populate_lookahead`.
    pub fn populate_dimensions(&self) -> Result<RunOutcome<PopulateReport>, EngineError> {
        let started = Instant::now();
        let through = expiry(self.clock.now(), self.settings.populate_lookahead);

        let result = self.locks.do_under_lock(DIMENSION_LOCK, || {
            self.sweep_locks();
            self.dimensions.ensure_populated(through)
        });

        let outcome = flatten(result, EngineError::from);
        if let (Ok(RunOutcome::Completed(report)), Some(m)) = (&outcome, &self.metrics) {
            m.dimension_rows_created
                .with_label_values(&["date"])
                .inc_by(report.dates_created as f64);
            m.dimension_rows_created
                .with_label_values(&["time"])
                .inc_by(report.times_created as f64);
        }
        self.record_run("dimension_population", &outcome, started);
        outcome
    }

    /// Deletes consumed raw events older than `event_retention`.
    pub fn purge_raw_events(&self) -> Result<RunOutcome<usize>, EngineError> {
        let started = Instant::now();
        let before = self.clock.now() - to_chrono(self.settings.event_retention);

        let result = self.locks.do_under_lock(RAW_EVENT_PURGE_LOCK, || {
            self.sweep_locks();
            self.stores.events.purge_processed(before)
        });

        let outcome = flatten(result, |source| EngineError::Purge {
            kind: "raw_event",
            source,
        });
        self.record_purge("raw_event", &outcome, started);
        outcome
    }

    /// Deletes sessions idle longer than `session_ttl`.
    pub fn purge_event_sessions(&self) -> Result<RunOutcome<usize>, EngineError> {
        let started = Instant::now();
        let idle_before = self.clock.now() - to_chrono(self.settings.session_ttl);

        let result = self.locks.do_under_lock(SESSION_PURGE_LOCK, || {
            self.sweep_locks();
            self.stores.sessions.purge_expired(idle_before)
        });

        let outcome = flatten(result, |source| EngineError::Purge {
            kind: "event_session",
            source,
        });
        self.record_purge("event_session", &outcome, started);
        outcome
    }

    fn aggregate_locked(
        &self,
        lease: &Lease,
        started: Instant,
    ) -> Result<AggregationReport, EngineError> {
        let mut state = self.state.lock();
        let mut report = AggregationReport::default();

        if let Err(e) = self.sync_cache(&mut state, &mut report) {
            state.invalidate();
            return Err(e);
        }

        for _ in 0..self.settings.max_batches_per_run {
            if lease.is_lost() {
                warn!("aggregation lock lost, stopping run");
                report.lock_lost = true;
                break;
            }

            match self.run_batch(&mut state, &mut report) {
                Ok(BatchProgress::Drained) => break,
                Ok(BatchProgress::More) => {}
                Err(e) => {
                    state.invalidate();
                    if let Some(m) = &self.metrics {
                        m.batch_failures.inc();
                    }
                    return Err(e);
                }
            }

            if started.elapsed() >= self.settings.run_budget {
                debug!(batches = report.batches, "aggregation run budget spent");
                break;
            }
        }

        if let Some(m) = &self.metrics {
            m.open_aggregations.set(state.cache.len() as f64);
        }
        report.closed_through = state.cache.closed_through();
        Ok(report)
    }

    /// Rebuilds the cache from the store unless it already reflects the
    /// stored checkpoint.
    fn sync_cache(
        &self,
        state: &mut EngineState,
        report: &mut AggregationReport,
    ) -> Result<(), EngineError> {
        let aggs = &self.stores.aggregations;
        let stored = aggs.load_checkpoint().map_err(EngineError::Restore)?;
        let stored_sequence = stored.as_ref().map_or(0, |c| c.sequence);

        if state.synced_sequence == Some(stored_sequence) {
            return Ok(());
        }

        let closed_through = stored.as_ref().and_then(|c| c.closed_through);
        let open = aggs.load_open().map_err(EngineError::Restore)?;
        let force_closed = aggs
            .load_force_closed_after(closed_through)
            .map_err(EngineError::Restore)?;

        info!(
            sequence = stored_sequence,
            owner = stored.as_ref().map_or("", |c| c.owner.as_str()),
            open = open.len(),
            force_closed = force_closed.len(),
            "restoring aggregation cache from store",
        );

        state.cache.restore(open, closed_through, force_closed);
        state.synced_sequence = Some(stored_sequence);
        report.restored = true;
        if let Some(m) = &self.metrics {
            m.cache_restores.inc();
        }
        Ok(())
    }

    fn run_batch(
        &self,
        state: &mut EngineState,
        report: &mut AggregationReport,
    ) -> Result<BatchProgress, EngineError> {
        self.set_phase(EnginePhase::Aggregating);

        let batch_size = self.settings.batch_size;
        let events = self
            .stores
            .events
            .read_pending(batch_size)
            .map_err(EngineError::EventRead)?;
        let drained = events.len() < batch_size;

        let mut aggregated_events = Vec::with_capacity(events.len());
        let mut late_events = Vec::new();
        let mut late = Vec::new();
        let mut unaggregatable = Vec::new();
        let mut sessions: HashMap<&str, EventSession> = HashMap::new();
        let mut newest: Option<DateTime<Utc>> = None;

        for event in &events {
            let before = late.len();
            let applied = match self.resolve_date(event.occurred_at) {
                Ok(date) => self
                    .aggregate_event(&mut state.cache, event, &date, &mut late)
                    .map_err(|interval| format!("no {interval} bucket for {}", event.occurred_at)),
                Err(EngineError::Dimension(e @ DimensionError::OutOfHorizon { .. })) => {
                    Err(e.to_string())
                }
                Err(e) => return Err(e),
            };

            if let Err(reason) = applied {
                warn!(
                    event_id = event.id,
                    occurred_at = %event.occurred_at,
                    %reason,
                    "event cannot be aggregated",
                );
                unaggregatable.push(UnaggregatableEvent {
                    event_id: event.id,
                    occurred_at: event.occurred_at,
                    reason,
                });
                continue;
            }

            if late.len() > before {
                late_events.push(event.id);
            } else {
                aggregated_events.push(event.id);
            }

            if let Some(session_id) = event.session_id.as_deref() {
                let entry = sessions.entry(session_id).or_insert_with(|| EventSession {
                    session_id: session_id.to_string(),
                    subject: event.subject.clone(),
                    last_accessed: event.occurred_at,
                });
                if event.occurred_at > entry.last_accessed {
                    entry.last_accessed = event.occurred_at;
                }
            }

            newest = newest.max(Some(event.occurred_at));
        }

        self.set_phase(EnginePhase::Closing);

        let settled = self.clock.now() - to_chrono(self.settings.close_delay);
        // Pending events are read in timestamp order, so nothing left in the
        // backlog can fall into a bucket ending at or before `newest`.
        let as_of = match newest {
            Some(newest) if !drained => newest.min(settled),
            _ => settled,
        };
        let closed = state.cache.evict_closable(as_of);

        self.set_phase(EnginePhase::Persisting);

        let next_sequence = state.synced_sequence.unwrap_or(0) + 1;
        let mut batch = CommitBatch::new(Checkpoint {
            owner: self.locks.identity().as_str().to_string(),
            sequence: next_sequence,
            closed_through: state.cache.closed_through(),
        });
        batch.closed = closed;
        batch.open = state.cache.flush();
        batch.aggregated_events = aggregated_events;
        batch.late_events = late_events;
        batch.unaggregatable_events = unaggregatable.iter().map(|e| e.event_id).collect();
        batch.sessions = sessions.into_values().collect();

        self.stores
            .aggregations
            .commit(&batch)
            .map_err(EngineError::BatchPersistence)?;
        state.synced_sequence = Some(next_sequence);

        debug!(
            sequence = next_sequence,
            events = batch.event_count(),
            late = batch.late_events.len(),
            unaggregatable = batch.unaggregatable_events.len(),
            closed = batch.closed.len(),
            open = batch.open.len(),
            %as_of,
            "aggregation batch committed",
        );

        if let Some(m) = &self.metrics {
            m.events_aggregated.inc_by(batch.event_count() as f64);
            m.late_events.inc_by(late.len() as f64);
            m.unaggregatable_events.inc_by(unaggregatable.len() as f64);
            m.aggregations_closed.inc_by(batch.closed.len() as f64);
        }

        report.batches += 1;
        report.events_processed += batch.event_count();
        report.aggregations_closed += batch.closed.len();
        report.aggregations_flushed += batch.open.len();
        report.late_events.extend(late);
        report.unaggregatable.extend(unaggregatable);

        Ok(if drained {
            BatchProgress::Drained
        } else {
            BatchProgress::More
        })
    }

    /// Applies `event` to every bucket it belongs to. Updates for closed
    /// buckets are collected in `late`; the others still apply.
    ///
    /// Fails with the offending interval, before touching the cache, when a
    /// bucket cannot be computed for the event.
    fn aggregate_event(
        &self,
        cache: &mut AggregationCache,
        event: &RawEvent,
        date: &DateDimension,
        late: &mut Vec<LateEvent>,
    ) -> Result<(), AggregationInterval> {
        let calendar = self.keying.calendar();
        let mut keys = Vec::new();
        for &interval in &self.settings.intervals {
            // Dates outside every term legitimately have no term bucket.
            let termless = interval == AggregationInterval::AcademicTerm && date.term.is_none();
            if !termless && interval.bucket(event.occurred_at, calendar).is_none() {
                return Err(interval);
            }
            keys.extend(self.keying.derive_keys(event, date, interval));
        }

        let delta = AggregationDelta {
            subject: Some(event.subject.as_str()),
            duration_ms: event.payload.duration_ms(),
        };

        let mut unbucketable = None;
        for key in &keys {
            match cache.increment(key, &delta) {
                Ok(()) => {}
                Err(CacheError::Late(e)) => {
                    debug!(event_id = event.id, key = %e.key, "late event");
                    late.push(e.with_event(event.id));
                }
                Err(CacheError::UnknownBucket { key }) => {
                    unbucketable.get_or_insert(key.interval);
                }
            }
        }

        unbucketable.map_or(Ok(()), Err)
    }

    /// Resolves the date dimension for `instant`, extending the populated
    /// range once if it does not cover it yet.
    fn resolve_date(&self, instant: DateTime<Utc>) -> Result<DateDimension, EngineError> {
        match self.dimensions.resolve(instant) {
            Ok((date, _)) => Ok(date),
            Err(DimensionError::NotPopulated { .. }) => {
                let now = self.clock.now();
                let populated = self.locks.do_under_lock(DIMENSION_LOCK, || {
                    self.dimensions.ensure_covering(instant, now)
                })?;
                if let LockResult::Executed { value, .. } = populated {
                    value?;
                }
                let (date, _) = self.dimensions.resolve(instant)?;
                Ok(date)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sweep_locks(&self) {
        match self.locks.sweep_expired() {
            Ok(removed) => {
                if let Some(m) = &self.metrics {
                    m.rows_purged
                        .with_label_values(&["cluster_mutex"])
                        .inc_by(removed as f64);
                }
            }
            Err(e) => warn!(error = %e, "sweeping expired cluster locks failed"),
        }
    }

    fn set_phase(&self, phase: EnginePhase) {
        *self.phase.lock() = phase;
    }

    fn record_run<T>(
        &self,
        job: &'static str,
        outcome: &Result<RunOutcome<T>, EngineError>,
        started: Instant,
    ) {
        let Some(m) = &self.metrics else {
            return;
        };
        let label = match outcome {
            Ok(RunOutcome::Completed(_)) => "completed",
            Ok(RunOutcome::Skipped) => "skipped",
            Err(_) => "failed",
        };
        m.job_runs.with_label_values(&[job, label]).inc();
        m.job_duration
            .with_label_values(&[job])
            .observe(started.elapsed().as_secs_f64());
    }

    fn record_purge(
        &self,
        kind: &'static str,
        outcome: &Result<RunOutcome<usize>, EngineError>,
        started: Instant,
    ) {
        match outcome {
            Ok(RunOutcome::Completed(removed)) => {
                if *removed > 0 {
                    info!(kind, removed, "purged expired rows");
                }
                if let Some(m) = &self.metrics {
                    m.rows_purged
                        .with_label_values(&[kind])
                        .inc_by(*removed as f64);
                }
            }
            Ok(RunOutcome::Skipped) => debug!(kind, "purge skipped, lock held elsewhere"),
            Err(e) => warn!(kind, error = %e, "purge failed"),
        }
        self.record_run(kind, outcome, started);
    }
}

/// Collapses a lock result carrying a fallible job value.
fn flatten<T, E>(
    result: Result<LockResult<Result<T, E>>, LockStoreError>,
    map_err: impl FnOnce(E) -> EngineError,
) -> Result<RunOutcome<T>, EngineError> {
    match result? {
        LockResult::Skipped => Ok(RunOutcome::Skipped),
        LockResult::Executed { value, .. } => value.map(RunOutcome::Completed).map_err(map_err),
    }
}

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AggregationEngine, EngineError, RunOutcome};

/// Job periods for [`Scheduler`].
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub aggregation: Duration,
    pub dimension_population: Duration,
    pub purge: Duration,
}

/// Runs engine jobs periodically until cancelled.
///
/// Jobs are synchronous and touch the store, so each tick executes on the
/// blocking pool. A failing job is logged and retried on its next tick.
pub struct Scheduler {
    engine: Arc<AggregationEngine>,
    schedule: Schedule,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<AggregationEngine>, schedule: Schedule, cancel: CancellationToken) -> Self {
        Self {
            engine,
            schedule,
            cancel,
        }
    }

    /// Spawns one loop per job and returns their handles.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        info!(
            aggregation = ?self.schedule.aggregation,
            dimension_population = ?self.schedule.dimension_population,
            purge = ?self.schedule.purge,
            "starting scheduler",
        );

        vec![
            self.spawn_job("dimension_population", self.schedule.dimension_population, |e| {
                e.populate_dimensions()
            }),
            self.spawn_job("aggregation", self.schedule.aggregation, |e| {
                e.run_aggregation()
            }),
            self.spawn_job("raw_event_purge", self.schedule.purge, |e| {
                e.purge_raw_events()
            }),
            self.spawn_job("event_session_purge", self.schedule.purge, |e| {
                e.purge_event_sessions()
            }),
        ]
    }

    fn spawn_job<T, F>(&self, job: &'static str, period: Duration, run: F) -> JoinHandle<()>
    where
        T: Debug + Send + 'static,
        F: Fn(&AggregationEngine) -> Result<RunOutcome<T>, EngineError>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        let cancel = self.cancel.clone();
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(job, "job loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let engine = Arc::clone(&engine);
                        let run = run.clone();
                        match tokio::task::spawn_blocking(move || run(&engine)).await {
                            Ok(Ok(RunOutcome::Completed(value))) => {
                                debug!(job, result = ?value, "job completed");
                            }
                            Ok(Ok(RunOutcome::Skipped)) => {}
                            Ok(Err(e)) => warn!(job, error = %e, "job failed"),
                            Err(e) => error!(job, error = %e, "job panicked"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::aggregation::GroupCatalog;
    use crate::clock::ManualClock;
    use crate::dimension::{Calendar, DimensionCatalog, DimensionStore};
    use crate::engine::{EngineSettings, EngineStores};
    use crate::event::{EventPayload, RawEvent};
    use crate::lock::memory::InMemoryMutexStore;
    use crate::lock::{ClusterLockService, LockConfig, ServerIdentity};
    use crate::store::memory::MemoryStore;
    use crate::store::RawEventStore;

    #[tokio::test]
    async fn test_scheduler_runs_jobs_until_cancelled() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        store
            .append(&[RawEvent {
                id: 0,
                occurred_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap(),
                subject: "alice".to_string(),
                session_id: None,
                subject_groups: Vec::new(),
                payload: EventPayload::Login,
            }])
            .unwrap();

        let locks = Arc::new(ClusterLockService::new(
            Arc::new(InMemoryMutexStore::new(clock.clone())),
            ServerIdentity::new("node-a"),
            LockConfig::default(),
        ));
        let dimensions = Arc::new(DimensionCatalog::new(
            store.clone(),
            Arc::new(Calendar::default()),
            None,
        ));
        let engine = Arc::new(AggregationEngine::new(
            locks,
            dimensions,
            Arc::new(GroupCatalog::default()),
            EngineStores {
                events: store.clone(),
                aggregations: store.clone(),
                sessions: store.clone(),
            },
            clock,
            EngineSettings::default(),
        ));

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            engine,
            Schedule {
                aggregation: Duration::from_millis(10),
                dimension_population: Duration::from_millis(10),
                purge: Duration::from_secs(3600),
            },
            cancel.clone(),
        );
        let handles = scheduler.spawn();

        let mut drained = false;
        for _ in 0..200 {
            if store.read_pending(10).unwrap().is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(drained);
        assert_eq!(store.time_count().unwrap(), 1440);
    }
}

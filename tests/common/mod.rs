#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use eventagg::aggregation::{
    AggregationInterval, AggregationType, ClosedAggregation, GroupCatalog, GroupMapping,
};
use eventagg::clock::{ManualClock, ProcessingClock};
use eventagg::dimension::{Calendar, DimensionCatalog, DimensionStore};
use eventagg::engine::{AggregationEngine, EngineSettings, EngineStores};
use eventagg::event::{EventPayload, ExecutionKind, RawEvent};
use eventagg::lock::{ClusterLockService, LockConfig, MutexStore, ServerIdentity};
use eventagg::store::{AggregationStore, ClosedFilter, EventSessionStore, RawEventStore};

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
}

pub fn manual_clock(start: DateTime<Utc>) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start))
}

/// A day of mixed traffic: `n` events spread over 09:00-12:00.
pub fn traffic(n: u32) -> Vec<RawEvent> {
    (0..n)
        .map(|i| {
            let payload = match i % 3 {
                0 => EventPayload::Login,
                1 => EventPayload::TabRender {
                    tab: format!("tab-{}", i % 4),
                    duration_ms: u64::from(20 + i % 50),
                },
                _ => EventPayload::PortletExecution {
                    resource: "weather".to_string(),
                    operation: ExecutionKind::Render,
                    duration_ms: u64::from(5 + i % 17),
                },
            };
            RawEvent {
                id: 0,
                occurred_at: at(9, 0) + Duration::seconds(i64::from(i) * 10_800 / i64::from(n)),
                subject: format!("user-{}", i % 23),
                session_id: Some(format!("session-{}", i % 23)),
                subject_groups: if i % 2 == 0 {
                    vec!["students".to_string()]
                } else {
                    vec!["staff".to_string()]
                },
                payload,
            }
        })
        .collect()
}

pub fn engine<S>(
    store: Arc<S>,
    mutexes: Arc<dyn MutexStore>,
    clock: Arc<dyn ProcessingClock>,
    node: &str,
    settings: EngineSettings,
) -> AggregationEngine
where
    S: RawEventStore + AggregationStore + EventSessionStore + DimensionStore + 'static,
{
    let locks = Arc::new(ClusterLockService::new(
        mutexes,
        ServerIdentity::new(node),
        LockConfig::default(),
    ));
    let dimensions = Arc::new(DimensionCatalog::new(
        store.clone(),
        Arc::new(Calendar::default()),
        NaiveDate::from_ymd_opt(2024, 3, 1),
    ));
    AggregationEngine::new(
        locks,
        dimensions,
        Arc::new(GroupCatalog::new(["students", "staff"])),
        EngineStores {
            events: store.clone(),
            aggregations: store.clone(),
            sessions: store,
        },
        clock,
        settings,
    )
}

pub fn settings(intervals: &[AggregationInterval]) -> EngineSettings {
    EngineSettings {
        intervals: intervals.to_vec(),
        ..Default::default()
    }
}

/// Closed totals without the closure timestamp, for comparing runs.
pub fn closed_totals(store: &dyn AggregationStore) -> Vec<(String, u64, u64, u64, u64)> {
    store
        .list_closed(&ClosedFilter::default())
        .unwrap()
        .into_iter()
        .map(|c: ClosedAggregation| {
            (
                c.key.to_string(),
                c.count,
                c.unique_count,
                c.duration.count,
                c.duration.sum_ms,
            )
        })
        .collect()
}

/// Sum of closed all-users counts of `aggregation_type` at `interval`.
pub fn all_users_total(
    store: &dyn AggregationStore,
    aggregation_type: AggregationType,
    interval: AggregationInterval,
) -> u64 {
    store
        .list_closed(&ClosedFilter {
            aggregation_type: Some(aggregation_type),
            interval: Some(interval),
        })
        .unwrap()
        .into_iter()
        .filter(|c| c.key.group == GroupMapping::AllUsers)
        .map(|c| c.count)
        .sum()
}

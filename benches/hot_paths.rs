use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use eventagg::aggregation::{
    AggregationCache, AggregationDelta, AggregationInterval, AggregationKey, AggregationKeying,
    GroupCatalog,
};
use eventagg::dimension::{AcademicTerm, Calendar, DateDimension};
use eventagg::event::{EventPayload, ExecutionKind, RawEvent};

fn calendar() -> Arc<Calendar> {
    Arc::new(Calendar::new(vec![AcademicTerm {
        name: "spring-2024".into(),
        start: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        end: chrono::NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
    }]))
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn portlet_event(i: u32) -> RawEvent {
    RawEvent {
        id: i64::from(i),
        occurred_at: start() + Duration::seconds(i64::from(i % 3_600)),
        subject: format!("user-{}", i % 250),
        session_id: None,
        subject_groups: vec!["students".into(), "staff".into(), "guests".into()],
        payload: EventPayload::PortletExecution {
            resource: format!("portlet-{}", i % 16),
            operation: ExecutionKind::Render,
            duration_ms: u64::from(i % 900),
        },
    }
}

fn bench_derive_keys(c: &mut Criterion) {
    let calendar = calendar();
    let keying = AggregationKeying::new(
        calendar.clone(),
        Arc::new(GroupCatalog::new(["students", "staff"])),
    );
    let event = portlet_event(7);
    let date = DateDimension::new(event.occurred_at.date_naive(), &calendar);

    c.bench_function("keying/derive_keys_all_intervals", |b| {
        b.iter(|| {
            let mut n = 0;
            for interval in AggregationInterval::ALL {
                n += keying
                    .derive_keys(black_box(&event), black_box(&date), interval)
                    .len();
            }
            black_box(n)
        })
    });
}

fn bench_cache_increment(c: &mut Criterion) {
    let calendar = calendar();
    let keying = AggregationKeying::new(
        calendar.clone(),
        Arc::new(GroupCatalog::new(["students", "staff"])),
    );

    let keyed: Vec<(AggregationKey, RawEvent)> = (0..4_096u32)
        .flat_map(|i| {
            let event = portlet_event(i);
            let date = DateDimension::new(event.occurred_at.date_naive(), &calendar);
            keying
                .derive_keys(&event, &date, AggregationInterval::FiveMinute)
                .into_iter()
                .map(move |key| (key, event.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    c.bench_function("cache/increment_hot_window", |b| {
        b.iter(|| {
            let mut cache = AggregationCache::new(calendar.clone(), None);
            for (key, event) in &keyed {
                let delta = AggregationDelta {
                    subject: Some(event.subject.as_str()),
                    duration_ms: event.payload.duration_ms(),
                };
                cache.increment(black_box(key), &delta).unwrap();
            }
            black_box(cache.len())
        })
    });

    c.bench_function("cache/evict_closable", |b| {
        b.iter(|| {
            let mut cache = AggregationCache::new(calendar.clone(), None);
            for (key, event) in &keyed {
                let delta = AggregationDelta {
                    subject: Some(event.subject.as_str()),
                    duration_ms: event.payload.duration_ms(),
                };
                cache.increment(key, &delta).unwrap();
            }
            black_box(cache.evict_closable(start() + Duration::hours(2)).len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_derive_keys(c);
    bench_cache_increment(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);

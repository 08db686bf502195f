//! Cluster-coordinated, time-bucketed aggregation of usage events.
//!
//! Nodes share one store. Named cluster mutexes ensure a single node runs each
//! job at a time; the aggregation job folds pending raw events into per-bucket
//! accumulators and closes buckets once their interval has ended.

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod dimension;
pub mod engine;
pub mod event;
pub mod export;
pub mod lock;
pub mod migrate;
pub mod node;
pub mod store;

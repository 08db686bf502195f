//! Operational surfaces: the Prometheus health server.

pub mod health;

pub use self::health::HealthMetrics;

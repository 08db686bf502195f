//! Key derivation, accumulators and the open-bucket working set.

pub mod aggregate;
pub mod cache;
pub mod interval;
pub mod key;

pub use self::aggregate::{Aggregation, AggregationDelta, ClosedAggregation, DurationStats};
pub use self::cache::{AggregationCache, CacheError, LateEvent};
pub use self::interval::{AggregationInterval, Bucket};
pub use self::key::{
    AggregationKey, AggregationKeying, AggregationType, Discriminator, GroupCatalog, GroupMapping,
    HasDiscriminator,
};

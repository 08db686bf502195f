use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::dimension::{Calendar, DateDimension};
use crate::event::{EventPayload, ExecutionKind, RawEvent};

use super::interval::{AggregationInterval, Bucket};

/// Default group service for names configured without a `service:` prefix.
pub const DEFAULT_GROUP_SERVICE: &str = "local";

/// Statistic family an aggregation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Login,
    TabRender,
    PortletExecution,
}

impl AggregationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::TabRender => "tab_render",
            Self::PortletExecution => "portlet_execution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "login" => Some(Self::Login),
            "tab_render" => Some(Self::TabRender),
            "portlet_execution" => Some(Self::PortletExecution),
            _ => None,
        }
    }

    /// Whether accumulators of this type carry duration statistics.
    pub const fn is_timed(self) -> bool {
        !matches!(self, Self::Login)
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-group dimension value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupMapping {
    /// Sentinel covering every subject.
    AllUsers,
    Group { service: String, name: String },
}

impl GroupMapping {
    /// Parses `service:name`, or a bare name in the default service.
    pub fn from_group_name(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((service, name)) if !service.is_empty() && !name.is_empty() => Self::Group {
                service: service.to_string(),
                name: name.to_string(),
            },
            _ => Self::Group {
                service: DEFAULT_GROUP_SERVICE.to_string(),
                name: raw.to_string(),
            },
        }
    }
}

/// Dimension(s) beyond date, time, interval and group that split a
/// statistic into separate rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discriminator {
    None,
    Tab { name: String },
    Resource { name: String, operation: ExecutionKind },
}

/// Capability of event payloads that know which statistic they feed and how
/// to split it.
pub trait HasDiscriminator {
    fn aggregation_type(&self) -> AggregationType;

    fn discriminator(&self) -> Discriminator;
}

impl HasDiscriminator for EventPayload {
    fn aggregation_type(&self) -> AggregationType {
        match self {
            Self::Login => AggregationType::Login,
            Self::TabRender { .. } => AggregationType::TabRender,
            Self::PortletExecution { .. } => AggregationType::PortletExecution,
        }
    }

    fn discriminator(&self) -> Discriminator {
        match self {
            Self::Login => Discriminator::None,
            Self::TabRender { tab, .. } => Discriminator::Tab { name: tab.clone() },
            Self::PortletExecution {
                resource,
                operation,
                ..
            } => Discriminator::Resource {
                name: resource.clone(),
                operation: *operation,
            },
        }
    }
}

/// Composite identity of one aggregation bucket. Equality is value equality
/// over every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub aggregation_type: AggregationType,
    /// Date dimension of the bucket start.
    pub date: NaiveDate,
    /// Time dimension of the bucket start.
    pub time: NaiveTime,
    pub interval: AggregationInterval,
    pub group: GroupMapping,
    pub discriminator: Discriminator,
}

impl AggregationKey {
    pub fn bucket_start(&self) -> DateTime<Utc> {
        self.date.and_time(self.time).and_utc()
    }

    /// Bucket covered by this key. `None` if the key names an academic term
    /// that is no longer configured.
    pub fn bucket(&self, calendar: &Calendar) -> Option<Bucket> {
        self.interval.bucket(self.bucket_start(), calendar)
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}T{}/{:?}/{:?}",
            self.aggregation_type, self.interval, self.date, self.time, self.group, self.discriminator
        )
    }
}

/// Resolves group names to [`GroupMapping`]s once and caches them.
///
/// Only configured groups are aggregated individually; every event also
/// counts toward [`GroupMapping::AllUsers`].
#[derive(Debug, Default)]
pub struct GroupCatalog {
    included: HashSet<String>,
    resolved: DashMap<String, GroupMapping>,
}

impl GroupCatalog {
    pub fn new<I, S>(included: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            included: included.into_iter().map(Into::into).collect(),
            resolved: DashMap::new(),
        }
    }

    /// Mapping for `group_name`, or `None` if it is not aggregated.
    pub fn resolve(&self, group_name: &str) -> Option<GroupMapping> {
        if !self.included.contains(group_name) {
            return None;
        }
        if let Some(mapping) = self.resolved.get(group_name) {
            return Some(mapping.clone());
        }
        let mapping = GroupMapping::from_group_name(group_name);
        self.resolved
            .insert(group_name.to_string(), mapping.clone());
        Some(mapping)
    }

    pub fn cached_len(&self) -> usize {
        self.resolved.len()
    }
}

/// Derives aggregation keys for raw events.
pub struct AggregationKeying {
    calendar: Arc<Calendar>,
    groups: Arc<GroupCatalog>,
}

impl AggregationKeying {
    pub fn new(calendar: Arc<Calendar>, groups: Arc<GroupCatalog>) -> Self {
        Self { calendar, groups }
    }

    pub fn calendar(&self) -> &Arc<Calendar> {
        &self.calendar
    }

    /// Keys `event` contributes to for `interval`: one per applicable group,
    /// `AllUsers` first, then configured groups in a stable order.
    ///
    /// Depends only on the event and its date dimension, so reprocessing the
    /// same event always yields equal keys.
    pub fn derive_keys(
        &self,
        event: &RawEvent,
        date: &DateDimension,
        interval: AggregationInterval,
    ) -> Vec<AggregationKey> {
        if interval == AggregationInterval::AcademicTerm && date.term.is_none() {
            return Vec::new();
        }
        let Some(bucket) = interval.bucket(event.occurred_at, &self.calendar) else {
            return Vec::new();
        };

        let groups: BTreeSet<GroupMapping> = event
            .subject_groups
            .iter()
            .filter_map(|name| self.groups.resolve(name))
            .collect();

        let aggregation_type = event.payload.aggregation_type();
        let discriminator = event.payload.discriminator();
        let date = bucket.start.date_naive();
        let time = bucket.start.time();

        std::iter::once(GroupMapping::AllUsers)
            .chain(groups)
            .map(|group| AggregationKey {
                aggregation_type,
                date,
                time,
                interval,
                group,
                discriminator: discriminator.clone(),
            })
            .collect()
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of portlet request being timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Action,
    Event,
    Render,
    Resource,
}

impl ExecutionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Event => "event",
            Self::Render => "render",
            Self::Resource => "resource",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific body of a raw usage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A user logged in.
    Login,
    /// A tab was rendered.
    TabRender { tab: String, duration_ms: u64 },
    /// A portlet request completed.
    PortletExecution {
        resource: String,
        operation: ExecutionKind,
        duration_ms: u64,
    },
}

impl EventPayload {
    /// Returns the canonical label name.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::TabRender { .. } => "tab_render",
            Self::PortletExecution { .. } => "portlet_execution",
        }
    }

    /// Duration carried by timed events.
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::Login => None,
            Self::TabRender { duration_ms, .. } | Self::PortletExecution { duration_ms, .. } => {
                Some(*duration_ms)
            }
        }
    }
}

/// Processing state of a raw event in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventStatus {
    Pending = 0,
    Aggregated = 1,
    /// Consumed, but at least one of its buckets had already closed.
    Late = 2,
    /// Consumed without being counted: its timestamp or one of its buckets
    /// could not be resolved.
    Unaggregatable = 3,
}

impl EventStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Pending),
            1 => Some(Self::Aggregated),
            2 => Some(Self::Late),
            3 => Some(Self::Unaggregatable),
            _ => None,
        }
    }
}

/// Raw usage event as supplied by the durable event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Assigned by the event store on append; ignored on input.
    #[serde(default)]
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub subject: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub subject_groups: Vec<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Login session the event log tracks alongside raw events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSession {
    pub session_id: String,
    pub subject: String,
    pub last_accessed: DateTime<Utc>,
}

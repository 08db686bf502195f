//! Named cluster mutexes and entity locks.
//!
//! Two store contracts live here:
//! - [`MutexStore`]: one row per mutex name, owner plus expiry, acquired with a
//!   single atomic compare-and-set.
//! - [`EntityLockStore`]: shared/exclusive locks on `(entity_type, entity_key)`
//!   held by one or more owners.
//!
//! Expired rows are logically absent everywhere; stores purge them lazily or
//! through an explicit sweep.

pub mod memory;
pub mod service;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use self::service::{ClusterLockService, LockConfig, LockResult};

/// Errors raised by lock stores.
///
/// A storage failure is never reported as "not acquired": the caller cannot
/// know whether it holds the lock and must not proceed.
#[derive(Error, Debug)]
pub enum LockStoreError {
    #[error("lock store failure on {name}: {source}")]
    Storage {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid lock ttl {ttl:?} for {name}")]
    InvalidTtl { name: String, ttl: Duration },
}

impl LockStoreError {
    pub(crate) fn storage(name: impl Into<String>, source: impl Into<StoreError>) -> Self {
        Self::Storage {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Unique identity of this node, used as owner of every lock it takes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds an identity from the host name, process id and start time.
    /// Stable for the process lifetime and unique across restarts.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let nonce = Utc::now().timestamp_micros() & 0xff_ffff;
        Self(format!("{host}-{}-{nonce:06x}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named mutex row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexRecord {
    pub name: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl MutexRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Durable registry of named mutexes.
pub trait MutexStore: Send + Sync {
    /// Take `name` for `owner` if it is free, expired, or already ours.
    fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Extend the expiry. Only the current, unexpired owner succeeds.
    fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Drop ownership. A no-op when `owner` no longer holds `name`.
    fn release(&self, name: &str, owner: &str) -> Result<(), LockStoreError>;

    fn get(&self, name: &str) -> Result<Option<MutexRecord>, LockStoreError>;

    /// Physically remove expired rows. Returns the number removed.
    fn delete_expired(&self) -> Result<usize, LockStoreError>;
}

/// Lock mode of an [`EntityLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shared" => Some(Self::Shared),
            "exclusive" => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Whether a lock of this type may coexist with one of `other` held by a
    /// different owner.
    pub fn compatible_with(self, other: LockType) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

/// Lock on a single entity. Identity is `(entity_type, entity_key, lock_owner)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLock {
    pub entity_type: String,
    pub entity_key: String,
    pub lock_owner: String,
    pub lock_type: LockType,
    pub expires_at: DateTime<Utc>,
}

impl EntityLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if `other` (held by someone else) blocks this lock.
    pub fn conflicts_with(&self, other: &EntityLock, now: DateTime<Utc>) -> bool {
        !other.is_expired(now)
            && other.lock_owner != self.lock_owner
            && other.entity_type == self.entity_type
            && other.entity_key == self.entity_key
            && !self.lock_type.compatible_with(other.lock_type)
    }
}

/// Query filter for [`EntityLockStore::find`]. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockFilter {
    pub entity_type: Option<String>,
    pub entity_key: Option<String>,
    pub lock_type: Option<LockType>,
    pub owner: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl LockFilter {
    pub fn entity(entity_type: impl Into<String>, entity_key: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_key: Some(entity_key.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, lock: &EntityLock) -> bool {
        self.entity_type
            .as_deref()
            .map_or(true, |t| t == lock.entity_type)
            && self
                .entity_key
                .as_deref()
                .map_or(true, |k| k == lock.entity_key)
            && self.lock_type.map_or(true, |t| t == lock.lock_type)
            && self.owner.as_deref().map_or(true, |o| o == lock.lock_owner)
            && self.expiration.map_or(true, |e| e == lock.expires_at)
    }
}

/// Store of entity locks.
pub trait EntityLockStore: Send + Sync {
    /// Insert `lock` unless an unexpired conflicting lock from another owner
    /// exists. Replaces the caller's own previous lock on the same entity.
    fn add(&self, lock: &EntityLock) -> Result<bool, LockStoreError>;

    /// Change expiry (and optionally type) of an existing, unexpired lock.
    fn update(
        &self,
        lock: &EntityLock,
        new_expiration: DateTime<Utc>,
        new_type: Option<LockType>,
    ) -> Result<bool, LockStoreError>;

    fn delete(&self, lock: &EntityLock) -> Result<(), LockStoreError>;

    fn delete_all(&self) -> Result<(), LockStoreError>;

    fn delete_expired(&self) -> Result<usize, LockStoreError>;

    /// All locks matching `filter`, expired ones included.
    fn find(&self, filter: &LockFilter) -> Result<Vec<EntityLock>, LockStoreError>;

    /// Locks matching `filter` whose expiry lies after the store's `now`.
    fn find_unexpired(&self, filter: &LockFilter) -> Result<Vec<EntityLock>, LockStoreError>;
}

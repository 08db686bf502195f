//! In-process lock stores for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::{expiry, ProcessingClock};

use super::{EntityLock, EntityLockStore, LockFilter, LockStoreError, LockType, MutexRecord, MutexStore};

/// Mutex registry guarded by one critical section.
pub struct InMemoryMutexStore {
    clock: Arc<dyn ProcessingClock>,
    rows: Mutex<HashMap<String, MutexRecord>>,
}

impl InMemoryMutexStore {
    pub fn new(clock: Arc<dyn ProcessingClock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }
}

fn check_ttl(name: &str, ttl: Duration) -> Result<(), LockStoreError> {
    if ttl.is_zero() {
        return Err(LockStoreError::InvalidTtl {
            name: name.to_string(),
            ttl,
        });
    }
    Ok(())
}

impl MutexStore for InMemoryMutexStore {
    fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        check_ttl(name, ttl)?;
        let now = self.clock.now();
        let mut rows = self.rows.lock();

        if let Some(existing) = rows.get(name) {
            if !existing.is_expired(now) && existing.owner != owner {
                return Ok(false);
            }
        }

        rows.insert(
            name.to_string(),
            MutexRecord {
                name: name.to_string(),
                owner: owner.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        check_ttl(name, ttl)?;
        let now = self.clock.now();
        let mut rows = self.rows.lock();

        match rows.get_mut(name) {
            Some(row) if row.owner == owner && !row.is_expired(now) => {
                row.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, name: &str, owner: &str) -> Result<(), LockStoreError> {
        let mut rows = self.rows.lock();
        if rows.get(name).is_some_and(|row| row.owner == owner) {
            rows.remove(name);
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<MutexRecord>, LockStoreError> {
        Ok(self.rows.lock().get(name).cloned())
    }

    fn delete_expired(&self) -> Result<usize, LockStoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| !row.is_expired(now));
        Ok(before - rows.len())
    }
}

/// Locks of one entity type, keyed by `(entity_key, lock_owner)`.
#[derive(Default)]
struct LockArena {
    locks: HashMap<(String, String), EntityLock>,
}

impl LockArena {
    fn holders<'a>(&'a self, entity_key: &'a str) -> impl Iterator<Item = &'a EntityLock> + 'a {
        self.locks
            .values()
            .filter(move |l| l.entity_key == entity_key)
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, l| !l.is_expired(now));
        before - self.locks.len()
    }
}

/// Entity-lock store partitioned by entity type.
///
/// Each type owns an arena behind its own read-write lock, so every
/// operation on one type is atomic and unrelated types never contend.
/// Expired locks stay visible to [`find`](EntityLockStore::find) until a
/// write to the same arena or [`delete_expired`](EntityLockStore::delete_expired)
/// purges them.
pub struct InMemoryEntityLockStore {
    clock: Arc<dyn ProcessingClock>,
    arenas: DashMap<String, Arc<RwLock<LockArena>>>,
}

impl InMemoryEntityLockStore {
    pub fn new(clock: Arc<dyn ProcessingClock>) -> Self {
        Self {
            clock,
            arenas: DashMap::new(),
        }
    }

    fn arena(&self, entity_type: &str) -> Arc<RwLock<LockArena>> {
        if let Some(arena) = self.arenas.get(entity_type) {
            return arena.clone();
        }
        self.arenas
            .entry(entity_type.to_string())
            .or_default()
            .clone()
    }

    /// Arenas the filter can match, cloned out of the map so no shard lock
    /// is held while an arena is read.
    fn arenas_for(&self, filter: &LockFilter) -> Vec<Arc<RwLock<LockArena>>> {
        match filter.entity_type.as_deref() {
            Some(entity_type) => self
                .arenas
                .get(entity_type)
                .map(|a| vec![a.clone()])
                .unwrap_or_default(),
            None => self.arenas.iter().map(|a| a.value().clone()).collect(),
        }
    }

    fn collect(&self, filter: &LockFilter, unexpired_at: Option<DateTime<Utc>>) -> Vec<EntityLock> {
        let mut found: Vec<EntityLock> = self
            .arenas_for(filter)
            .into_iter()
            .flat_map(|arena| {
                let arena = arena.read();
                arena
                    .locks
                    .values()
                    .filter(|l| filter.matches(l))
                    .filter(|l| unexpired_at.map_or(true, |now| !l.is_expired(now)))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by(|a, b| {
            (&a.entity_type, &a.entity_key, &a.lock_owner).cmp(&(
                &b.entity_type,
                &b.entity_key,
                &b.lock_owner,
            ))
        });
        found
    }

    fn write(&self, candidate: &EntityLock, require_existing: bool) -> bool {
        let now = self.clock.now();
        if candidate.is_expired(now) {
            return false;
        }

        let arena = self.arena(&candidate.entity_type);
        let mut arena = arena.write();
        arena.purge_expired(now);

        let id = (candidate.entity_key.clone(), candidate.lock_owner.clone());
        if require_existing && !arena.locks.contains_key(&id) {
            return false;
        }
        if arena
            .holders(&candidate.entity_key)
            .any(|h| candidate.conflicts_with(h, now))
        {
            return false;
        }

        arena.locks.insert(id, candidate.clone());
        true
    }
}

impl EntityLockStore for InMemoryEntityLockStore {
    fn add(&self, lock: &EntityLock) -> Result<bool, LockStoreError> {
        Ok(self.write(lock, false))
    }

    fn update(
        &self,
        lock: &EntityLock,
        new_expiration: DateTime<Utc>,
        new_type: Option<LockType>,
    ) -> Result<bool, LockStoreError> {
        let updated = EntityLock {
            expires_at: new_expiration,
            lock_type: new_type.unwrap_or(lock.lock_type),
            ..lock.clone()
        };
        Ok(self.write(&updated, true))
    }

    fn delete(&self, lock: &EntityLock) -> Result<(), LockStoreError> {
        if let Some(arena) = self.arenas.get(&lock.entity_type).map(|a| a.clone()) {
            arena
                .write()
                .locks
                .remove(&(lock.entity_key.clone(), lock.lock_owner.clone()));
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), LockStoreError> {
        self.arenas.clear();
        Ok(())
    }

    fn delete_expired(&self) -> Result<usize, LockStoreError> {
        let now = self.clock.now();
        let arenas: Vec<_> = self.arenas.iter().map(|a| a.value().clone()).collect();
        Ok(arenas
            .into_iter()
            .map(|arena| arena.write().purge_expired(now))
            .sum())
    }

    fn find(&self, filter: &LockFilter) -> Result<Vec<EntityLock>, LockStoreError> {
        Ok(self.collect(filter, None))
    }

    fn find_unexpired(&self, filter: &LockFilter) -> Result<Vec<EntityLock>, LockStoreError> {
        Ok(self.collect(filter, Some(self.clock.now())))
    }
}

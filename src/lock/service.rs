//! Try-lock-and-run over a [`MutexStore`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{LockStoreError, MutexStore, ServerIdentity};

/// Expiry and renewal of cluster mutexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Lifetime of an acquired mutex without renewal.
    pub ttl: Duration,
    /// Renew the mutex at this period while work runs. `None` means the TTL
    /// must cover the whole run.
    pub renew_interval: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            renew_interval: None,
        }
    }
}

/// Outcome of [`ClusterLockService::do_under_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult<T> {
    /// Work ran. `lock_lost` is set when a renewal failed during the run, in
    /// which case exclusivity was not guaranteed for its whole duration.
    Executed { value: T, lock_lost: bool },
    /// Someone else held the mutex; work did not run.
    Skipped,
}

impl<T> LockResult<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Executed { value, .. } => Some(value),
            Self::Skipped => None,
        }
    }
}

/// Handle given to work running under a mutex.
#[derive(Debug)]
pub struct Lease {
    name: String,
    lost: AtomicBool,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a renewal has failed. Work should stop at the next safe
    /// point.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}

/// Runs units of work under cluster-wide named mutexes.
///
/// Acquisition is try-only. Every thread of a process shares one
/// [`ServerIdentity`], so a per-process registry of held names makes a
/// concurrent caller in the same process skip just like a caller on another
/// node.
pub struct ClusterLockService {
    store: Arc<dyn MutexStore>,
    identity: ServerIdentity,
    config: LockConfig,
    held: Mutex<HashSet<String>>,
}

/// Removes a name from the local registry when dropped.
struct LocalClaim<'a> {
    held: &'a Mutex<HashSet<String>>,
    name: &'a str,
}

impl Drop for LocalClaim<'_> {
    fn drop(&mut self) {
        self.held.lock().remove(self.name);
    }
}

/// Releases the store mutex when dropped, including during unwinding.
struct ReleaseGuard<'a> {
    store: &'a dyn MutexStore,
    name: &'a str,
    owner: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        match self.store.release(self.name, self.owner) {
            Ok(()) => debug!(lock = self.name, "cluster lock released"),
            Err(e) => warn!(
                lock = self.name,
                error = %e,
                "cluster lock release failed, it will expire via ttl",
            ),
        }
    }
}

impl ClusterLockService {
    pub fn new(store: Arc<dyn MutexStore>, identity: ServerIdentity, config: LockConfig) -> Self {
        Self {
            store,
            identity,
            config,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Runs `work` if `name` can be taken right now, otherwise skips.
    ///
    /// The mutex is released on every exit path. A storage failure while
    /// acquiring is returned as an error and `work` does not run.
    pub fn do_under_lock<T, F>(&self, name: &str, work: F) -> Result<LockResult<T>, LockStoreError>
    where
        F: FnOnce() -> T,
    {
        self.do_under_lease(name, |_| work())
    }

    /// Like [`do_under_lock`](Self::do_under_lock), but `work` can observe
    /// lease loss while it runs.
    pub fn do_under_lease<T, F>(
        &self,
        name: &str,
        work: F,
    ) -> Result<LockResult<T>, LockStoreError>
    where
        F: FnOnce(&Lease) -> T,
    {
        if !self.held.lock().insert(name.to_string()) {
            debug!(lock = name, "cluster lock busy in this process, skipping");
            return Ok(LockResult::Skipped);
        }
        let _claim = LocalClaim {
            held: &self.held,
            name,
        };

        let owner = self.identity.as_str();
        if !self.store.acquire(name, owner, self.config.ttl)? {
            debug!(lock = name, "cluster lock held elsewhere, skipping");
            return Ok(LockResult::Skipped);
        }
        let _release = ReleaseGuard {
            store: self.store.as_ref(),
            name,
            owner,
        };
        debug!(lock = name, owner, "cluster lock acquired");

        let lease = Lease {
            name: name.to_string(),
            lost: AtomicBool::new(false),
        };

        let value = match self.config.renew_interval {
            None => work(&lease),
            Some(interval) => thread::scope(|s| {
                let (stop_tx, stop_rx) = mpsc::channel::<()>();
                let lease_ref = &lease;
                s.spawn(move || self.renew_until_stopped(lease_ref, interval, stop_rx));

                // Dropping the sender (also on unwind) stops the renewer.
                let value = work(&lease);
                drop(stop_tx);
                value
            }),
        };

        Ok(LockResult::Executed {
            value,
            lock_lost: lease.is_lost(),
        })
    }

    /// Removes expired mutex rows.
    pub fn sweep_expired(&self) -> Result<usize, LockStoreError> {
        let removed = self.store.delete_expired()?;
        if removed > 0 {
            debug!(removed, "swept expired cluster locks");
        }
        Ok(removed)
    }

    fn renew_until_stopped(&self, lease: &Lease, interval: Duration, stop: mpsc::Receiver<()>) {
        loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }

            match self
                .store
                .renew(lease.name(), self.identity.as_str(), self.config.ttl)
            {
                Ok(true) => debug!(lock = lease.name(), "cluster lock renewed"),
                Ok(false) => {
                    warn!(lock = lease.name(), "cluster lock lost, another node took over");
                    lease.mark_lost();
                    return;
                }
                Err(e) => {
                    warn!(lock = lease.name(), error = %e, "cluster lock renewal failed");
                    lease.mark_lost();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::lock::memory::InMemoryMutexStore;
    use crate::lock::MutexRecord;
    use crate::store::StoreError;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ))
    }

    fn service(store: Arc<dyn MutexStore>, id: &str, config: LockConfig) -> ClusterLockService {
        ClusterLockService::new(store, ServerIdentity::new(id), config)
    }

    fn ttl(secs: u64) -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(secs),
            renew_interval: None,
        }
    }

    #[test]
    fn test_three_threads_one_executes() {
        let store: Arc<dyn MutexStore> = Arc::new(InMemoryMutexStore::new(manual_clock()));
        let svc = service(store, "node-a", ttl(60));
        let skipped = AtomicUsize::new(0);
        let executed = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let result = svc
                        .do_under_lock("aggregation", || {
                            executed.fetch_add(1, Ordering::SeqCst);
                            // Hold the lock until the other two have given up.
                            let deadline = Instant::now() + Duration::from_secs(5);
                            while skipped.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
                                thread::sleep(Duration::from_millis(1));
                            }
                        })
                        .unwrap();
                    if !result.is_executed() {
                        skipped.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(skipped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_other_node_skips_while_held() {
        let store: Arc<dyn MutexStore> = Arc::new(InMemoryMutexStore::new(manual_clock()));
        let a = service(store.clone(), "node-a", ttl(60));
        let b = service(store.clone(), "node-b", ttl(60));

        let result = a
            .do_under_lock("aggregation", || {
                b.do_under_lock("aggregation", || 0).unwrap()
            })
            .unwrap();
        assert_eq!(
            result,
            LockResult::Executed {
                value: LockResult::Skipped,
                lock_lost: false
            }
        );

        // Released afterwards, so b can run now.
        assert_eq!(
            b.do_under_lock("aggregation", || 7).unwrap().into_value(),
            Some(7)
        );
        assert!(store.get("aggregation").unwrap().is_none());
    }

    #[test]
    fn test_released_after_panic() {
        let store: Arc<dyn MutexStore> = Arc::new(InMemoryMutexStore::new(manual_clock()));
        let svc = service(store.clone(), "node-a", ttl(60));

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            svc.do_under_lock("aggregation", || panic!("work failed"))
        }));
        assert!(outcome.is_err());
        assert!(store.get("aggregation").unwrap().is_none());

        // Local registry was cleared too.
        assert!(svc.do_under_lock("aggregation", || ()).unwrap().is_executed());
    }

    #[test]
    fn test_expired_lock_taken_over_and_old_release_is_noop() {
        let clock = manual_clock();
        let store: Arc<dyn MutexStore> = Arc::new(InMemoryMutexStore::new(clock.clone()));
        let a = service(store.clone(), "node-a", ttl(30));

        a.do_under_lock("aggregation", || {
            clock.advance(ChronoDuration::seconds(31));
            assert!(store
                .acquire("aggregation", "node-b", Duration::from_secs(30))
                .unwrap());
        })
        .unwrap();

        assert_eq!(
            store.get("aggregation").unwrap().map(|r| r.owner),
            Some("node-b".to_string())
        );
    }

    #[test]
    fn test_renewal_keeps_lock_alive() {
        let store: Arc<dyn MutexStore> =
            Arc::new(InMemoryMutexStore::new(Arc::new(SystemClock)));
        let svc = service(
            store.clone(),
            "node-a",
            LockConfig {
                ttl: Duration::from_secs(5),
                renew_interval: Some(Duration::from_millis(5)),
            },
        );

        let result = svc
            .do_under_lease("aggregation", |lease| {
                thread::sleep(Duration::from_millis(40));
                lease.is_lost()
            })
            .unwrap();
        assert_eq!(
            result,
            LockResult::Executed {
                value: false,
                lock_lost: false
            }
        );
        assert!(store.get("aggregation").unwrap().is_none());
    }

    #[test]
    fn test_failed_renewal_marks_lock_lost() {
        let clock = manual_clock();
        let store: Arc<dyn MutexStore> = Arc::new(InMemoryMutexStore::new(clock.clone()));
        let svc = service(
            store.clone(),
            "node-a",
            LockConfig {
                ttl: Duration::from_secs(30),
                renew_interval: Some(Duration::from_millis(5)),
            },
        );

        let result = svc
            .do_under_lease("aggregation", |lease| {
                clock.advance(ChronoDuration::seconds(31));
                store
                    .acquire("aggregation", "node-b", Duration::from_secs(30))
                    .unwrap();
                let deadline = Instant::now() + Duration::from_secs(5);
                while !lease.is_lost() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();

        assert!(matches!(
            result,
            LockResult::Executed {
                lock_lost: true,
                ..
            }
        ));
        assert_eq!(
            store.get("aggregation").unwrap().map(|r| r.owner),
            Some("node-b".to_string())
        );
    }

    struct BrokenStore;

    impl MutexStore for BrokenStore {
        fn acquire(&self, name: &str, _: &str, _: Duration) -> Result<bool, LockStoreError> {
            Err(LockStoreError::storage(
                name,
                StoreError::Unavailable("disk gone".to_string()),
            ))
        }

        fn renew(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockStoreError> {
            Ok(false)
        }

        fn release(&self, _: &str, _: &str) -> Result<(), LockStoreError> {
            Ok(())
        }

        fn get(&self, _: &str) -> Result<Option<MutexRecord>, LockStoreError> {
            Ok(None)
        }

        fn delete_expired(&self) -> Result<usize, LockStoreError> {
            Ok(0)
        }
    }

    #[test]
    fn test_store_failure_is_an_error_not_a_skip() {
        let svc = service(Arc::new(BrokenStore), "node-a", ttl(60));
        let ran = AtomicBool::new(false);

        let err = svc
            .do_under_lock("aggregation", || ran.store(true, Ordering::SeqCst))
            .unwrap_err();
        assert!(matches!(err, LockStoreError::Storage { .. }));
        assert!(!ran.load(Ordering::SeqCst));

        // The local claim does not leak after the failure.
        assert!(svc.held.lock().is_empty());
    }

    #[test]
    fn test_sweep_expired() {
        let clock = manual_clock();
        let store: Arc<dyn MutexStore> = Arc::new(InMemoryMutexStore::new(clock.clone()));
        store.acquire("stale", "gone", Duration::from_secs(1)).unwrap();
        let svc = service(store, "node-a", ttl(60));

        assert_eq!(svc.sweep_expired().unwrap(), 0);
        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(svc.sweep_expired().unwrap(), 1);
    }
}

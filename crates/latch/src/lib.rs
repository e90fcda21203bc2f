//! The per-node reader/writer latch (§4.4).
//!
//! A latch is a short-term lock held only while traversing or mutating a
//! single node; it is distinct from a transaction-scoped row [`Lock`] (see
//! `fathom-txn`). Latches are unfair by design — favoring throughput over
//! strict FIFO ordering — except for the timed-trylock form used by the
//! checkpointer, which backs off instead of starving foreground operations.

use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

/// A reader/writer latch guarding `T`. Non-reentrant: re-acquiring from the
/// same thread that already holds the latch will deadlock, same as the
/// primitive it wraps.
pub struct Latch<T> {
    inner: RwLock<T>,
}

pub type SharedGuard<'a, T> = RwLockReadGuard<'a, T>;
pub type ExclusiveGuard<'a, T> = RwLockWriteGuard<'a, T>;
pub type UpgradableGuard<'a, T> = RwLockUpgradableReadGuard<'a, T>;

impl<T> Latch<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Block until a shared (read) latch is held.
    pub fn acquire_shared(&self) -> SharedGuard<'_, T> {
        self.inner.read()
    }

    /// Block until the exclusive (write) latch is held.
    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_, T> {
        self.inner.write()
    }

    /// Non-blocking attempt to acquire the exclusive latch.
    pub fn try_acquire_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.inner.try_write()
    }

    /// Non-blocking attempt to acquire the shared latch.
    pub fn try_acquire_shared(&self) -> Option<SharedGuard<'_, T>> {
        self.inner.try_read()
    }

    /// Attempt to acquire the exclusive latch, retrying with the given
    /// backoff schedule until `deadline` elapses. The checkpointer is the
    /// only caller that uses this form — everything else either blocks or
    /// tries once, so that a slow checkpoint cannot starve readers but also
    /// cannot be starved indefinitely by a stream of short operations.
    pub fn try_acquire_exclusive_timed(&self, timeout: Duration) -> Option<ExclusiveGuard<'_, T>> {
        self.inner.try_write_for(timeout)
    }

    /// Acquire an upgradable-read latch: compatible with other shared
    /// readers, but at most one upgradable holder at a time, and it can be
    /// promoted to exclusive without releasing and re-acquiring.
    pub fn acquire_upgradable(&self) -> UpgradableGuard<'_, T> {
        self.inner.upgradable_read()
    }

    /// Downgrade an exclusive guard to shared without ever releasing the
    /// latch — no other writer can observe the node mid-transition.
    pub fn downgrade(guard: ExclusiveGuard<'_, T>) -> SharedGuard<'_, T> {
        RwLockWriteGuard::downgrade(guard)
    }

    /// Promote an upgradable guard to exclusive, blocking until possible.
    pub fn upgrade(guard: UpgradableGuard<'_, T>) -> ExclusiveGuard<'_, T> {
        RwLockUpgradableReadGuard::upgrade(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_readers_do_not_block_each_other() {
        let latch = Arc::new(Latch::new(42));
        let a = latch.acquire_shared();
        let b = latch.acquire_shared();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
    }

    #[test]
    fn exclusive_excludes_shared() {
        let latch = Arc::new(Latch::new(0));
        let mut guard = latch.acquire_exclusive();
        *guard += 1;
        assert!(latch.try_acquire_shared().is_none());
        drop(guard);
        assert!(latch.try_acquire_shared().is_some());
    }

    #[test]
    fn downgrade_keeps_value_visible_without_gap() {
        let latch = Latch::new(vec![1, 2, 3]);
        let mut w = latch.acquire_exclusive();
        w.push(4);
        let r = Latch::downgrade(w);
        assert_eq!(&*r, &[1, 2, 3, 4]);
    }

    #[test]
    fn try_acquire_exclusive_timed_backs_off() {
        let latch = Arc::new(Latch::new(0));
        let _reader = latch.acquire_shared();
        let start = std::time::Instant::now();
        let attempt = latch.try_acquire_exclusive_timed(Duration::from_millis(20));
        assert!(attempt.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn concurrent_writers_serialize() {
        let latch = Arc::new(Latch::new(0u64));
        let mut handles = vec![];
        for _ in 0..8 {
            let latch = latch.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *latch.acquire_exclusive() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*latch.acquire_shared(), 8000);
    }

    #[test]
    fn upgrade_from_upgradable_excludes_new_readers() {
        let latch = Latch::new(10);
        let upgradable = latch.acquire_upgradable();
        assert!(latch.try_acquire_shared().is_some());
        let mut exclusive = Latch::upgrade(upgradable);
        *exclusive += 1;
        assert_eq!(*exclusive, 11);
    }
}

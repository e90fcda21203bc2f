//! Row-level key locking (§4.8): a concurrent table of locks keyed by
//! `(index_id, key)`, with shared/upgradable/exclusive modes and FIFO
//! timeout waits instead of cycle-detected deadlock avoidance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use fathom_common::{Error, LockKey, LockTimeout, Result, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Upgradable,
    Exclusive,
}

struct KeyLock {
    shared: Vec<TxnId>,
    upgradable: Option<TxnId>,
    exclusive: Option<TxnId>,
    waiters: usize,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            shared: Vec::new(),
            upgradable: None,
            exclusive: None,
            waiters: 0,
        }
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.upgradable.is_none() && self.exclusive.is_none()
    }

    fn compatible(&self, txn: TxnId, mode: Mode) -> bool {
        match mode {
            Mode::Shared => self.exclusive.is_none() || self.exclusive == Some(txn),
            Mode::Upgradable => {
                (self.upgradable.is_none() || self.upgradable == Some(txn))
                    && (self.exclusive.is_none() || self.exclusive == Some(txn))
            }
            Mode::Exclusive => {
                self.exclusive == Some(txn)
                    || (self.exclusive.is_none()
                        && (self.shared.is_empty() || (self.shared.len() == 1 && self.shared[0] == txn))
                        && (self.upgradable.is_none() || self.upgradable == Some(txn)))
            }
        }
    }

    fn grant(&mut self, txn: TxnId, mode: Mode) {
        match mode {
            Mode::Shared => {
                if !self.shared.contains(&txn) {
                    self.shared.push(txn);
                }
            }
            Mode::Upgradable => self.upgradable = Some(txn),
            Mode::Exclusive => {
                self.shared.retain(|t| *t != txn);
                self.upgradable = None;
                self.exclusive = Some(txn);
            }
        }
    }

    fn release(&mut self, txn: TxnId) {
        self.shared.retain(|t| *t != txn);
        if self.upgradable == Some(txn) {
            self.upgradable = None;
        }
        if self.exclusive == Some(txn) {
            self.exclusive = None;
        }
    }
}

struct Slot {
    lock: Mutex<KeyLock>,
    cv: Condvar,
}

/// The process-wide lock table. One [`LockManager`] is shared by every
/// transaction opened against a [`crate::transaction::Transaction`]'s
/// database.
pub struct LockManager {
    table: Mutex<HashMap<LockKey, Arc<Slot>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    fn slot_for(&self, key: &LockKey) -> Arc<Slot> {
        let mut table = self.table.lock();
        table
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    lock: Mutex::new(KeyLock::new()),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    /// Acquire `mode` on `key` for `txn`, waiting up to `timeout`
    /// (negative = infinite, zero = try-only, per §4.8).
    pub fn acquire(&self, txn: TxnId, key: &LockKey, mode: Mode, timeout: LockTimeout) -> Result<()> {
        let slot = self.slot_for(key);
        let deadline = if timeout.is_infinite() {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout.0.max(0) as u64))
        };

        let mut guard = slot.lock.lock();
        loop {
            if guard.compatible(txn, mode) {
                guard.grant(txn, mode);
                return Ok(());
            }
            if timeout.is_try_only() {
                return Err(Error::LockTimeout(key.clone()));
            }
            guard.waiters += 1;
            let timed_out = match deadline {
                None => {
                    slot.cv.wait(&mut guard);
                    false
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        true
                    } else {
                        slot.cv.wait_for(&mut guard, d - now).timed_out()
                    }
                }
            };
            guard.waiters -= 1;
            if timed_out && !guard.compatible(txn, mode) {
                return Err(Error::LockTimeout(key.clone()));
            }
        }
    }

    /// Promote an already-held upgradable lock to exclusive. Lock-free when
    /// no other shared readers remain; otherwise waits for them to drain.
    pub fn upgrade(&self, txn: TxnId, key: &LockKey, timeout: LockTimeout) -> Result<()> {
        self.acquire(txn, key, Mode::Exclusive, timeout)
    }

    pub fn release(&self, txn: TxnId, key: &LockKey) {
        let slot = self.slot_for(key);
        {
            let mut guard = slot.lock.lock();
            guard.release(txn);
        }
        slot.cv.notify_all();
    }

    pub fn release_all(&self, txn: TxnId, keys: &[LockKey]) {
        for key in keys {
            self.release(txn, key);
        }
    }

    /// Drop table entries for keys nobody holds or waits on, so the table
    /// does not grow without bound across the database's lifetime.
    pub fn gc(&self) {
        let mut table = self.table.lock();
        table.retain(|_, slot| {
            let guard = slot.lock.lock();
            !guard.is_free() || guard.waiters > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> LockKey {
        LockKey {
            index_id: 1,
            key: k.as_bytes().to_vec(),
        }
    }

    #[test]
    fn shared_locks_are_compatible() {
        let lm = LockManager::new();
        lm.acquire(1, &key("a"), Mode::Shared, LockTimeout::INFINITE).unwrap();
        lm.acquire(2, &key("a"), Mode::Shared, LockTimeout::INFINITE).unwrap();
    }

    #[test]
    fn exclusive_excludes_shared() {
        let lm = LockManager::new();
        lm.acquire(1, &key("a"), Mode::Exclusive, LockTimeout::INFINITE).unwrap();
        let result = lm.acquire(2, &key("a"), Mode::Shared, LockTimeout::TRY_ONLY);
        assert!(matches!(result, Err(Error::LockTimeout(_))));
    }

    #[test]
    fn release_unblocks_waiters() {
        let lm = LockManager::new();
        lm.acquire(1, &key("a"), Mode::Exclusive, LockTimeout::INFINITE).unwrap();
        lm.release(1, &key("a"));
        lm.acquire(2, &key("a"), Mode::Exclusive, LockTimeout::TRY_ONLY).unwrap();
    }

    #[test]
    fn second_upgradable_acquisition_times_out() {
        let lm = LockManager::new();
        lm.acquire(1, &key("a"), Mode::Upgradable, LockTimeout::INFINITE).unwrap();
        let result = lm.acquire(2, &key("a"), Mode::Upgradable, LockTimeout::TRY_ONLY);
        assert!(result.is_err());
    }

    #[test]
    fn upgrade_waits_for_shared_readers_to_drain() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, &key("a"), Mode::Upgradable, LockTimeout::INFINITE).unwrap();
        lm.acquire(2, &key("a"), Mode::Shared, LockTimeout::INFINITE).unwrap();

        assert!(lm.upgrade(1, &key("a"), LockTimeout::TRY_ONLY).is_err());
        lm.release(2, &key("a"));
        lm.upgrade(1, &key("a"), LockTimeout::TRY_ONLY).unwrap();
    }
}

//! A thin wrapper around [`fathom_txn::Transaction`] that holds the page
//! device's shared commit latch for the duration of every mutating call.
//!
//! `fathom-txn` and `fathom-btree` know nothing about the database-level
//! commit latch, so without this wrapper a checkpoint's exclusive acquire
//! (§4.12 step 1) would only serialize against other checkpoints, not
//! against an in-flight write whose epoch read happens just before the
//! toggle. Wrapping every mutating call closes that window without
//! touching the lower crates.

use std::sync::Arc;

use parking_lot::Mutex;

use fathom_common::{DurabilityMode, IndexId, LockMode, LockTimeout, Result, TxnId};
use fathom_txn::Transaction;

use crate::database::Database;

pub struct Txn {
    db: Arc<Database>,
    inner: Arc<Mutex<Transaction>>,
    handle: u64,
}

impl Txn {
    pub(crate) fn new(db: Arc<Database>, inner: Arc<Mutex<Transaction>>, handle: u64) -> Self {
        Self { db, inner, handle }
    }

    pub fn id(&self) -> Option<TxnId> {
        self.inner.lock().id()
    }

    pub fn set_durability_mode(&self, mode: DurabilityMode) {
        self.inner.lock().set_durability_mode(mode);
    }

    pub fn set_lock_mode(&self, mode: LockMode) {
        self.inner.lock().set_lock_mode(mode);
    }

    pub fn set_lock_timeout(&self, timeout: LockTimeout) {
        self.inner.lock().set_lock_timeout(timeout);
    }

    /// Open a nested scope (savepoint).
    pub fn enter(&self) {
        self.inner.lock().enter();
    }

    /// Roll back to the most recently entered open scope.
    pub fn exit(&self) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().exit()
    }

    /// Roll back every open scope and release all locks.
    pub fn exit_all(&self) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().exit_all()
    }

    pub fn commit(&self) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().commit()
    }

    /// Roll everything back and forget this transaction's id, so it can be
    /// reused for a new unit of work without allocating a fresh handle.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().reset()
    }

    pub fn insert(&self, index_id: IndexId, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().insert(index_id, key, value)
    }

    pub fn delete(&self, index_id: IndexId, key: &[u8]) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().delete(index_id, key)
    }

    pub fn store(&self, index_id: IndexId, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let _guard = self.db.device.shared_commit_guard();
        self.inner.lock().store(index_id, key, value)
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.db.active_txns.lock().remove(&self.handle);
    }
}

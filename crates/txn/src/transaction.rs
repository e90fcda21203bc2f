//! User-facing transactions (§4.9, §4.11): a durability mode, a lock mode,
//! an owned undo log, and a stack of nested scopes (savepoints).
//!
//! A transaction id is assigned lazily, on the first write the transaction
//! makes, so a long-lived read-only transaction never shows up in the redo
//! stream at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fathom_common::{
    DurabilityMode, Error, IndexId, LockKey, LockMode, LockTimeout, Lsn, RedoOp, Result, TxnId,
    UndoOp,
};

use crate::lock::{LockManager, Mode as LockKind};
use crate::undo::{IndexResolver, UndoLog};
use fathom_btree::{Cursor, Tree};

/// Where a transaction's redo records go. Kept as a trait so this crate does
/// not need a hard dependency on the log-file implementation.
pub trait RedoSink: Send + Sync {
    fn append(&self, op: RedoOp) -> Result<Lsn>;
    fn sync(&self, mode: DurabilityMode) -> Result<()>;
}

/// Hands out sequential ids from a shared counter. Used both for
/// transaction ids and for fragmented-value trash keys, which just need to
/// be unique and monotonically increasing within the process.
#[derive(Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The last value handed out, without advancing the counter. Used by
    /// the checkpointer to persist `next_txn_id` in the header.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub type TxnIdAllocator = IdAllocator;

struct HeldLock {
    key: LockKey,
}

pub struct Transaction {
    txn_id: Option<TxnId>,
    ids: Arc<IdAllocator>,
    trash_ids: Arc<IdAllocator>,
    durability: DurabilityMode,
    lock_mode: LockMode,
    lock_timeout: LockTimeout,
    locks: Arc<LockManager>,
    resolver: Arc<dyn IndexResolver>,
    redo: Arc<dyn RedoSink>,
    trash: Arc<Tree>,
    undo: UndoLog,
    /// Undo-log marks for each open scope, innermost last. The outermost
    /// (top-level transaction) scope is implicit and not pushed here.
    scopes: Vec<usize>,
    held_locks: Vec<HeldLock>,
}

impl Transaction {
    pub fn new(
        ids: Arc<IdAllocator>,
        trash_ids: Arc<IdAllocator>,
        locks: Arc<LockManager>,
        resolver: Arc<dyn IndexResolver>,
        redo: Arc<dyn RedoSink>,
        trash: Arc<Tree>,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            txn_id: None,
            ids,
            trash_ids,
            durability: DurabilityMode::default(),
            lock_mode,
            lock_timeout: LockTimeout::default(),
            locks,
            resolver,
            redo,
            trash,
            undo: UndoLog::new(),
            scopes: Vec::new(),
            held_locks: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<TxnId> {
        self.txn_id
    }

    /// Pending undo entries in push order, without consuming them. Used by
    /// the checkpointer to fold a still-open transaction's writes into the
    /// master undo log (§4.9, §4.12 step 2).
    pub fn undo_entries(&self) -> &[UndoOp] {
        self.undo.entries()
    }

    pub fn set_durability_mode(&mut self, mode: DurabilityMode) {
        self.durability = mode;
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    pub fn set_lock_timeout(&mut self, timeout: LockTimeout) {
        self.lock_timeout = timeout;
    }

    /// Assigns a txn id and writes the `TxnEnter` redo record on first use;
    /// a no-op on every subsequent call.
    fn ensure_started(&mut self) -> Result<TxnId> {
        if let Some(id) = self.txn_id {
            return Ok(id);
        }
        let id = self.ids.next();
        self.redo.append(RedoOp::TxnEnter { txn_id: id })?;
        self.txn_id = Some(id);
        Ok(id)
    }

    /// Push a new nested scope (savepoint). `exit` rolls back to the most
    /// recently entered scope that has not yet been exited.
    pub fn enter(&mut self) {
        self.scopes.push(self.undo.mark());
    }

    /// Roll back everything since the innermost open scope and pop it. At
    /// the outermost level this rolls back the whole transaction, matching
    /// `commit`'s absence making rollback the default outcome.
    pub fn exit(&mut self) -> Result<()> {
        let mark = self.scopes.pop().unwrap_or(0);
        self.rollback_to(mark)
    }

    /// Roll back every open scope, innermost to outermost, then release all
    /// locks this transaction is holding.
    pub fn exit_all(&mut self) -> Result<()> {
        while !self.scopes.is_empty() {
            self.exit()?;
        }
        self.rollback_to(0)?;
        self.release_locks();
        Ok(())
    }

    fn rollback_to(&mut self, mark: usize) -> Result<()> {
        if let Some(txn_id) = self.txn_id {
            self.undo.rollback_to(mark, self.resolver.as_ref(), &self.trash)?;
            if mark == 0 {
                self.redo.append(RedoOp::TxnRollback { txn_id })?;
            }
        } else {
            self.undo.truncate_to(mark);
        }
        Ok(())
    }

    /// Commit the outermost scope: discard the undo log (nothing left to
    /// roll back to) and, if this transaction ever wrote anything, append
    /// the commit record and release its locks.
    pub fn commit(&mut self) -> Result<()> {
        if !self.scopes.is_empty() {
            // Committing while nested scopes remain open folds them into
            // the parent scope rather than discarding their undo records.
            self.scopes.clear();
        }
        self.undo.truncate_to(0);
        if let Some(txn_id) = self.txn_id {
            self.redo.append(RedoOp::TxnCommit { txn_id })?;
            self.redo.sync(self.durability)?;
            self.redo.append(RedoOp::TxnCommitFinal { txn_id })?;
        }
        self.release_locks();
        Ok(())
    }

    /// Reset a transaction for reuse: roll everything back, release locks,
    /// and forget its assigned id so the next write gets a fresh one.
    pub fn reset(&mut self) -> Result<()> {
        self.exit_all()?;
        self.txn_id = None;
        Ok(())
    }

    fn release_locks(&mut self) {
        if let Some(txn_id) = self.txn_id {
            for held in self.held_locks.drain(..) {
                self.locks.release(txn_id, &held.key);
            }
        } else {
            self.held_locks.clear();
        }
    }

    fn lock_key(&mut self, txn_id: TxnId, key: LockKey, mode: LockKind) -> Result<()> {
        self.locks.acquire(txn_id, &key, mode, self.lock_timeout)?;
        self.held_locks.push(HeldLock { key });
        Ok(())
    }

    fn write_mode(&self) -> LockKind {
        match self.lock_mode {
            LockMode::Unsafe => LockKind::Shared,
            _ => LockKind::Exclusive,
        }
    }

    /// Insert or update `key` in `index_id`. Follows lock → redo → tree →
    /// undo ordering (§4.11) so a crash after the redo record but before
    /// the tree mutation still replays correctly.
    pub fn store(&mut self, index_id: IndexId, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let txn_id = self.ensure_started()?;
        self.lock_key(txn_id, LockKey::new(index_id, key), self.write_mode())?;

        self.redo.append(RedoOp::TxnStore {
            txn_id,
            index_id,
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        })?;

        let tree = self
            .resolver
            .tree(index_id)
            .ok_or_else(|| Error::CorruptDatabase(format!("unknown index {index_id}")))?;
        let mut cursor = Cursor::new(tree);
        let found = cursor.find(key)?;

        match value {
            None => {
                if found {
                    let raw = cursor.remove_without_freeing()?;
                    if fathom_btree::frag::is_fragmented(&raw) {
                        let trash_id = self.stage_fragment_in_trash(&raw)?;
                        self.undo.push(UndoOp::DeletedFragmentedCopy {
                            index_id,
                            key: key.to_vec(),
                            trash_id,
                        });
                        self.redo.append(RedoOp::TxnTrashFragmented { txn_id, trash_id })?;
                    } else {
                        self.undo.push(UndoOp::UpdatedOldValue {
                            index_id,
                            key: key.to_vec(),
                            old_value: raw[1..].to_vec(),
                        });
                    }
                }
            }
            Some(new_value) => {
                if found {
                    let old = cursor
                        .store_without_freeing(new_value)?
                        .expect("found position always yields an overwritten value");
                    if fathom_btree::frag::is_fragmented(&old) {
                        let trash_id = self.stage_fragment_in_trash(&old)?;
                        self.undo.push(UndoOp::DeletedFragmentedCopy {
                            index_id,
                            key: key.to_vec(),
                            trash_id,
                        });
                        self.redo.append(RedoOp::TxnTrashFragmented { txn_id, trash_id })?;
                    } else {
                        self.undo.push(UndoOp::UpdatedOldValue {
                            index_id,
                            key: key.to_vec(),
                            old_value: old[1..].to_vec(),
                        });
                    }
                } else {
                    cursor.store(Some(new_value))?;
                    self.undo.push(UndoOp::InsertedEntry {
                        index_id,
                        key: key.to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, index_id: IndexId, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(index_id, key, Some(value))
    }

    pub fn delete(&mut self, index_id: IndexId, key: &[u8]) -> Result<()> {
        self.store(index_id, key, None)
    }

    fn stage_fragment_in_trash(&mut self, descriptor: &[u8]) -> Result<u64> {
        let trash_id = self.trash_ids.next();
        let trash_key = trash_id.to_be_bytes();
        let mut trash_cursor = Cursor::new(self.trash.clone());
        trash_cursor.find(&trash_key)?;
        trash_cursor.store_raw(descriptor)?;
        Ok(trash_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use fathom_common::FIRST_ALLOCATABLE_PAGE;
    use fathom_pagestore::{NodeCache, PageDevice, PageManager};
    use parking_lot::Mutex as PLMutex;
    use tempfile::TempDir;

    struct TestResolver {
        trees: HashMap<IndexId, Arc<Tree>>,
    }

    impl IndexResolver for TestResolver {
        fn tree(&self, index_id: IndexId) -> Option<Arc<Tree>> {
            self.trees.get(&index_id).cloned()
        }
    }

    #[derive(Default)]
    struct RecordingRedoSink {
        ops: StdMutex<Vec<RedoOp>>,
    }

    impl RedoSink for RecordingRedoSink {
        fn append(&self, op: RedoOp) -> Result<Lsn> {
            let mut ops = self.ops.lock().unwrap();
            ops.push(op);
            Ok(ops.len() as Lsn)
        }

        fn sync(&self, _mode: DurabilityMode) -> Result<()> {
            Ok(())
        }
    }

    const DATA_INDEX_ID: IndexId = 16;

    fn fixture(page_size: usize) -> (TempDir, Arc<Tree>, Arc<Tree>, Arc<TestResolver>, Arc<RecordingRedoSink>) {
        let dir = tempfile::tempdir().unwrap();
        let (device, _header) = PageDevice::open(&dir.path().join("t.db"), page_size).unwrap();
        let device = Arc::new(device);
        let cache = Arc::new(NodeCache::new(device.clone(), 64));
        let pager: Arc<PLMutex<dyn fathom_btree::Pager + Send>> =
            Arc::new(PLMutex::new(PageManager::new(FIRST_ALLOCATABLE_PAGE)));

        let epoch = Arc::new(std::sync::atomic::AtomicU8::new(0));
        let data_tree = Arc::new(Tree::new(
            DATA_INDEX_ID,
            device.clone(),
            cache.clone(),
            pager.clone(),
            epoch.clone(),
            0,
        ));
        data_tree.create_empty().unwrap();
        let trash_tree = Arc::new(Tree::new(
            fathom_common::FRAGMENTED_TRASH_INDEX_ID,
            device,
            cache,
            pager,
            epoch,
            0,
        ));
        trash_tree.create_empty().unwrap();

        let mut trees = HashMap::new();
        trees.insert(DATA_INDEX_ID, data_tree.clone());
        let resolver = Arc::new(TestResolver { trees });
        let redo = Arc::new(RecordingRedoSink::default());
        (dir, data_tree, trash_tree, resolver, redo)
    }

    fn new_txn(
        resolver: Arc<TestResolver>,
        redo: Arc<RecordingRedoSink>,
        trash: Arc<Tree>,
    ) -> Transaction {
        Transaction::new(
            Arc::new(IdAllocator::new(0)),
            Arc::new(IdAllocator::new(0)),
            Arc::new(LockManager::new()),
            resolver,
            redo,
            trash,
            LockMode::UpgradableRead,
        )
    }

    fn get(tree: &Arc<Tree>, key: &[u8]) -> Option<Vec<u8>> {
        let mut cursor = Cursor::new(tree.clone());
        if cursor.find(key).unwrap() {
            Some(cursor.get_value().unwrap())
        } else {
            None
        }
    }

    #[test]
    fn insert_is_visible_through_a_plain_cursor() {
        let (_dir, data, _trash, resolver, redo) = fixture(512);
        let mut txn = new_txn(resolver, redo, _trash);
        txn.insert(DATA_INDEX_ID, b"a", b"1").unwrap();
        txn.commit().unwrap();
        assert_eq!(get(&data, b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn rollback_undoes_insert() {
        let (_dir, data, trash, resolver, redo) = fixture(512);
        let mut txn = new_txn(resolver, redo, trash);
        txn.insert(DATA_INDEX_ID, b"a", b"1").unwrap();
        txn.exit_all().unwrap();
        assert_eq!(get(&data, b"a"), None);
    }

    #[test]
    fn rollback_restores_overwritten_value() {
        let (_dir, data, trash, resolver, redo) = fixture(512);
        let mut txn = new_txn(resolver.clone(), redo.clone(), trash.clone());
        txn.insert(DATA_INDEX_ID, b"a", b"1").unwrap();
        txn.commit().unwrap();

        let mut txn = new_txn(resolver, redo, trash);
        txn.insert(DATA_INDEX_ID, b"a", b"2").unwrap();
        assert_eq!(get(&data, b"a"), Some(b"2".to_vec()));
        txn.exit_all().unwrap();
        assert_eq!(get(&data, b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn rollback_resurrects_fragmented_delete_without_rereading_trash() {
        let (_dir, data, trash, resolver, redo) = fixture(512);
        let big_value = vec![9u8; 4000];

        let mut txn = new_txn(resolver.clone(), redo.clone(), trash.clone());
        txn.insert(DATA_INDEX_ID, b"big", &big_value).unwrap();
        txn.commit().unwrap();

        let mut txn = new_txn(resolver, redo, trash.clone());
        txn.delete(DATA_INDEX_ID, b"big").unwrap();
        assert_eq!(get(&data, b"big"), None);
        txn.exit_all().unwrap();

        assert_eq!(get(&data, b"big"), Some(big_value));
        // The trash entry (trash id 1, this transaction's first) was
        // consumed by rollback, not left behind.
        assert_eq!(get(&trash, &1u64.to_be_bytes()), None);
    }

    #[test]
    fn nested_scope_rollback_only_undoes_inner_writes() {
        let (_dir, data, trash, resolver, redo) = fixture(512);
        let mut txn = new_txn(resolver, redo, trash);
        txn.insert(DATA_INDEX_ID, b"outer", b"kept").unwrap();
        txn.enter();
        txn.insert(DATA_INDEX_ID, b"inner", b"undone").unwrap();
        txn.exit().unwrap();

        assert_eq!(get(&data, b"outer"), Some(b"kept".to_vec()));
        assert_eq!(get(&data, b"inner"), None);
    }
}

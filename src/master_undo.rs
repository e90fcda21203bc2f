//! Checkpoint-time serialization of every still-open transaction's undo
//! entries into a dedicated tree (§4.9, §4.12 step 2).
//!
//! A checkpoint flushes every dirty page in the epoch being retired,
//! including pages an in-flight (uncommitted) transaction has already
//! written. If the process then crashes before that transaction commits or
//! rolls back, recovery has no redo record marking those writes committed —
//! the master undo log is what lets recovery undo them directly against the
//! now-durable tree state. Rebuilt from scratch on every checkpoint; the
//! previous master-undo tree's pages are not reclaimed (see DESIGN.md).

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use parking_lot::Mutex as PLMutex;

use fathom_btree::free::Pager;
use fathom_btree::{Cursor, Tree};
use fathom_common::{Error, MASTER_UNDO_INDEX_ID, PageId, Result, TxnId, UndoOp};
use fathom_pagestore::{NodeCache, PageDevice};

fn entry_key(txn_id: TxnId, seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    key.extend_from_slice(&txn_id.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_key(bytes: &[u8]) -> Result<(TxnId, u32)> {
    if bytes.len() != 12 {
        return Err(Error::CorruptDatabase("malformed master-undo key".into()));
    }
    let txn_id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let seq = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    Ok((txn_id, seq))
}

/// Build a fresh master-undo tree from `entries` (one `(txn_id, ops)` pair
/// per still-open transaction, ops in push order), returning its root page.
/// Returns `0` — meaning "no master undo this checkpoint" — when `entries`
/// is empty, so the header need not carry a dangling root.
pub fn build(
    device: Arc<PageDevice>,
    cache: Arc<NodeCache>,
    pager: Arc<PLMutex<dyn Pager + Send>>,
    epoch: Arc<AtomicU8>,
    entries: &[(TxnId, Vec<UndoOp>)],
) -> Result<PageId> {
    if entries.iter().all(|(_, ops)| ops.is_empty()) {
        return Ok(0);
    }

    let tree = Tree::new(MASTER_UNDO_INDEX_ID, device, cache, pager, epoch, 0);
    tree.create_empty()?;
    let tree = Arc::new(tree);

    for (txn_id, ops) in entries {
        for (seq, op) in ops.iter().enumerate() {
            let key = entry_key(*txn_id, seq as u32);
            let value = serde_json::to_vec(op)
                .map_err(|e| Error::CorruptDatabase(format!("failed to encode undo entry: {e}")))?;
            let mut cursor = Cursor::new(tree.clone());
            cursor.find(&key)?;
            cursor.store(Some(&value))?;
        }
    }

    Ok(tree.root_id())
}

/// Read back every entry in the master-undo tree rooted at `root`, grouped
/// by transaction id in push order — ready to be replayed through a fresh
/// [`fathom_txn::undo::UndoLog`] during recovery.
pub fn read_all(
    device: Arc<PageDevice>,
    cache: Arc<NodeCache>,
    pager: Arc<PLMutex<dyn Pager + Send>>,
    epoch: Arc<AtomicU8>,
    root: PageId,
) -> Result<Vec<(TxnId, Vec<UndoOp>)>> {
    let tree = Arc::new(Tree::new(MASTER_UNDO_INDEX_ID, device, cache, pager, epoch, root));
    let mut cursor = Cursor::new(tree);
    cursor.first()?;

    let mut grouped: BTreeMap<TxnId, Vec<UndoOp>> = BTreeMap::new();
    while cursor.is_positioned() {
        let (txn_id, _seq) = decode_key(&cursor.get_key()?)?;
        let op: UndoOp = serde_json::from_slice(&cursor.get_value()?)
            .map_err(|e| Error::CorruptDatabase(format!("failed to decode undo entry: {e}")))?;
        grouped.entry(txn_id).or_default().push(op);
        if !cursor.next()? {
            break;
        }
    }
    Ok(grouped.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_common::FIRST_ALLOCATABLE_PAGE;
    use fathom_pagestore::PageManager;
    use std::sync::atomic::AtomicU8 as StdAtomicU8;

    fn harness() -> (tempfile::TempDir, Arc<PageDevice>, Arc<NodeCache>, Arc<PLMutex<dyn Pager + Send>>, Arc<StdAtomicU8>) {
        let dir = tempfile::tempdir().unwrap();
        let (device, _header) = PageDevice::open(&dir.path().join("t.db"), 512).unwrap();
        let device = Arc::new(device);
        let cache = Arc::new(NodeCache::new(device.clone(), 64));
        let pager: Arc<PLMutex<dyn Pager + Send>> =
            Arc::new(PLMutex::new(PageManager::new(FIRST_ALLOCATABLE_PAGE)));
        let epoch = Arc::new(StdAtomicU8::new(0));
        (dir, device, cache, pager, epoch)
    }

    #[test]
    fn empty_entries_yield_no_root() {
        let (_dir, device, cache, pager, epoch) = harness();
        let root = build(device, cache, pager, epoch, &[]).unwrap();
        assert_eq!(root, 0);
    }

    #[test]
    fn round_trips_multiple_transactions() {
        let (_dir, device, cache, pager, epoch) = harness();
        let entries = vec![
            (
                1u64,
                vec![UndoOp::InsertedEntry {
                    index_id: 16,
                    key: b"a".to_vec(),
                }],
            ),
            (
                2u64,
                vec![
                    UndoOp::InsertedEntry {
                        index_id: 16,
                        key: b"b".to_vec(),
                    },
                    UndoOp::UpdatedOldValue {
                        index_id: 16,
                        key: b"c".to_vec(),
                        old_value: b"old".to_vec(),
                    },
                ],
            ),
        ];
        let root = build(device.clone(), cache.clone(), pager.clone(), epoch.clone(), &entries).unwrap();
        assert_ne!(root, 0);

        let read_back = read_all(device, cache, pager, epoch, root).unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].0, 1);
        assert_eq!(read_back[1].1.len(), 2);
    }
}

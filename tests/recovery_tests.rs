//! Crash recovery: reopen a database without a clean checkpoint and confirm
//! the redo log brings committed writes back.

use fathom::{Database, DatabaseConfig, DurabilityMode};
use fathom_btree::Cursor;

#[test]
fn recovers_committed_writes_across_an_unclean_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recover");

    {
        let db = Database::open(DatabaseConfig::new(&path)).unwrap();
        let index = db.open_index("t1").unwrap();

        let txn = db.new_transaction().unwrap();
        txn.set_durability_mode(DurabilityMode::Sync);
        txn.insert(index.index_id, b"a", b"1").unwrap();
        txn.insert(index.index_id, b"b", b"2").unwrap();
        txn.commit().unwrap();

        db.checkpoint().unwrap();

        let txn = db.new_transaction().unwrap();
        txn.set_durability_mode(DurabilityMode::Sync);
        txn.insert(index.index_id, b"c", b"3").unwrap();
        txn.commit().unwrap();

        // Dropped here without another checkpoint: "c" only survives via
        // redo replay, not via the on-disk tree state.
    }

    let db = Database::open(DatabaseConfig::new(&path)).unwrap();
    let index = db.open_index("t1").unwrap();
    for (key, expected) in [(b"a" as &[u8], b"1" as &[u8]), (b"b", b"2"), (b"c", b"3")] {
        let mut cursor = Cursor::new(index.clone());
        assert!(cursor.find(key).unwrap(), "missing key {:?}", key);
        assert_eq!(cursor.get_value().unwrap(), expected);
    }
}

#[test]
fn uncommitted_write_is_undone_if_a_checkpoint_catches_it_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inflight");

    {
        let db = Database::open(DatabaseConfig::new(&path)).unwrap();
        let index = db.open_index("t1").unwrap();

        let txn = db.new_transaction().unwrap();
        txn.insert(index.index_id, b"ghost", b"1").unwrap();

        // Checkpoint flushes the retiring epoch's dirty pages regardless of
        // commit status, so "ghost" lands on disk here even though the
        // transaction above never calls commit().
        db.checkpoint().unwrap();
    }

    let db = Database::open(DatabaseConfig::new(&path)).unwrap();
    let index = db.open_index("t1").unwrap();
    let mut cursor = Cursor::new(index);
    assert!(!cursor.find(b"ghost").unwrap());
}

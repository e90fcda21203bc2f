//! End-to-end scenarios exercising the public `Database`/`Txn` surface
//! against a real file on disk.

use fathom::{Database, DatabaseConfig};
use fathom_btree::Cursor;

fn open(dir: &tempfile::TempDir, name: &str) -> std::sync::Arc<Database> {
    Database::open(DatabaseConfig::new(dir.path().join(name))).unwrap()
}

#[test]
fn basic_insert_and_find() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "basic");
    let index = db.open_index("t1").unwrap();

    let mut cursor = Cursor::new(index.clone());
    assert!(!cursor.find(b"hello").unwrap());
    cursor.store(Some(b"world")).unwrap();
    cursor.reset();

    let mut cursor = Cursor::new(index);
    assert!(cursor.find(b"hello").unwrap());
    assert_eq!(cursor.get_value().unwrap(), b"world");
}

#[test]
fn ordered_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "ordered");
    let index = db.open_index("t1").unwrap();

    for k in ["a", "b", "c", "d"] {
        let mut cursor = Cursor::new(index.clone());
        cursor.find(k.as_bytes()).unwrap();
        cursor.store(Some(k.as_bytes())).unwrap();
    }

    let mut cursor = Cursor::new(index);
    cursor.first().unwrap();
    let mut seen = Vec::new();
    loop {
        seen.push(cursor.get_key().unwrap());
        if !cursor.next().unwrap() {
            break;
        }
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    assert!(!cursor.is_positioned());
}

#[test]
fn split_invariance_over_ten_thousand_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "split");
    let index = db.open_index("t1").unwrap();

    for i in 0..10_000u32 {
        let key = format!("key-{i:010}");
        let mut cursor = Cursor::new(index.clone());
        cursor.find(key.as_bytes()).unwrap();
        cursor.store(Some(key.as_bytes())).unwrap();
    }

    let mut cursor = Cursor::new(index.clone());
    cursor.first().unwrap();
    let mut count = 0usize;
    let mut previous: Option<Vec<u8>> = None;
    loop {
        let key = cursor.get_key().unwrap();
        if let Some(prev) = &previous {
            assert!(prev < &key, "keys must be strictly increasing");
        }
        previous = Some(key);
        count += 1;
        if !cursor.next().unwrap() {
            break;
        }
    }
    assert_eq!(count, 10_000);
}

#[test]
fn transaction_rollback_discards_uncommitted_write() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "rollback");
    let index = db.open_index("t1").unwrap();

    let txn = db.new_transaction().unwrap();
    txn.enter();
    txn.insert(index.index_id, b"x", b"1").unwrap();
    txn.exit().unwrap();

    let mut cursor = Cursor::new(index);
    assert!(!cursor.find(b"x").unwrap());
}

#[test]
fn large_value_round_trips_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("large");
    let value: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    {
        let db = Database::open(DatabaseConfig::new(&path)).unwrap();
        let index = db.open_index("t1").unwrap();
        let mut cursor = Cursor::new(index);
        cursor.find(b"big").unwrap();
        cursor.store(Some(&value)).unwrap();
        db.checkpoint().unwrap();
    }

    let db = Database::open(DatabaseConfig::new(&path)).unwrap();
    let index = db.open_index("t1").unwrap();
    let mut cursor = Cursor::new(index);
    assert!(cursor.find(b"big").unwrap());
    assert_eq!(cursor.get_value().unwrap(), value);
}

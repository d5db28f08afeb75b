/// Integration tests for snapshot isolation and optimistic commit.
use std::thread;

use cowkv::{Config, Database, KvError, TxState};

fn setup() -> Database {
    let db = Database::open_in_memory(Config::default()).unwrap();
    let mut tx = db.begin();
    tx.create_table("t").unwrap();
    tx.insert("t", b"base", b"0").unwrap();
    tx.commit().unwrap();
    db
}

#[test]
fn test_uncommitted_writes_are_invisible() {
    let db = setup();
    let mut writer = db.begin();
    let reader = db.begin();

    writer.insert("t", b"new", b"1").unwrap();
    writer.update("t", b"base", b"changed").unwrap();
    assert_eq!(reader.get("t", b"new").unwrap(), None);
    assert_eq!(reader.get("t", b"base").unwrap(), Some(b"0".to_vec()));

    writer.commit().unwrap();
    // The old snapshot keeps reading the old version.
    assert_eq!(reader.get("t", b"new").unwrap(), None);
    assert_eq!(reader.get("t", b"base").unwrap(), Some(b"0".to_vec()));

    let fresh = db.begin();
    assert_eq!(fresh.get("t", b"new").unwrap(), Some(b"1".to_vec()));
    assert_eq!(fresh.get("t", b"base").unwrap(), Some(b"changed".to_vec()));
}

#[test]
fn test_conflict_then_retry() {
    let db = setup();
    let mut first = db.begin();
    let mut second = db.begin();
    assert_eq!(first.snapshot_root(), second.snapshot_root());

    first.insert("t", b"k1", b"v1").unwrap();
    second.insert("t", b"k2", b"v2").unwrap();

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(err, KvError::Conflict { .. }));
    assert_eq!(second.state(), TxState::Aborted);

    let wal_len = db.read_wal().unwrap().len();
    let mut retry = db.begin();
    retry.insert("t", b"k2", b"v2").unwrap();
    retry.commit().unwrap();
    // Only the retry reached the WAL.
    assert_eq!(db.read_wal().unwrap().len(), wal_len + 4);

    let tx = db.begin();
    assert_eq!(tx.get("t", b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(tx.get("t", b"k2").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_read_only_transaction_never_conflicts() {
    let db = setup();
    let mut reader = db.begin();
    let mut writer = db.begin();
    writer.insert("t", b"k", b"v").unwrap();
    writer.commit().unwrap();

    assert_eq!(reader.get("t", b"k").unwrap(), None);
    reader.commit().unwrap();
    assert_eq!(reader.state(), TxState::Committed);
}

#[test]
fn test_concurrent_writers_with_retry() {
    let db = setup();
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let key = format!("t{}-{:03}", t, i);
                    let mut attempts = 0;
                    loop {
                        attempts += 1;
                        let mut tx = db.begin();
                        tx.insert("t", key.as_bytes(), b"x").unwrap();
                        match tx.commit() {
                            Ok(()) => break,
                            Err(e) if e.is_conflict() => assert!(attempts < 1000),
                            Err(e) => panic!("commit failed: {}", e),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let tx = db.begin();
    let count = tx.scanner("t").unwrap().count();
    assert_eq!(count, 1 + 4 * 25);
    for t in 0..4 {
        for i in 0..25 {
            let key = format!("t{}-{:03}", t, i);
            assert_eq!(tx.get("t", key.as_bytes()).unwrap(), Some(b"x".to_vec()));
        }
    }
}

#[test]
fn test_rollback_discards_changes() {
    let db = setup();
    let mut tx = db.begin();
    tx.insert("t", b"gone", b"1").unwrap();
    tx.create_table("other").unwrap();
    tx.rollback();
    tx.rollback();
    assert_eq!(tx.state(), TxState::Aborted);

    let tx = db.begin();
    assert_eq!(tx.get("t", b"gone").unwrap(), None);
    assert_eq!(tx.table_names().unwrap(), vec!["t"]);
}

#[test]
fn test_rolled_back_pages_are_reused() {
    let db = setup();
    let before = db.stats();
    {
        let mut tx = db.begin();
        for i in 0..600 {
            tx.insert("t", format!("k{:04}", i).as_bytes(), &[1u8; 100])
                .unwrap();
        }
        // Dropped without commit.
    }
    let after_rollback = db.stats();
    assert!(after_rollback.page_count > before.page_count);
    assert!(after_rollback.free_pages > 0);

    let mut tx = db.begin();
    tx.insert("t", b"k", b"v").unwrap();
    tx.commit().unwrap();
    // Served from the pool instead of growing the page counter.
    assert_eq!(db.stats().page_count, after_rollback.page_count);
}

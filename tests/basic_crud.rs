/// Integration tests for table and entry operations through transactions.
use cowkv::{Config, Database, Event, KvError, SeekStrategy};

fn small_config() -> Config {
    Config::default()
        .page_size(4096)
        .max_key_size(256)
        .max_value_size(1024)
}

fn db_with_table(config: Config, table: &str) -> Database {
    let db = Database::open_in_memory(config).unwrap();
    let mut tx = db.begin();
    tx.create_table(table).unwrap();
    tx.commit().unwrap();
    db
}

fn key(i: u32) -> Vec<u8> {
    format!("key{:08}", i).into_bytes()
}

#[test]
fn test_concrete_scenario() {
    let db = db_with_table(Config::default(), "t");
    let wal_before = db.read_wal().unwrap().len();

    let mut tx = db.begin();
    tx.insert("t", b"a", b"1").unwrap();
    tx.insert("t", b"m", b"2").unwrap();
    tx.insert("t", b"z", b"3").unwrap();
    assert_eq!(tx.get("t", b"m").unwrap(), Some(b"2".to_vec()));
    {
        let mut scanner = tx.scanner("t").unwrap();
        let found = scanner.seek(b"b", SeekStrategy::GreaterOrEqual).unwrap();
        assert_eq!(found, Some((b"m".to_vec(), b"2".to_vec())));
    }
    tx.commit().unwrap();

    let events = db.read_wal().unwrap();
    let logged = &events[wal_before..];
    assert_eq!(logged.len(), 6);
    assert!(matches!(logged[0], Event::StartTransaction { .. }));
    let keys: Vec<&[u8]> = logged[1..4]
        .iter()
        .map(|e| match e {
            Event::InsertEntry { key, .. } => key.as_slice(),
            other => panic!("unexpected event {}", other),
        })
        .collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"m".as_slice(), b"z".as_slice()]);
    assert!(matches!(logged[4], Event::FreePages { .. }));
    assert!(matches!(logged[5], Event::CommitTransaction { .. }));

    let mut tx = db.begin();
    assert_eq!(tx.delete("t", b"m").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tx.get("t", b"m").unwrap(), None);
    tx.commit().unwrap();

    let tx = db.begin();
    assert_eq!(tx.get("t", b"m").unwrap(), None);
    assert_eq!(tx.get("t", b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tx.get("t", b"z").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn test_round_trip_keeps_last_value() {
    let db = db_with_table(small_config(), "t");
    let mut tx = db.begin();
    for round in 0..3u8 {
        for i in 0..300 {
            tx.put("t", &key(i), &[round; 50]).unwrap();
        }
    }
    tx.commit().unwrap();

    let tx = db.begin();
    for i in 0..300 {
        assert_eq!(tx.get("t", &key(i)).unwrap(), Some(vec![2u8; 50]));
    }
}

#[test]
fn test_delete_returns_latest_value() {
    let db = db_with_table(small_config(), "t");
    let mut tx = db.begin();
    tx.insert("t", b"k", b"first").unwrap();
    tx.update("t", b"k", b"second").unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin();
    assert_eq!(tx.delete("t", b"k").unwrap(), Some(b"second".to_vec()));
    assert_eq!(tx.get("t", b"k").unwrap(), None);
    assert_eq!(tx.delete("t", b"k").unwrap(), None);
    tx.commit().unwrap();
}

#[test]
fn test_scan_order_and_seek_restart() {
    let db = db_with_table(small_config(), "t");
    let mut tx = db.begin();
    // Insert in a scrambled order.
    for i in 0..800u32 {
        let k = (i * 389) % 800;
        tx.insert("t", &key(k), format!("v{}", k).as_bytes()).unwrap();
    }
    tx.commit().unwrap();

    let tx = db.begin();
    let keys: Vec<Vec<u8>> = tx
        .scanner("t")
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys.len(), 800);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let mut scanner = tx.scanner("t").unwrap();
    let (k, v) = scanner
        .seek(&key(500), SeekStrategy::Greater)
        .unwrap()
        .unwrap();
    assert_eq!(k, key(501));
    assert_eq!(v, b"v501".to_vec());
    let rest: Vec<Vec<u8>> = scanner.map(|entry| entry.unwrap().0).collect();
    assert_eq!(rest.len(), 299);
    assert_eq!(rest[0], key(501));

    let mut scanner = tx.scanner("t").unwrap();
    assert_eq!(scanner.seek(&key(0), SeekStrategy::Less).unwrap(), None);
    let (k, _) = scanner
        .seek(b"key00000400x", SeekStrategy::LessOrEqual)
        .unwrap()
        .unwrap();
    assert_eq!(k, key(400));
    assert_eq!(scanner.seek(b"zzz", SeekStrategy::GreaterOrEqual).unwrap(), None);
}

#[test]
fn test_split_and_merge_back_to_single_entry() {
    let db = db_with_table(small_config(), "t");
    let value = [7u8; 200];
    let mut tx = db.begin();
    for i in 0..2000 {
        tx.insert("t", &key(i), &value).unwrap();
    }
    tx.commit().unwrap();

    let mut tx = db.begin();
    for i in 0..2000 {
        if i != 1234 {
            assert!(tx.delete("t", &key(i)).unwrap().is_some());
        }
    }
    tx.commit().unwrap();

    let tx = db.begin();
    let entries: Vec<_> = tx.scanner("t").unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries, vec![(key(1234), value.to_vec())]);
}

#[test]
fn test_tables_are_independent() {
    let db = Database::open_in_memory(small_config()).unwrap();
    let mut tx = db.begin();
    tx.create_table("users").unwrap();
    tx.create_table("orders").unwrap();
    tx.insert("users", b"1", b"alice").unwrap();
    tx.insert("orders", b"1", b"book").unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin();
    assert_eq!(tx.table_names().unwrap(), vec!["orders", "users"]);
    tx.delete_table("orders").unwrap();
    assert!(matches!(tx.get("orders", b"1"), Err(KvError::TableNotFound(_))));
    assert_eq!(tx.get("users", b"1").unwrap(), Some(b"alice".to_vec()));
    tx.create_table("orders").unwrap();
    assert_eq!(tx.get("orders", b"1").unwrap(), None);
    tx.commit().unwrap();

    let tx = db.begin();
    assert_eq!(tx.table_names().unwrap(), vec!["orders", "users"]);
    assert_eq!(tx.get("orders", b"1").unwrap(), None);
}

#[test]
fn test_oversized_entries_rejected_without_changes() {
    let db = db_with_table(small_config(), "t");
    let mut tx = db.begin();
    let big_key = vec![b'k'; 257];
    assert!(matches!(
        tx.insert("t", &big_key, b"v"),
        Err(KvError::SizeLimitExceeded { what: "key", .. })
    ));
    assert!(matches!(
        tx.put("t", b"k", &vec![0u8; 1025]),
        Err(KvError::SizeLimitExceeded { what: "value", .. })
    ));
    assert!(tx.events().is_empty());
    // Largest allowed entry is accepted.
    tx.insert("t", &vec![b'k'; 256], &vec![0u8; 1024]).unwrap();
    tx.commit().unwrap();
}

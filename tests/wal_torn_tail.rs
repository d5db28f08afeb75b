/// Integration tests for damaged WAL tails and mid-log corruption on open.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use cowkv::wal::{FRAME_HEADER_SIZE, WAL_HEADER_SIZE};
use cowkv::{wal_path, Config, Database, KvError, RecoveryMode};
use tempfile::TempDir;

fn config(mode: RecoveryMode) -> Config {
    Config::default()
        .page_size(4096)
        .max_key_size(256)
        .max_value_size(1024)
        .recovery_mode(mode)
}

fn populate(path: &Path, from: u32, to: u32) {
    let db = Database::open(path, config(RecoveryMode::Strict)).unwrap();
    let mut tx = db.begin();
    if from == 0 {
        tx.create_table("t").unwrap();
    }
    for i in from..to {
        tx.insert("t", format!("k{:05}", i).as_bytes(), b"v").unwrap();
    }
    tx.commit().unwrap();
}

fn count(db: &Database) -> usize {
    db.begin().scanner("t").unwrap().count()
}

fn append_bytes(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn test_garbage_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    populate(&path, 0, 50);
    let clean_len = fs::metadata(wal_path(&path)).unwrap().len();

    append_bytes(&wal_path(&path), &[0xAB; 37]);

    {
        let db = Database::open(&path, config(RecoveryMode::Strict)).unwrap();
        assert_eq!(count(&db), 50);
        // The log was cut back to its last whole frame.
        assert_eq!(db.stats().wal_bytes, clean_len);
    }
    populate(&path, 50, 80);

    let db = Database::open(&path, config(RecoveryMode::Strict)).unwrap();
    assert_eq!(count(&db), 80);
}

#[test]
fn test_half_written_frame_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    populate(&path, 0, 10);
    let wal = wal_path(&path);
    let clean_len = fs::metadata(&wal).unwrap().len();

    // A frame header announcing more payload than was written.
    let mut partial = Vec::new();
    partial.extend_from_slice(&100u32.to_le_bytes());
    partial.extend_from_slice(&0u32.to_le_bytes());
    partial.extend_from_slice(b"START_TRANS");
    append_bytes(&wal, &partial);

    let db = Database::open(&path, config(RecoveryMode::Strict)).unwrap();
    assert_eq!(count(&db), 10);
    assert_eq!(db.stats().wal_bytes, clean_len);
}

#[test]
fn test_corrupt_last_frame_is_torn_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    populate(&path, 0, 10);
    let wal = wal_path(&path);
    let mut data = fs::read(&wal).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(&wal, &data).unwrap();

    // Only the final frame is bad, so even strict mode opens.
    let db = Database::open(&path, config(RecoveryMode::Strict)).unwrap();
    assert_eq!(count(&db), 10);
    assert!(db.stats().wal_bytes < data.len() as u64);
}

#[test]
fn test_mid_log_corruption_depends_on_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    populate(&path, 0, 10);
    populate(&path, 10, 20);
    let wal = wal_path(&path);
    let mut data = fs::read(&wal).unwrap();
    // Flip a byte inside the first frame's payload; later frames stay valid.
    data[WAL_HEADER_SIZE + FRAME_HEADER_SIZE + 2] ^= 0xFF;
    fs::write(&wal, &data).unwrap();

    assert!(matches!(
        Database::open(&path, config(RecoveryMode::Strict)),
        Err(KvError::Wal(_))
    ));

    // The data file already holds every commit, so the store is intact even
    // though the log is cut at the damage.
    let db = Database::open(&path, config(RecoveryMode::Permissive)).unwrap();
    assert_eq!(count(&db), 20);
    assert_eq!(db.stats().wal_bytes, WAL_HEADER_SIZE as u64);
    drop(db);

    let db = Database::open(&path, config(RecoveryMode::Strict)).unwrap();
    assert_eq!(count(&db), 20);
}

#[test]
fn test_foreign_wal_header_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    populate(&path, 0, 1);
    fs::write(wal_path(&path), b"NOTAWAL!\x01\x00\x00\x00").unwrap();
    assert!(matches!(
        Database::open(&path, config(RecoveryMode::Permissive)),
        Err(KvError::Wal(_))
    ));
}

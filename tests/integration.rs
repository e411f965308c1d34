//! End-to-end scenarios exercising the full `Database` surface: create,
//! reopen, transactions, and the checksum-block boundary.

use frozendb::{Database, FinderStrategy, FrozenError, HostCapabilities, NoAppendOnlyAttribute};
use uuid::Uuid;

fn caps() -> HostCapabilities {
    HostCapabilities::default()
}

fn uuid_at(ms: u64, salt: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = (ms >> 40) as u8;
    bytes[1] = (ms >> 32) as u8;
    bytes[2] = (ms >> 24) as u8;
    bytes[3] = (ms >> 16) as u8;
    bytes[4] = (ms >> 8) as u8;
    bytes[5] = ms as u8;
    bytes[6] = 0x70;
    bytes[8] = 0x80;
    bytes[15] = salt;
    Uuid::from_bytes(bytes)
}

#[test]
fn e1_create_file_has_header_plus_initial_checksum_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e1.fdb");
    let db = Database::create(
        &path,
        512,
        5000,
        &caps(),
        &NoAppendOnlyAttribute,
        FinderStrategy::InMemory,
    )
    .unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 + 512);
    assert_eq!(db.header().row_size, 512);
    assert_eq!(db.header().skew_ms, 5000);
}

#[test]
fn e2_two_row_commit_is_visible_through_the_finder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e2.fdb");
    let db = Database::create(
        &path,
        256,
        5000,
        &caps(),
        &NoAppendOnlyAttribute,
        FinderStrategy::InMemory,
    )
    .unwrap();

    let u1 = uuid_at(1000, 1);
    let u2 = uuid_at(2000, 2);
    {
        let mut tx = db.begin_transaction().unwrap();
        tx.add_row(u1, br#"{"a":1}"#.to_vec()).unwrap();
        tx.add_row(u2, br#"{"a":2}"#.to_vec()).unwrap();
        tx.commit().unwrap();
    }

    assert_eq!(db.index_of(&u1).unwrap(), 1);
    assert_eq!(db.index_of(&u2).unwrap(), 2);
    assert_eq!(db.transaction_start_index(2).unwrap(), 1);
    assert_eq!(db.transaction_end_index(1).unwrap(), 2);
    assert_eq!(db.get(&u1).unwrap().value, br#"{"a":1}"#.to_vec());
    assert_eq!(db.get(&u2).unwrap().value, br#"{"a":2}"#.to_vec());
}

#[test]
fn e3_partial_rollback_keeps_only_the_savepoint_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e3.fdb");
    let db = Database::create(
        &path,
        256,
        5000,
        &caps(),
        &NoAppendOnlyAttribute,
        FinderStrategy::InMemory,
    )
    .unwrap();

    let u1 = uuid_at(1000, 1);
    let u2 = uuid_at(2000, 2);
    let u3 = uuid_at(3000, 3);
    {
        let mut tx = db.begin_transaction().unwrap();
        tx.add_row(u1, b"v1".to_vec()).unwrap();
        tx.savepoint().unwrap();
        tx.add_row(u2, b"v2".to_vec()).unwrap();
        tx.savepoint().unwrap();
        tx.add_row(u3, b"v3".to_vec()).unwrap();
        tx.rollback(1).unwrap();
    }

    // All three keys' bytes are on disk and reachable through the finder —
    // the log is append-only and a rollback never erases bytes.
    assert!(db.index_of(&u1).is_ok());
    assert!(db.index_of(&u2).is_ok());
    assert!(db.index_of(&u3).is_ok());

    // Every one of these rows carried a savepoint marker when it was
    // written. Reading them back must decode the bytes actually on disk
    // (not just the live finder's in-memory bookkeeping), so `get` forces a
    // real `DataRow::unmarshal` including its parity check.
    assert_eq!(db.get(&u1).unwrap().value, b"v1".to_vec());
    assert_eq!(db.get(&u2).unwrap().value, b"v2".to_vec());
    assert_eq!(db.get(&u3).unwrap().value, b"v3".to_vec());
    db.close();

    // Reopening with `SimpleFinder` rescans the file from scratch, so this
    // also exercises `SimpleFinder`'s own row-by-row unmarshal of every
    // savepoint-carrying row.
    let reopened = Database::open_read_only(&path, FinderStrategy::Simple).unwrap();
    assert_eq!(reopened.get(&u1).unwrap().value, b"v1".to_vec());
    assert_eq!(reopened.get(&u2).unwrap().value, b"v2".to_vec());
    assert_eq!(reopened.get(&u3).unwrap().value, b"v3".to_vec());
}

#[test]
fn e4_empty_transaction_emits_a_null_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e4.fdb");
    let db = Database::create(
        &path,
        256,
        5000,
        &caps(),
        &NoAppendOnlyAttribute,
        FinderStrategy::InMemory,
    )
    .unwrap();

    let size_before = std::fs::metadata(&path).unwrap().len();
    {
        let mut tx = db.begin_transaction().unwrap();
        tx.commit().unwrap();
    }
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size_after - size_before, 256);

    let some_key = uuid_at(1, 9);
    assert!(matches!(
        db.index_of(&some_key),
        Err(FrozenError::KeyNotFound)
    ));
}

#[test]
fn e5_checksum_block_is_inserted_after_ten_thousand_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e5.fdb");
    let db = Database::create(
        &path,
        128,
        0,
        &caps(),
        &NoAppendOnlyAttribute,
        FinderStrategy::Simple,
    )
    .unwrap();

    // Rows per transaction is capped at 100 (spec §9); drive exactly 10_000
    // data rows across 100 transactions of 100 rows each. The 10_000th data
    // row lands at index 10_000, so the next slot (10_001) is a checksum-row
    // slot and a new ChecksumRow is appended immediately after it commits.
    let before = std::fs::metadata(&path).unwrap().len();
    let mut ms = 1_000u64;
    for _ in 0..100 {
        let mut tx = db.begin_transaction().unwrap();
        for _ in 0..100 {
            ms += 1;
            tx.add_row(uuid_at(ms, 1), b"v".to_vec()).unwrap();
        }
        tx.commit().unwrap();
    }
    let after = std::fs::metadata(&path).unwrap().len();
    // 10_000 data rows plus the one checksum row the boundary inserts.
    assert_eq!(after - before, 128 * 10_001);

    // The next single row does not cross another checksum boundary.
    let before = after;
    {
        let mut tx = db.begin_transaction().unwrap();
        ms += 1;
        tx.add_row(uuid_at(ms, 1), b"v".to_vec()).unwrap();
        tx.commit().unwrap();
    }
    let after = std::fs::metadata(&path).unwrap().len();
    assert_eq!(after - before, 128);
}

#[test]
fn e6_fuzzy_search_respects_skew_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e6.fdb");
    let db = Database::create(
        &path,
        128,
        10,
        &caps(),
        &NoAppendOnlyAttribute,
        FinderStrategy::Simple,
    )
    .unwrap();

    let timestamps = [95u64, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 495];
    let mut keys = Vec::new();
    {
        let mut tx = db.begin_transaction().unwrap();
        for (i, &ts) in timestamps.iter().enumerate() {
            let key = uuid_at(ts, i as u8);
            tx.add_row(key, b"v".to_vec()).unwrap();
            keys.push(key);
        }
        tx.commit().unwrap();
    }

    let target = keys[5];
    // Index 0 is the initial checksum row, so data row N (0-based) lands at
    // index N + 1.
    assert_eq!(db.index_of(&target).unwrap(), 6);
    assert_eq!(db.get(&target).unwrap().uuid, target);

    let missing = uuid_at(300, 0);
    assert!(matches!(
        db.index_of(&missing),
        Err(FrozenError::KeyNotFound)
    ));
}

#[test]
fn reopen_read_only_after_write_session_closes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.fdb");
    let key = uuid_at(12_345, 3);
    {
        let db = Database::create(
            &path,
            256,
            5000,
            &caps(),
            &NoAppendOnlyAttribute,
            FinderStrategy::InMemory,
        )
        .unwrap();
        let mut tx = db.begin_transaction().unwrap();
        tx.add_row(key, b"persisted".to_vec()).unwrap();
        tx.commit().unwrap();
        db.close();
    }

    let db = Database::open_read_only(&path, FinderStrategy::Simple).unwrap();
    assert_eq!(db.get(&key).unwrap().value, b"persisted".to_vec());
    // A read-only handle's underlying file manager holds no lock, so a
    // second read-write handle on the same file can still attach.
    let writer = Database::open_read_write(&path, FinderStrategy::InMemory).unwrap();
    let mut tx = writer.begin_transaction().unwrap();
    let key2 = uuid_at(12_346, 4);
    tx.add_row(key2, b"more".to_vec()).unwrap();
    tx.commit().unwrap();
}

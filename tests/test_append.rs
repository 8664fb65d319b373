use burrowdb::{Cursor, DatabaseFlags, Error, EnvBuilder, PutFlags};
use tempfile::TempDir;

/// Sequential append of k000..k999 into a fresh DUPSORT table, then a full
/// forward and reverse walk
#[test]
fn test_append_ordering() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("append"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();
    for i in 0..1000u32 {
        let key = format!("k{i:03}");
        db.put(&mut txn, key.as_bytes(), b"payload", PutFlags::APPEND).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.entries(&txn).unwrap(), 1000);

    let mut cursor = Cursor::new(&txn, &db).unwrap();
    let mut forward = Vec::new();
    let mut item = cursor.first(&txn).unwrap();
    while let Some((key, _)) = item {
        forward.push(String::from_utf8(key.to_vec()).unwrap());
        item = cursor.next(&txn).unwrap();
    }
    assert_eq!(forward.len(), 1000);
    for (i, key) in forward.iter().enumerate() {
        assert_eq!(key, &format!("k{i:03}"));
    }

    let mut backward = Vec::new();
    let mut item = cursor.last(&txn).unwrap();
    while let Some((key, _)) = item {
        backward.push(String::from_utf8(key.to_vec()).unwrap());
        item = cursor.prev(&txn).unwrap();
    }
    backward.reverse();
    assert_eq!(backward, forward);
}

/// Appending a key that sorts below the current maximum must fail with
/// key-mismatch and leave the table untouched
#[test]
fn test_append_violation() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("append"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();
    for i in 0..1000u32 {
        let key = format!("k{i:03}");
        db.put(&mut txn, key.as_bytes(), b"payload", PutFlags::APPEND).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.write_txn().unwrap();
    assert!(matches!(
        db.put(&mut txn, b"k500", b"late", PutFlags::APPEND),
        Err(Error::KeyMismatch)
    ));
    assert_eq!(db.entries(&txn).unwrap(), 1000);
    assert_eq!(db.get(&txn, b"k500").unwrap().unwrap().as_ref(), b"payload");
    txn.commit().unwrap();
}

/// APPEND_DUP enforces ordering among one key's values
#[test]
fn test_append_dup_ordering() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("ad"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();
    db.put(&mut txn, b"k", b"a", PutFlags::APPEND_DUP).unwrap();
    db.put(&mut txn, b"k", b"b", PutFlags::APPEND_DUP).unwrap();
    db.put(&mut txn, b"k", b"c", PutFlags::APPEND_DUP).unwrap();
    db.put(&mut txn, b"k", b"ca", PutFlags::APPEND_DUP).unwrap();
    assert!(matches!(
        db.put(&mut txn, b"k", b"b0", PutFlags::APPEND_DUP),
        Err(Error::KeyMismatch)
    ));
    assert_eq!(db.dup_count(&txn, b"k").unwrap(), 4);
    txn.commit().unwrap();
}

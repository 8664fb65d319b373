use burrowdb::{Cursor, DatabaseFlags, Error, EnvBuilder, PutFlags};
use tempfile::TempDir;

fn fill(env: &burrowdb::Environment, count: u32) -> burrowdb::Database {
    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    for i in 0..count {
        let key = format!("k{i:04}");
        let value = format!("v{i:04}");
        db.put(&mut txn, key.as_bytes(), value.as_bytes(), PutFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
    db
}

#[test]
fn test_forward_walk() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();
    let db = fill(&env, 1000);

    let txn = env.read_txn().unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();
    let mut seen = Vec::new();
    let mut item = cursor.first(&txn).unwrap();
    while let Some((key, value)) = item {
        assert_eq!(&value[1..], &key[1..], "value should mirror key");
        seen.push(key.to_vec());
        item = cursor.next(&txn).unwrap();
    }
    assert_eq!(seen.len(), 1000);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "keys must come out sorted");
    assert_eq!(seen[0], b"k0000");
    assert_eq!(seen[999], b"k0999");
}

#[test]
fn test_backward_walk() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();
    let db = fill(&env, 300);

    let txn = env.read_txn().unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();
    let mut seen = Vec::new();
    let mut item = cursor.last(&txn).unwrap();
    while let Some((key, _)) = item {
        seen.push(key.to_vec());
        item = cursor.prev(&txn).unwrap();
    }
    assert_eq!(seen.len(), 300);
    assert!(seen.windows(2).all(|w| w[0] > w[1]));
    assert_eq!(seen[0], b"k0299");
}

#[test]
fn test_seek_and_seek_exact() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();
    let db = fill(&env, 100);

    let txn = env.read_txn().unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();

    let (key, _) = cursor.seek_exact(&txn, b"k0042").unwrap().unwrap();
    assert_eq!(key.as_ref(), b"k0042");
    assert!(cursor.seek_exact(&txn, b"k0042x").unwrap().is_none());

    // set-range lands on the next key when the exact one is absent
    let (key, _) = cursor.seek(&txn, b"k0042x").unwrap().unwrap();
    assert_eq!(key.as_ref(), b"k0043");
    let (key, _) = cursor.seek(&txn, b"").unwrap().unwrap();
    assert_eq!(key.as_ref(), b"k0000");
    assert!(cursor.seek(&txn, b"z").unwrap().is_none());
}

#[test]
fn test_cursor_write_ops() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();

    for i in 0..50u32 {
        let key = format!("w{i:03}");
        cursor.put(&mut txn, &db, key.as_bytes(), b"first", PutFlags::empty()).unwrap();
    }
    // cursor sits on the last written pair
    let (key, value) = cursor.seek_exact(&txn, b"w025").unwrap().unwrap();
    assert_eq!(key.as_ref(), b"w025");
    assert_eq!(value.as_ref(), b"first");

    cursor.del(&mut txn, &db).unwrap();
    assert!(cursor.seek_exact(&txn, b"w025").unwrap().is_none());
    assert_eq!(db.entries(&txn).unwrap(), 49);
    txn.commit().unwrap();
}

#[test]
fn test_cursor_goes_poor_on_drop() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, Some("doomed"), DatabaseFlags::CREATE).unwrap();
    db.put(&mut txn, b"a", b"1", PutFlags::empty()).unwrap();

    let mut cursor = Cursor::new(&txn, &db).unwrap();
    assert!(cursor.first(&txn).unwrap().is_some());

    db.drop(&mut txn).unwrap();
    assert!(matches!(cursor.first(&txn), Err(Error::BadCursor)));
    // the handle still exists; only the cursor went poor
    assert_eq!(db.entries(&txn).unwrap(), 0);
}

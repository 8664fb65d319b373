use burrowdb::{DatabaseFlags, EnvBuilder, Error, PutFlags};
use tempfile::TempDir;

#[test]
fn test_put_get_del() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"hello", b"world", PutFlags::empty()).unwrap();
    db.put(&mut txn, b"foo", b"bar", PutFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, b"hello").unwrap().unwrap().as_ref(), b"world");
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"hello").unwrap().unwrap().as_ref(), b"world");
    assert_eq!(db.get(&txn, b"foo").unwrap().unwrap().as_ref(), b"bar");
    assert!(db.get(&txn, b"missing").unwrap().is_none());
    drop(txn);

    let mut txn = env.write_txn().unwrap();
    assert!(db.del(&mut txn, b"foo", None).unwrap());
    assert!(!db.del(&mut txn, b"foo", None).unwrap());
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert!(db.get(&txn, b"foo").unwrap().is_none());
    assert_eq!(db.entries(&txn).unwrap(), 1);
}

#[test]
fn test_overwrite_and_no_overwrite() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"k", b"v1", PutFlags::empty()).unwrap();
    db.put(&mut txn, b"k", b"v2", PutFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap().as_ref(), b"v2");
    assert!(matches!(
        db.put(&mut txn, b"k", b"v3", PutFlags::NO_OVERWRITE),
        Err(Error::KeyExists)
    ));
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap().as_ref(), b"v2");
    assert_eq!(db.entries(&txn).unwrap(), 1);
    txn.commit().unwrap();
}

#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();
        let mut txn = env.write_txn().unwrap();
        let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..500u32 {
            let key = format!("key{i:05}");
            let value = format!("value-{i}");
            db.put(&mut txn, key.as_bytes(), value.as_bytes(), PutFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();
        let mut txn = env.read_txn().unwrap();
        let db = env.open_database(&mut txn, None).unwrap();
        for i in (0..500u32).step_by(17) {
            let key = format!("key{i:05}");
            let expected = format!("value-{i}");
            assert_eq!(db.get(&txn, key.as_bytes()).unwrap().unwrap().as_ref(), expected.as_bytes());
        }
        assert_eq!(db.entries(&txn).unwrap(), 500);
    }
}

#[test]
fn test_enough_inserts_to_split() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    // enough data to force several levels of splits
    for i in 0..5000u32 {
        let key = format!("{:08}", i.wrapping_mul(2654435761) % 10_000_000);
        let value = [0x5Au8; 64];
        let _ = db.put(&mut txn, key.as_bytes(), &value, PutFlags::empty());
    }
    txn.commit().unwrap();

    let env_stat = env.stat().unwrap();
    assert!(env_stat.depth >= 2, "tree should have split, depth = {}", env_stat.depth);
    assert!(env_stat.leaf_pages > 1);
    assert!(env_stat.branch_pages >= 1);

    let txn = env.read_txn().unwrap();
    let probe = format!("{:08}", 7u32.wrapping_mul(2654435761) % 10_000_000);
    assert!(db.get(&txn, probe.as_bytes()).unwrap().is_some());
}

#[test]
fn test_delete_down_to_empty() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    let keys: Vec<String> = (0..800u32).map(|i| format!("entry-{i:04}")).collect();
    for key in &keys {
        db.put(&mut txn, key.as_bytes(), b"payload-payload-payload", PutFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.write_txn().unwrap();
    for key in &keys {
        assert!(db.del(&mut txn, key.as_bytes(), None).unwrap(), "missing {key}");
    }
    assert_eq!(db.entries(&txn).unwrap(), 0);
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.entries(&txn).unwrap(), 0);
    assert!(db.get(&txn, b"entry-0000").unwrap().is_none());
}

#[test]
fn test_clear_keeps_table() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    for i in 0..100u32 {
        db.put(&mut txn, format!("c{i}").as_bytes(), b"x", PutFlags::empty()).unwrap();
    }
    db.clear(&mut txn).unwrap();
    assert_eq!(db.entries(&txn).unwrap(), 0);
    db.put(&mut txn, b"after", b"clear", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.entries(&txn).unwrap(), 1);
    assert_eq!(db.get(&txn, b"after").unwrap().unwrap().as_ref(), b"clear");
}

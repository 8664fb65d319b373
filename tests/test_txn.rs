use burrowdb::{DatabaseFlags, Error, EnvBuilder, PutFlags};
use tempfile::TempDir;

#[test]
fn test_abort_discards_changes() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"kept", b"yes", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.write_txn().unwrap();
    db.put(&mut txn, b"kept", b"overwritten", PutFlags::empty()).unwrap();
    db.put(&mut txn, b"extra", b"gone", PutFlags::empty()).unwrap();
    txn.abort();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"kept").unwrap().unwrap().as_ref(), b"yes");
    assert!(db.get(&txn, b"extra").unwrap().is_none());
}

#[test]
fn test_drop_acts_as_abort() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"base", b"1", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    {
        let mut txn = env.write_txn().unwrap();
        db.put(&mut txn, b"base", b"2", PutFlags::empty()).unwrap();
        // dropped without commit
    }

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"base").unwrap().unwrap().as_ref(), b"1");
}

#[test]
fn test_nested_commit_merges() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"outer", b"1", PutFlags::empty()).unwrap();
    {
        let mut child = txn.begin_nested().unwrap();
        db.put(&mut child, b"inner", b"2", PutFlags::empty()).unwrap();
        child.commit().unwrap();
    }
    assert_eq!(db.get(&txn, b"inner").unwrap().unwrap().as_ref(), b"2");
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"outer").unwrap().unwrap().as_ref(), b"1");
    assert_eq!(db.get(&txn, b"inner").unwrap().unwrap().as_ref(), b"2");
}

#[test]
fn test_nested_abort_discards_only_child() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"outer", b"1", PutFlags::empty()).unwrap();
    {
        let mut child = txn.begin_nested().unwrap();
        db.put(&mut child, b"inner", b"2", PutFlags::empty()).unwrap();
        db.put(&mut child, b"outer", b"clobbered", PutFlags::empty()).unwrap();
        child.abort();
    }
    assert!(db.get(&txn, b"inner").unwrap().is_none());
    assert_eq!(db.get(&txn, b"outer").unwrap().unwrap().as_ref(), b"1");
    db.put(&mut txn, b"after", b"3", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"outer").unwrap().unwrap().as_ref(), b"1");
    assert_eq!(db.get(&txn, b"after").unwrap().unwrap().as_ref(), b"3");
    assert!(db.get(&txn, b"inner").unwrap().is_none());
}

#[test]
fn test_try_write_is_busy_while_writer_active() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let txn = env.write_txn().unwrap();
    assert!(matches!(env.try_write_txn().err(), Some(Error::Busy)));
    drop(txn);
    let txn = env.try_write_txn().unwrap();
    drop(txn);
}

#[test]
fn test_reader_sees_snapshot_not_later_commits() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"v", b"one", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let reader = env.read_txn().unwrap();
    assert_eq!(db.get(&reader, b"v").unwrap().unwrap().as_ref(), b"one");

    let mut writer = env.write_txn().unwrap();
    db.put(&mut writer, b"v", b"two", PutFlags::empty()).unwrap();
    writer.commit().unwrap();

    // the old reader still sees its snapshot; a new one sees the commit
    assert_eq!(db.get(&reader, b"v").unwrap().unwrap().as_ref(), b"one");
    let fresh = env.read_txn().unwrap();
    assert_eq!(db.get(&fresh, b"v").unwrap().unwrap().as_ref(), b"two");
}

#[test]
fn test_park_resume_observes_newer_snapshot() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"v", b"one", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut reader = env.read_txn().unwrap();
    let before = reader.id();
    reader.park().unwrap();

    let mut writer = env.write_txn().unwrap();
    db.put(&mut writer, b"v", b"two", PutFlags::empty()).unwrap();
    writer.commit().unwrap();

    reader.resume().unwrap();
    assert!(reader.id() > before);
    assert_eq!(db.get(&reader, b"v").unwrap().unwrap().as_ref(), b"two");
}

#[test]
fn test_map_full_poisons_transaction() {
    let dir = TempDir::new().unwrap();
    // tiny geometry: 64 pages total
    let env = EnvBuilder::new().map_size(64 * 4096).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    let big = vec![0xAB; 3000];
    let mut failed = false;
    for i in 0..200u32 {
        match db.put(&mut txn, format!("fill{i:04}").as_bytes(), &big, PutFlags::empty()) {
            Ok(()) => {}
            Err(Error::MapFull { .. }) => {
                failed = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(failed, "the tiny map should have filled up");
    // the transaction is poisoned: everything fails until abort
    assert!(matches!(
        db.put(&mut txn, b"x", b"y", PutFlags::empty()),
        Err(Error::TxnPoisoned)
    ));
    assert!(txn.commit().is_err());

    // the environment itself stays usable
    let mut txn = env.write_txn().unwrap();
    db.put(&mut txn, b"small", b"fits", PutFlags::empty()).unwrap();
    txn.commit().unwrap();
}

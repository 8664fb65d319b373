use burrowdb::{DatabaseFlags, EnvBuilder, PutFlags};
use tempfile::TempDir;

fn blob(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

#[test]
fn test_large_value_round_trip() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let payload = blob(50_000, 7);
    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"big", &payload, PutFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap().as_ref(), payload.as_slice());
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap().as_ref(), payload.as_slice());
    drop(txn);

    let stat = env.stat().unwrap();
    assert!(stat.large_pages >= 13, "50k needs a dozen large pages, got {}", stat.large_pages);
}

#[test]
fn test_large_value_resize_retires_old_run() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"grow", &blob(10_000, 1), PutFlags::empty()).unwrap();
    txn.commit().unwrap();
    let pages_small = env.stat().unwrap().large_pages;

    let mut txn = env.write_txn().unwrap();
    let bigger = blob(40_000, 2);
    db.put(&mut txn, b"grow", &bigger, PutFlags::empty()).unwrap();
    txn.commit().unwrap();
    let pages_big = env.stat().unwrap().large_pages;
    assert!(pages_big > pages_small);

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"grow").unwrap().unwrap().as_ref(), bigger.as_slice());
    drop(txn);

    // shrinking back down releases the big run
    let mut txn = env.write_txn().unwrap();
    db.put(&mut txn, b"grow", &blob(5_000, 3), PutFlags::empty()).unwrap();
    txn.commit().unwrap();
    assert!(env.stat().unwrap().large_pages < pages_big);
}

#[test]
fn test_large_value_delete() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    db.put(&mut txn, b"gone", &blob(30_000, 9), PutFlags::empty()).unwrap();
    db.put(&mut txn, b"kept", b"small", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.write_txn().unwrap();
    assert!(db.del(&mut txn, b"gone", None).unwrap());
    txn.commit().unwrap();

    let stat = env.stat().unwrap();
    assert_eq!(stat.large_pages, 0);
    let txn = env.read_txn().unwrap();
    assert!(db.get(&txn, b"gone").unwrap().is_none());
    assert_eq!(db.get(&txn, b"kept").unwrap().unwrap().as_ref(), b"small");
}

#[test]
fn test_inline_threshold_boundary() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    // exactly at the quarter-page bound stays inline; one byte over spills
    let inline = blob(burrowdb::PAGE_SIZE / 4, 4);
    let spilled = blob(burrowdb::PAGE_SIZE / 4 + 1, 5);
    db.put(&mut txn, b"inline", &inline, PutFlags::empty()).unwrap();
    db.put(&mut txn, b"spilled", &spilled, PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    let stat = env.stat().unwrap();
    assert_eq!(stat.large_pages, 1);
    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"inline").unwrap().unwrap().as_ref(), inline.as_slice());
    assert_eq!(db.get(&txn, b"spilled").unwrap().unwrap().as_ref(), spilled.as_slice());
}

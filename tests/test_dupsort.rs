use burrowdb::{Cursor, DatabaseFlags, Error, EnvBuilder, PutFlags};
use tempfile::TempDir;

#[test]
fn test_dup_insert_and_count() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("dups"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();

    db.put(&mut txn, b"fruit", b"banana", PutFlags::empty()).unwrap();
    db.put(&mut txn, b"fruit", b"apple", PutFlags::empty()).unwrap();
    db.put(&mut txn, b"fruit", b"cherry", PutFlags::empty()).unwrap();
    // re-inserting an existing pair is a no-op
    db.put(&mut txn, b"fruit", b"apple", PutFlags::empty()).unwrap();
    assert!(matches!(
        db.put(&mut txn, b"fruit", b"apple", PutFlags::NO_DUP_DATA),
        Err(Error::KeyExists)
    ));

    assert_eq!(db.dup_count(&txn, b"fruit").unwrap(), 3);
    assert_eq!(db.entries(&txn).unwrap(), 3);
    // get returns the first value in dup order
    assert_eq!(db.get(&txn, b"fruit").unwrap().unwrap().as_ref(), b"apple");
    txn.commit().unwrap();
}

#[test]
fn test_dup_iteration_matches_count() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("dups"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();
    for key in ["alpha", "beta"] {
        for i in 0..12u32 {
            let value = format!("{key}-value-{i:02}");
            db.put(&mut txn, key.as_bytes(), value.as_bytes(), PutFlags::empty()).unwrap();
        }
    }
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();
    let mut per_key = std::collections::HashMap::<Vec<u8>, u64>::new();
    let mut item = cursor.first(&txn).unwrap();
    let mut last: Option<(Vec<u8>, Vec<u8>)> = None;
    while let Some((key, value)) = item {
        if let Some((lk, lv)) = &last {
            assert!((lk.as_slice(), lv.as_slice()) < (key.as_ref(), value.as_ref()));
        }
        last = Some((key.to_vec(), value.to_vec()));
        *per_key.entry(key.to_vec()).or_default() += 1;
        item = cursor.next(&txn).unwrap();
    }
    for key in ["alpha", "beta"] {
        assert_eq!(per_key[key.as_bytes()], db.dup_count(&txn, key.as_bytes()).unwrap());
        assert_eq!(per_key[key.as_bytes()], 12);
    }
}

#[test]
fn test_subpage_converts_to_nested_tree_and_back() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("grow"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();

    // ~110 bytes per encoded value: 30 of them cross the half-page threshold
    let values: Vec<String> = (0..30).map(|i| format!("{i:03}-{}", "x".repeat(100))).collect();
    for v in &values {
        db.put(&mut txn, b"big", v.as_bytes(), PutFlags::empty()).unwrap();
    }
    assert_eq!(db.dup_count(&txn, b"big").unwrap(), 30);
    txn.commit().unwrap();

    // all values survive the conversion, in order
    let txn = env.read_txn().unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();
    let mut got = Vec::new();
    let mut item = cursor.seek_exact(&txn, b"big").unwrap();
    while let Some((key, value)) = item {
        if key.as_ref() != b"big" {
            break;
        }
        got.push(String::from_utf8(value.to_vec()).unwrap());
        item = cursor.next(&txn).unwrap();
    }
    assert_eq!(got, values);
    drop(txn);

    // shrink back below the inline threshold
    let mut txn = env.write_txn().unwrap();
    for v in &values[2..] {
        assert!(db.del(&mut txn, b"big", Some(v.as_bytes())).unwrap());
    }
    assert_eq!(db.dup_count(&txn, b"big").unwrap(), 2);
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap().as_ref(), values[0].as_bytes());
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(db.dup_count(&txn, b"big").unwrap(), 2);
}

#[test]
fn test_dupfix_dense_values() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(
            &mut txn,
            Some("fixed"),
            DatabaseFlags::DUP_SORT | DatabaseFlags::DUP_FIXED | DatabaseFlags::CREATE,
        )
        .unwrap();

    for i in 0..2000u64 {
        db.put(&mut txn, b"series", &i.to_be_bytes(), PutFlags::empty()).unwrap();
    }
    assert_eq!(db.dup_count(&txn, b"series").unwrap(), 2000);
    // a mismatched width is rejected outright
    assert!(db.put(&mut txn, b"series", b"short", PutFlags::empty()).is_err());
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    let mut cursor = Cursor::new(&txn, &db).unwrap();
    let mut count = 0u64;
    let mut item = cursor.first(&txn).unwrap();
    while let Some((_, value)) = item {
        assert_eq!(value.len(), 8);
        let decoded = u64::from_be_bytes(value.as_ref().try_into().unwrap());
        assert_eq!(decoded, count);
        count += 1;
        item = cursor.next(&txn).unwrap();
    }
    assert_eq!(count, 2000);
}

#[test]
fn test_delete_specific_dup() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let mut txn = env.write_txn().unwrap();
    let db = env
        .create_database(&mut txn, Some("d"), DatabaseFlags::DUP_SORT | DatabaseFlags::CREATE)
        .unwrap();
    for v in [b"one".as_slice(), b"two", b"three"] {
        db.put(&mut txn, b"k", v, PutFlags::empty()).unwrap();
    }
    assert!(db.del(&mut txn, b"k", Some(&b"two"[..])).unwrap());
    assert_eq!(db.dup_count(&txn, b"k").unwrap(), 2);
    assert!(!db.del(&mut txn, b"k", Some(&b"two"[..])).unwrap());
    // deleting without a value removes the whole key
    assert!(db.del(&mut txn, b"k", None).unwrap());
    assert_eq!(db.entries(&txn).unwrap(), 0);
    txn.commit().unwrap();
}

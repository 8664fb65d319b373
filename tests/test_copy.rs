use burrowdb::{copy_to_file, copy_to_writer, CopyOptions, DatabaseFlags, EnvBuilder, Error, PutFlags};
use tempfile::TempDir;

fn seeded_env(dir: &TempDir) -> (burrowdb::Environment, burrowdb::Database) {
    let env = EnvBuilder::new().map_size(1 << 25).open(dir.path()).unwrap();
    let mut txn = env.write_txn().unwrap();
    let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
    for i in 0..400u32 {
        let key = format!("copy{i:04}");
        let value = format!("value-{i}").repeat(4);
        db.put(&mut txn, key.as_bytes(), value.as_bytes(), PutFlags::empty()).unwrap();
    }
    // one large value so the copy has an overflow run to carry
    db.put(&mut txn, b"zz-large", &vec![0xEE; 30_000], PutFlags::empty()).unwrap();
    txn.commit().unwrap();
    (env, db)
}

fn verify_copy(path: &std::path::Path, db: &burrowdb::Database) {
    let env = EnvBuilder::new().map_size(1 << 25).no_subdir(true).open(path).unwrap();
    let txn = env.read_txn().unwrap();
    assert_eq!(db.entries(&txn).unwrap(), 401);
    for i in (0..400u32).step_by(37) {
        let key = format!("copy{i:04}");
        let expect = format!("value-{i}").repeat(4);
        assert_eq!(db.get(&txn, key.as_bytes()).unwrap().unwrap().as_ref(), expect.as_bytes());
    }
    assert_eq!(db.get(&txn, b"zz-large").unwrap().unwrap().len(), 30_000);
}

#[test]
fn test_full_copy() {
    let dir = TempDir::new().unwrap();
    let (env, db) = seeded_env(&dir);

    let target = dir.path().join("backup.bdb");
    copy_to_file(&env, &target, CopyOptions::default()).unwrap();
    drop(env);
    verify_copy(&target, &db);
}

#[test]
fn test_copy_refuses_existing_target_without_force() {
    let dir = TempDir::new().unwrap();
    let (env, _) = seeded_env(&dir);

    let target = dir.path().join("backup.bdb");
    std::fs::write(&target, b"already here").unwrap();
    assert!(matches!(
        copy_to_file(&env, &target, CopyOptions::default()),
        Err(Error::InvalidParameter(_))
    ));
    let mut options = CopyOptions::default();
    options.force = true;
    copy_to_file(&env, &target, options).unwrap();
}

#[test]
fn test_compact_copy_round_trips_after_churn() {
    let dir = TempDir::new().unwrap();
    let (env, db) = seeded_env(&dir);

    // churn to accumulate retired pages in the file
    for round in 0..40u32 {
        let mut txn = env.write_txn().unwrap();
        let key = format!("copy{:04}", round * 7 % 400);
        db.put(&mut txn, key.as_bytes(), &[round as u8; 500], PutFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let full = dir.path().join("full.bdb");
    let compact = dir.path().join("compact.bdb");
    copy_to_file(&env, &full, CopyOptions::default()).unwrap();
    let mut options = CopyOptions::default();
    options.compact = true;
    copy_to_file(&env, &compact, options).unwrap();

    let full_blocks = std::fs::metadata(&full).unwrap().len();
    let compact_meta = std::fs::metadata(&compact).unwrap();
    // same logical length, but the compact copy holds holes
    assert_eq!(full_blocks, compact_meta.len());

    // the compacted copy still opens and reads correctly
    let env2 = EnvBuilder::new().map_size(1 << 25).no_subdir(true).open(&compact).unwrap();
    let txn = env2.read_txn().unwrap();
    assert_eq!(db.entries(&txn).unwrap(), 401);
    assert_eq!(db.get(&txn, b"zz-large").unwrap().unwrap().len(), 30_000);
}

#[test]
fn test_copy_to_writer_stream() {
    let dir = TempDir::new().unwrap();
    let (env, db) = seeded_env(&dir);

    let mut buffer = Vec::new();
    copy_to_writer(&env, &mut buffer, CopyOptions::default()).unwrap();
    assert_eq!(buffer.len() % burrowdb::PAGE_SIZE, 0);
    drop(env);

    let target = dir.path().join("streamed.bdb");
    std::fs::write(&target, &buffer).unwrap();
    verify_copy(&target, &db);
}

#[test]
fn test_dynamic_size_copy_shrinks_geometry() {
    let dir = TempDir::new().unwrap();
    let (env, db) = seeded_env(&dir);

    let target = dir.path().join("dynamic.bdb");
    let mut options = CopyOptions::default();
    options.dynamic_size = true;
    copy_to_file(&env, &target, options).unwrap();
    drop(env);

    let env = EnvBuilder::new().map_size(1 << 25).no_subdir(true).open(&target).unwrap();
    let info = env.info().unwrap();
    assert!(info.geometry.current as u64 >= info.last_pgno + 1);
    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, b"copy0000").unwrap().unwrap().as_ref(), "value-0".repeat(4).as_bytes());
}

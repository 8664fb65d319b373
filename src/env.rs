//! Environment: the open database, its files, and its registries
//!
//! An environment owns the data-file pager, the lock region, the writer
//! mutex, and the table (DBI) registry. Opening taps all three meta pages,
//! picks the recent one (demoting torn or over-reaching metas), and adopts
//! its geometry. One environment per path per process; a second open fails
//! with busy instead of silently breaking the single-writer rule.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::btree;
use crate::db::{Database, DatabaseFlags, Dbi, FIRST_USER_DBI, MAIN_DBI};
use crate::error::{Error, Result};
use crate::meta::{self, Geometry, MetaPage, TreeRecord, META_COUNT};
use crate::page::PAGE_SIZE;
use crate::pager::Pager;
use crate::reader::{ReaderTable, DEFAULT_MAX_READERS};
use crate::registry;
use crate::spill::{WriteRing, DEFAULT_DIRTY_BUDGET};
use crate::txn::{mode::Mode, Transaction, TreeState, Write};

/// Durability of commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// No syncing at all; a crash may lose recent commits
    NoSync,
    /// Data pages are fdatasync'd, the meta page is not (weak metas)
    NoMetaSync,
    /// Full sync: data, then meta, each made durable (the default)
    FullSync,
}

/// Default upper map size: 1 GiB
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;

const DATA_NAME: &str = "data.bdb";
const LOCK_NAME: &str = "lock.bdb";
const LOCK_SUFFIX: &str = "-lck";

struct DbiEntry {
    name: String,
    flags: u16,
    dupfix: u32,
    open: bool,
}

pub(crate) struct EnvInner {
    data_path: PathBuf,
    registered: PathBuf,
    pager: Pager,
    lck: ReaderTable,
    write_mutex: Mutex<()>,
    durability: Durability,
    dirty_budget: usize,
    ring: WriteRing,
    dbis: RwLock<Vec<DbiEntry>>,
    writer_dirty_dbis: Mutex<HashSet<u32>>,
    broken: AtomicBool,
    pid_at_open: AtomicU32,
}

/// An open database environment
pub struct Environment {
    inner: Arc<EnvInner>,
}

/// Builder for opening environments
pub struct EnvBuilder {
    map_size: usize,
    lower: u32,
    growth: u32,
    shrink: u32,
    max_readers: usize,
    durability: Durability,
    dirty_budget: usize,
    no_subdir: bool,
}

impl EnvBuilder {
    /// Builder with the defaults
    pub fn new() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            lower: 16,
            growth: 1024,
            shrink: 4096,
            max_readers: DEFAULT_MAX_READERS,
            durability: Durability::FullSync,
            dirty_budget: DEFAULT_DIRTY_BUDGET,
            no_subdir: false,
        }
    }

    /// Upper bound of the database size in bytes
    pub fn map_size(mut self, bytes: usize) -> Self {
        self.map_size = bytes;
        self
    }

    /// Geometry knobs, all in pages: minimum size, growth step, shrink slack
    pub fn geometry(mut self, lower: u32, growth: u32, shrink: u32) -> Self {
        self.lower = lower;
        self.growth = growth;
        self.shrink = shrink;
        self
    }

    /// Number of reader slots in the lock region
    pub fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }

    /// Commit durability mode
    pub fn durability(mut self, mode: Durability) -> Self {
        self.durability = mode;
        self
    }

    /// Dirty pages held in memory before the spill policy kicks in
    pub fn dirty_budget(mut self, pages: usize) -> Self {
        self.dirty_budget = pages.max(16);
        self
    }

    /// Treat `path` as the data file itself instead of a directory
    pub fn no_subdir(mut self, enabled: bool) -> Self {
        self.no_subdir = enabled;
        self
    }

    /// Open (creating as needed) the environment at `path`
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment> {
        let path = path.as_ref();
        let (data_path, lock_path) = if self.no_subdir {
            let mut lock = path.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            std::fs::create_dir_all(path)?;
            (path.join(DATA_NAME), path.join(LOCK_NAME))
        };

        let registered = data_path.clone();
        registry::register(registered.clone())?;
        let opened = self.open_inner(&data_path, &lock_path);
        if opened.is_err() {
            registry::unregister(&registered);
        }
        let mut inner = opened?;
        inner.registered = registered;
        Ok(Environment { inner: Arc::new(inner) })
    }

    fn open_inner(self, data_path: &Path, lock_path: &Path) -> Result<EnvInner> {
        let upper_pages = (self.map_size / PAGE_SIZE).max(self.lower as usize).max(META_COUNT + 1);
        let geometry = Geometry {
            lower: self.lower.max(META_COUNT as u32 + 1),
            current: self.lower.max(META_COUNT as u32 + 1),
            upper: upper_pages as u32,
            growth: self.growth.max(1),
            shrink: self.shrink,
            pagesize: PAGE_SIZE as u32,
        };

        let fresh = !data_path.exists();
        let pager = if fresh {
            tracing::debug!(path = %data_path.display(), "creating a new database");
            Pager::create(data_path, geometry)?
        } else {
            Pager::open(data_path, geometry)?
        };

        let lck = ReaderTable::open(lock_path, self.max_readers)?;

        // recovery: pick the recent meta among the three, demoting invalid
        let metas = pager.read_metas();
        let file_pages = pager.file().metadata()?.len() / PAGE_SIZE as u64;
        let (slot, recent) = meta::select_recent(&metas, file_pages)?;
        tracing::debug!(slot, txnid = recent.txnid.0, steady = recent.steady, "selected recent meta");
        pager.adopt(&recent)?;

        Ok(EnvInner {
            data_path: data_path.to_path_buf(),
            registered: PathBuf::new(),
            pager,
            lck,
            write_mutex: Mutex::new(()),
            durability: self.durability,
            dirty_budget: self.dirty_budget,
            ring: WriteRing::new(),
            dbis: RwLock::new(Vec::new()),
            writer_dirty_dbis: Mutex::new(HashSet::new()),
            broken: AtomicBool::new(false),
            pid_at_open: AtomicU32::new(std::process::id()),
        })
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Begin a read transaction bound to the current snapshot
    pub fn read_txn(&self) -> Result<Transaction<'_, crate::txn::Read>> {
        Transaction::new_read(self)
    }

    /// Begin the write transaction, blocking on the writer mutex
    pub fn write_txn(&self) -> Result<Transaction<'_, Write>> {
        Transaction::new_write(self, false)
    }

    /// Begin the write transaction, failing with busy if a writer is active
    pub fn try_write_txn(&self) -> Result<Transaction<'_, Write>> {
        Transaction::new_write(self, true)
    }

    /// Open a named table (or the main table with `None`)
    pub fn open_database<M: Mode>(
        &self,
        txn: &mut Transaction<'_, M>,
        name: Option<&str>,
    ) -> Result<Database> {
        let Some(name) = name else {
            let rec = txn.tree(MAIN_DBI)?;
            return Ok(Database::new(MAIN_DBI, DatabaseFlags::from_bits_truncate(rec.flags)));
        };
        // fast path: the registry already knows this table
        if let Some((dbi, flags, dupfix)) = self.lookup_dbi(name) {
            self.load_tree_into_txn(txn, dbi, name, flags, dupfix)?;
            return Ok(Database::new(dbi, DatabaseFlags::from_bits_truncate(flags)));
        }
        // slow path: look the record up in MAIN
        let main = txn.tree(MAIN_DBI)?;
        let record = match btree::get(txn, &main, name.as_bytes())? {
            Some(bytes) => TreeRecord::from_bytes(&bytes)?,
            None => return Err(Error::NotFound),
        };
        let dbi = self.register_dbi(name, record.flags, record.dupfix_size);
        self.install_tree(txn, dbi, name, record)?;
        Ok(Database::new(dbi, DatabaseFlags::from_bits_truncate(record.flags)))
    }

    /// Open a named table, creating it when missing (CREATE flag implied)
    pub fn create_database(
        &self,
        txn: &mut Transaction<'_, Write>,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> Result<Database> {
        txn.ensure_active()?;
        let wanted = flags & DatabaseFlags::PERSISTENT;
        let Some(name) = name else {
            // flags may be assigned to MAIN only while it is empty
            let mut rec = txn.tree(MAIN_DBI)?;
            if rec.entries == 0 && rec.root == TreeRecord::NO_ROOT && rec.flags != wanted.bits() {
                rec.flags = wanted.bits();
                txn.set_tree(MAIN_DBI, rec)?;
            } else if rec.flags != wanted.bits() && !wanted.is_empty() {
                return Err(Error::IncompatibleFlags("main table flags differ"));
            }
            return Ok(Database::new(MAIN_DBI, wanted));
        };

        match self.open_database(txn, Some(name)) {
            Ok(db) => {
                if db.flags() != wanted && !wanted.is_empty() {
                    return Err(Error::IncompatibleFlags("table exists with different flags"));
                }
                Ok(db)
            }
            Err(Error::NotFound) => {
                let record = TreeRecord::empty(wanted.bits(), 0);
                let dbi = self.register_dbi(name, record.flags, 0);
                self.install_tree(txn, dbi, name, record)?;
                txn.mark_tree_created(dbi);
                txn.pending_dbis.push((dbi.0, name.to_string(), record.flags, 0));
                tracing::debug!(name, dbi = dbi.0, "created table");
                Ok(Database::new(dbi, wanted))
            }
            Err(e) => Err(e),
        }
    }

    /// Close a table handle
    ///
    /// Fails with dangling-DBI when the handle was created or dirtied by a
    /// write transaction that has not finished. Closing while another
    /// thread's transaction still uses the handle is documented user error;
    /// the dirty-set check here is best-effort detection.
    pub fn dbi_close(&self, db: Database) -> Result<()> {
        let index = db.dbi().0;
        if index < FIRST_USER_DBI {
            return Err(Error::InvalidParameter("the system tables cannot be closed"));
        }
        if self.inner.writer_dirty_dbis.lock().contains(&index) {
            return Err(Error::DanglingDbi(index));
        }
        let mut dbis = self.inner.dbis.write();
        match dbis.get_mut((index - FIRST_USER_DBI) as usize) {
            Some(entry) if entry.open => {
                entry.open = false;
                Ok(())
            }
            _ => Err(Error::BadDbi(index)),
        }
    }

    /// Flush the data file to stable storage
    pub fn sync(&self) -> Result<()> {
        self.inner.pager.sync_all()
    }

    /// Database statistics from the main table's record
    pub fn stat(&self) -> Result<Stat> {
        let meta = self.load_recent_meta()?;
        Ok(Stat {
            page_size: PAGE_SIZE as u32,
            depth: meta.main.depth as u32,
            branch_pages: meta.main.branch_pages,
            leaf_pages: meta.main.leaf_pages,
            large_pages: meta.main.large_pages,
            entries: meta.main.entries,
        })
    }

    /// Environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.load_recent_meta()?;
        Ok(EnvInfo {
            geometry: self.inner.pager.geometry(),
            last_pgno: meta.last_pgno,
            recent_txnid: meta.txnid.0,
            retired_pages: meta.retired,
            readers: self.inner.lck.enumerate().len(),
            max_readers: self.inner.lck.capacity(),
        })
    }

    /// Prefault the data file into memory; with `lock` the pages are also
    /// pinned resident
    #[cfg(unix)]
    pub fn warmup(&self, lock: bool) -> Result<()> {
        self.inner.pager.warmup(lock)
    }

    /// Re-arm the environment in a forked child
    ///
    /// The child shares the parent's mapping but owns none of its reader
    /// slots or its writer lock. Re-reads and validates the recent meta;
    /// transactions begun afterwards see the latest committed state.
    pub fn resurrect_after_fork(&self) -> Result<()> {
        let pid = std::process::id();
        if self.inner.pid_at_open.swap(pid, Ordering::AcqRel) == pid {
            return Ok(());
        }
        self.inner.broken.store(false, Ordering::Release);
        let metas = self.inner.pager.read_metas();
        let file_pages = self.inner.pager.file().metadata()?.len() / PAGE_SIZE as u64;
        let (_, recent) = meta::select_recent(&metas, file_pages)?;
        self.inner.pager.adopt(&recent)?;
        tracing::debug!(pid, txnid = recent.txnid.0, "environment resurrected after fork");
        Ok(())
    }

    /// Count of stale reader slots cleared
    pub fn reap_stale_readers(&self) -> usize {
        self.inner.lck.reap_stale()
    }

    // --- crate-internal plumbing -------------------------------------------

    pub(crate) fn pager(&self) -> &Pager {
        &self.inner.pager
    }

    pub(crate) fn lck(&self) -> &ReaderTable {
        &self.inner.lck
    }

    pub(crate) fn ring(&self) -> &WriteRing {
        &self.inner.ring
    }

    pub(crate) fn write_mutex(&self) -> &Mutex<()> {
        &self.inner.write_mutex
    }

    pub(crate) fn durability(&self) -> Durability {
        self.inner.durability
    }

    pub(crate) fn dirty_budget(&self) -> usize {
        self.inner.dirty_budget
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.inner.data_path
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.inner.broken.load(Ordering::Acquire) {
            return Err(Error::Panic("environment is broken; close and reopen".into()));
        }
        Ok(())
    }

    /// Mark the environment broken after an invariant violation
    pub(crate) fn mark_broken(&self) {
        self.inner.broken.store(true, Ordering::Release);
        registry::debug_emit(
            tracing::Level::ERROR,
            "env",
            &format!("environment {} marked broken", self.inner.data_path.display()),
        );
    }

    /// Decode the recent meta from the mapped meta pages
    pub(crate) fn load_recent_meta(&self) -> Result<MetaPage> {
        let mut metas: [Result<MetaPage>; META_COUNT] =
            [Err(Error::InvalidMeta), Err(Error::InvalidMeta), Err(Error::InvalidMeta)];
        for (slot, entry) in metas.iter_mut().enumerate() {
            *entry = self
                .inner
                .pager
                .page(crate::error::PageId(slot as u64))
                .and_then(MetaPage::from_page);
        }
        let file_pages = self.inner.pager.current_pages();
        let (_, recent) = meta::select_recent(&metas, file_pages)?;
        Ok(recent)
    }

    pub(crate) fn note_dbi_dirty(&self, dbi: u32) {
        self.inner.writer_dirty_dbis.lock().insert(dbi);
    }

    pub(crate) fn clear_writer_dbis(&self) {
        self.inner.writer_dirty_dbis.lock().clear();
    }

    pub(crate) fn publish_dbis(&self, pending: Vec<(u32, String, u16, u32)>) {
        if pending.is_empty() {
            return;
        }
        let mut dbis = self.inner.dbis.write();
        for (dbi, name, flags, dupfix) in pending {
            let index = (dbi - FIRST_USER_DBI) as usize;
            if index >= dbis.len() {
                continue;
            }
            dbis[index] = DbiEntry { name, flags, dupfix, open: true };
        }
    }

    /// Close the registry entries of tables dropped by a commit
    pub(crate) fn retire_dbis(&self, dropped: &[u32]) {
        if dropped.is_empty() {
            return;
        }
        let mut dbis = self.inner.dbis.write();
        for dbi in dropped {
            if *dbi < FIRST_USER_DBI {
                continue;
            }
            if let Some(entry) = dbis.get_mut((dbi - FIRST_USER_DBI) as usize) {
                entry.open = false;
            }
        }
    }

    fn lookup_dbi(&self, name: &str) -> Option<(Dbi, u16, u32)> {
        let dbis = self.inner.dbis.read();
        dbis.iter().enumerate().find_map(|(i, e)| {
            (e.open && e.name == name)
                .then_some((Dbi(i as u32 + FIRST_USER_DBI), e.flags, e.dupfix))
        })
    }

    fn register_dbi(&self, name: &str, flags: u16, dupfix: u32) -> Dbi {
        let mut dbis = self.inner.dbis.write();
        // reuse a closed slot first
        if let Some(i) = dbis.iter().position(|e| !e.open) {
            dbis[i] = DbiEntry { name: name.to_string(), flags, dupfix, open: true };
            return Dbi(i as u32 + FIRST_USER_DBI);
        }
        dbis.push(DbiEntry { name: name.to_string(), flags, dupfix, open: true });
        Dbi(dbis.len() as u32 - 1 + FIRST_USER_DBI)
    }

    fn load_tree_into_txn<M: Mode>(
        &self,
        txn: &mut Transaction<'_, M>,
        dbi: Dbi,
        name: &str,
        flags: u16,
        dupfix: u32,
    ) -> Result<()> {
        let index = dbi.0 as usize;
        if txn.trees.len() > index && txn.trees[index].is_some() {
            return Ok(());
        }
        let main = txn.tree(MAIN_DBI)?;
        let record = match btree::get(txn, &main, name.as_bytes())? {
            Some(bytes) => TreeRecord::from_bytes(&bytes)?,
            // registered but not yet committed by another txn: treat as empty
            None => TreeRecord::empty(flags, dupfix),
        };
        self.install_tree(txn, dbi, name, record)
    }

    fn install_tree<M: Mode>(
        &self,
        txn: &mut Transaction<'_, M>,
        dbi: Dbi,
        name: &str,
        record: TreeRecord,
    ) -> Result<()> {
        let index = dbi.0 as usize;
        while txn.trees.len() <= index {
            txn.trees.push(None);
        }
        txn.trees[index] = Some(TreeState::new(record, Some(name.to_string())));
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.inner.lck.drop_pid(std::process::id());
        registry::unregister(&self.inner.registered);
    }
}

/// Statistics of the main table
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Page size in bytes
    pub page_size: u32,
    /// Depth of the main tree
    pub depth: u32,
    /// Branch pages
    pub branch_pages: u64,
    /// Leaf pages
    pub leaf_pages: u64,
    /// Large (overflow) pages
    pub large_pages: u64,
    /// Items in the main table
    pub entries: u64,
}

/// Environment information
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    /// Current geometry
    pub geometry: Geometry,
    /// Highest allocated page
    pub last_pgno: u64,
    /// Txnid of the recent meta
    pub recent_txnid: u64,
    /// Total retired pages
    pub retired_pages: u64,
    /// Live reader slots
    pub readers: usize,
    /// Reader slot capacity
    pub max_readers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_env_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let env = EnvBuilder::new().map_size(1 << 22).open(dir.path()).unwrap();
            let stat = env.stat().unwrap();
            assert_eq!(stat.page_size, PAGE_SIZE as u32);
            assert_eq!(stat.entries, 0);
        }
        {
            let env = EnvBuilder::new().map_size(1 << 22).open(dir.path()).unwrap();
            let info = env.info().unwrap();
            assert_eq!(info.recent_txnid, 0);
        }
    }

    #[test]
    fn test_double_open_is_busy() {
        let dir = TempDir::new().unwrap();
        let _env = EnvBuilder::new().map_size(1 << 22).open(dir.path()).unwrap();
        assert!(matches!(
            EnvBuilder::new().map_size(1 << 22).open(dir.path()),
            Err(Error::Busy)
        ));
    }

    #[test]
    fn test_no_subdir_layout() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("single.bdb");
        let env = EnvBuilder::new().map_size(1 << 22).no_subdir(true).open(&file).unwrap();
        drop(env);
        assert!(file.exists());
        let mut lock = file.as_os_str().to_owned();
        lock.push(LOCK_SUFFIX);
        assert!(PathBuf::from(lock).exists());
    }

    #[test]
    fn test_resurrect_same_pid_is_noop() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(1 << 22).open(dir.path()).unwrap();
        env.resurrect_after_fork().unwrap();
        let txn = env.read_txn().unwrap();
        assert_eq!(txn.id().0, 0);
    }
}

//! Transaction lifecycle: begin, commit, abort, nested, park
//!
//! A transaction binds a snapshot (txnid + roots) at begin. Readers pin a
//! slot in the lock region and never touch disk again until release; the
//! single writer owns the dirty set, the GC state, and the page allocator.
//! Commit follows the fixed sequence: named-tree records into MAIN, GC
//! convergence, data pages through the write ring, fdatasync, meta page,
//! fsync. The meta write is the linearization point.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use parking_lot::MutexGuard;

use crate::db::{Dbi, GC_DBI, MAIN_DBI};
use crate::env::{Durability, Environment};
use crate::error::{Error, PageId, Result, TxnId};
use crate::gc::{self, GcState, GC_MAX_PASSES};
use crate::meta::{MetaPage, TreeRecord};
use crate::page::{Page, PageFlags, PageHeader, PAGE_SIZE};
use crate::reader::{current_tid, ReaderSnapshot};
use crate::spill::{DirtySet, Shadow};

/// Transaction mode marker traits
pub mod mode {
    /// Sealed trait for transaction modes
    pub(crate) mod sealed {
        pub trait Sealed {}
    }

    /// Transaction mode trait
    pub trait Mode: sealed::Sealed {
        /// Whether this is a write transaction
        const IS_WRITE: bool;
    }
}

/// Read-only transaction mode
#[derive(Debug)]
pub struct Read;

impl mode::sealed::Sealed for Read {}
impl mode::Mode for Read {
    const IS_WRITE: bool = false;
}

/// Read-write transaction mode
#[derive(Debug)]
pub struct Write;

impl mode::sealed::Sealed for Write {}
impl mode::Mode for Write {
    const IS_WRITE: bool = true;
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Created, snapshot not yet bound
    New,
    /// Snapshot bound, operations allowed
    Active,
    /// Reader slot released, handle retained
    Parked,
    /// Commit finished
    Committed,
    /// Rolled back
    Aborted,
    /// Poisoned by an error; only abort is allowed
    Error,
}

/// Per-transaction view of one table
#[derive(Clone)]
pub(crate) struct TreeState {
    /// The tree record as this transaction sees it
    pub(crate) record: TreeRecord,
    /// Table name (None for GC/MAIN)
    pub(crate) name: Option<String>,
    /// Record changed and must be persisted at commit
    pub(crate) dirty: bool,
    /// Table dropped; delete its record from MAIN at commit
    pub(crate) dropped: bool,
    /// Bumped on drop/clear; outstanding cursors turn "poor"
    pub(crate) seq: u64,
}

impl TreeState {
    pub(crate) fn new(record: TreeRecord, name: Option<String>) -> Self {
        Self { record, name, dirty: false, dropped: false, seq: 0 }
    }
}

/// Writer guard: in-process mutex + cross-process range lock
pub(crate) struct WriterGuard<'env> {
    env: &'env Environment,
    _mutex: MutexGuard<'env, ()>,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.env.lck().unlock_writer();
        self.env.clear_writer_dbis();
    }
}

/// Mode-specific transaction data
pub(crate) enum ModeData<'env> {
    /// Read transaction data
    Read {
        /// Claimed reader slot, if any (parked readers hold none)
        slot: Option<usize>,
    },
    /// Write transaction data
    Write(Box<WriteState<'env>>),
}

/// Write-transaction state
pub(crate) struct WriteState<'env> {
    pub(crate) guard: Option<WriterGuard<'env>>,
    pub(crate) dirty: DirtySet,
    pub(crate) gc: GcState,
    /// Next fresh pgno past the end of allocated space
    pub(crate) next_pgno: u64,
    /// Pages first allocated by this transaction (free goes back to pool)
    pub(crate) allocated: BTreeSet<u64>,
    /// Monotonic total of retired pages, carried into the meta
    pub(crate) retired_total: u64,
    pub(crate) canary: [u64; 4],
    /// Cursor-pinned pgnos, exempt from spilling
    pub(crate) pins: std::cell::RefCell<std::collections::HashMap<u64, Vec<u64>>>,
    /// Nested transactions suspend spilling
    pub(crate) nested_depth: u32,
}

/// A database transaction
pub struct Transaction<'env, M: mode::Mode> {
    pub(crate) env: &'env Environment,
    pub(crate) id: TxnId,
    pub(crate) state: TxnState,
    pub(crate) trees: Vec<Option<TreeState>>,
    pub(crate) mode_data: ModeData<'env>,
    pub(crate) owner_tid: u64,
    /// New named tables to publish in the env registry on commit
    pub(crate) pending_dbis: Vec<(u32, String, u16, u32)>,
    _mode: PhantomData<M>,
}

/// Type alias for a read-only transaction
pub type ReadTransaction<'env> = Transaction<'env, Read>;

/// Type alias for a read-write transaction
pub type WriteTransaction<'env> = Transaction<'env, Write>;

fn trees_from_meta(meta: &MetaPage) -> Vec<Option<TreeState>> {
    vec![
        Some(TreeState::new(meta.gc, None)),
        Some(TreeState::new(meta.main, None)),
    ]
}

impl<'env> Transaction<'env, Read> {
    pub(crate) fn new_read(env: &'env Environment) -> Result<Self> {
        env.ensure_usable()?;
        let lck = env.lck();
        let mut meta = env.load_recent_meta()?;
        let pid = std::process::id();
        let tid = current_tid();
        let slot = lck.acquire(ReaderSnapshot {
            pid,
            tid,
            txnid: meta.txnid,
            last_pgno: meta.last_pgno,
            retired: meta.retired,
        })?;
        // the writer may have committed between the meta read and the slot
        // publication; re-read until the published snapshot is current
        loop {
            let again = env.load_recent_meta()?;
            if again.txnid == meta.txnid {
                break;
            }
            meta = again;
            lck.update(
                slot,
                ReaderSnapshot {
                    pid,
                    tid,
                    txnid: meta.txnid,
                    last_pgno: meta.last_pgno,
                    retired: meta.retired,
                },
            )?;
        }
        Ok(Self {
            env,
            id: meta.txnid,
            state: TxnState::Active,
            trees: trees_from_meta(&meta),
            mode_data: ModeData::Read { slot: Some(slot) },
            owner_tid: tid,
            pending_dbis: Vec::new(),
            _mode: PhantomData,
        })
    }

    /// Release the reader slot but keep the handle; GC may reclaim pages
    /// this snapshot was pinning
    pub fn park(&mut self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(Error::TxnFinished);
        }
        if let ModeData::Read { slot } = &mut self.mode_data {
            if let Some(index) = slot.take() {
                self.env.lck().release(index);
            }
        }
        self.state = TxnState::Parked;
        Ok(())
    }

    /// Re-arm a parked reader with a fresh snapshot; the observed txnid may
    /// be newer than before parking
    pub fn resume(&mut self) -> Result<()> {
        if self.state != TxnState::Parked {
            return Err(Error::BadReaderSlot);
        }
        let mut fresh = Transaction::new_read(self.env)?;
        self.id = fresh.id;
        std::mem::swap(&mut self.trees, &mut fresh.trees);
        // the parked handle holds no slot, so the swapped-out remains drop clean
        std::mem::swap(&mut self.mode_data, &mut fresh.mode_data);
        self.state = TxnState::Active;
        fresh.state = TxnState::Aborted;
        Ok(())
    }
}

impl<'env> Transaction<'env, Write> {
    pub(crate) fn new_write(env: &'env Environment, nonblocking: bool) -> Result<Self> {
        env.ensure_usable()?;
        let mutex = if nonblocking {
            env.write_mutex().try_lock().ok_or(Error::Busy)?
        } else {
            env.write_mutex().lock()
        };
        #[cfg(unix)]
        env.lck().lock_writer(!nonblocking)?;
        let guard = WriterGuard { env, _mutex: mutex };

        env.lck().reap_stale();
        let meta = env.load_recent_meta()?;
        let id = TxnId(meta.txnid.0 + 1);
        Ok(Self {
            env,
            id,
            state: TxnState::Active,
            trees: trees_from_meta(&meta),
            mode_data: ModeData::Write(Box::new(WriteState {
                guard: Some(guard),
                dirty: DirtySet::new(),
                gc: GcState::new(),
                next_pgno: meta.last_pgno + 1,
                allocated: BTreeSet::new(),
                retired_total: meta.retired,
                canary: meta.canary,
                pins: std::cell::RefCell::new(std::collections::HashMap::new()),
                nested_depth: 0,
            })),
            owner_tid: current_tid(),
            pending_dbis: Vec::new(),
            _mode: PhantomData,
        })
    }

    pub(crate) fn write_state(&mut self) -> &mut WriteState<'env> {
        match &mut self.mode_data {
            ModeData::Write(w) => w,
            ModeData::Read { .. } => unreachable!("write state on a read transaction"),
        }
    }

    pub(crate) fn write_state_ref(&self) -> &WriteState<'env> {
        match &self.mode_data {
            ModeData::Write(w) => w,
            ModeData::Read { .. } => unreachable!("write state on a read transaction"),
        }
    }

    /// Reject operations on finished/poisoned transactions or foreign threads
    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => {}
            TxnState::Error => return Err(Error::TxnPoisoned),
            _ => return Err(Error::TxnFinished),
        }
        if self.owner_tid != current_tid() {
            return Err(Error::ThreadMismatch);
        }
        Ok(())
    }

    /// Transition to the ERROR state on a poisoning failure
    pub(crate) fn note_error(&mut self, err: &Error) {
        if err.poisons_txn() {
            tracing::debug!(txnid = self.id.0, %err, "write transaction poisoned");
            self.state = TxnState::Error;
        }
    }

    // --- page allocation --------------------------------------------------

    fn alloc_pgno(&mut self, span: u64) -> Result<PageId> {
        let oldest = self.env.lck().oldest();
        let own_id = self.id;
        {
            let w = self.write_state();
            let hit = if span == 1 { w.gc.alloc() } else { w.gc.alloc_run(span) };
            if let Some(pgno) = hit {
                w.allocated.extend(pgno.0..pgno.0 + span);
                return Ok(pgno);
            }
        }
        // pull reclaimable GC entries under the reader horizon into the pool
        crate::btree::gc_reclaim(self, oldest, own_id)?;
        {
            let w = self.write_state();
            let hit = if span == 1 { w.gc.alloc() } else { w.gc.alloc_run(span) };
            if let Some(pgno) = hit {
                w.allocated.extend(pgno.0..pgno.0 + span);
                return Ok(pgno);
            }
        }
        // extend the file inside the geometry
        let w = self.write_state();
        let pgno = w.next_pgno;
        self.env.pager().ensure_pages(pgno + span)?;
        let w = self.write_state();
        w.next_pgno = pgno + span;
        w.allocated.extend(pgno..pgno + span);
        Ok(PageId(pgno))
    }

    /// Allocate a fresh single page with a zeroed dirty shadow
    pub(crate) fn alloc_page(&mut self, flags: PageFlags) -> Result<PageId> {
        let pgno = self.alloc_pgno(1)?;
        let id = self.id;
        let page = Page::new(pgno, id, flags | PageFlags::DIRTY);
        self.write_state().dirty.insert(Shadow::Single(page));
        self.maybe_spill()?;
        Ok(pgno)
    }

    /// Allocate a large run sized for `logical_len` payload bytes
    pub(crate) fn alloc_large(&mut self, logical_len: usize) -> Result<(PageId, u64)> {
        let span = Page::large_run_length(logical_len) as u64;
        let head = self.alloc_pgno(span)?;
        let mut buf = vec![0u8; span as usize * PAGE_SIZE].into_boxed_slice();
        let header = PageHeader {
            pgno: head.0,
            txnid: self.id.0,
            flags: PageFlags::LARGE | PageFlags::DIRTY,
            lower: PageHeader::SIZE as u16,
            upper: PAGE_SIZE as u16,
            dupfix: 0,
            pages: span as u32,
            reserved: 0,
        };
        encode_header(&mut buf, &header);
        self.write_state().dirty.insert(Shadow::Large(buf));
        self.maybe_spill()?;
        Ok((head, span))
    }

    /// Copy-on-write: make `pgno` writable, returning its (possibly new)
    /// page number. Parents must patch their child pointers afterwards.
    pub(crate) fn touch(&mut self, pgno: PageId) -> Result<PageId> {
        if self.write_state_ref().dirty.contains(pgno) {
            if self.write_state_ref().dirty.is_spilled(pgno) {
                self.dirty_page_mut(pgno)?;
            }
            return Ok(pgno);
        }
        let new_pgno = self.alloc_pgno(1)?;
        let id = self.id;
        let mut shadow = self.env.pager().page(pgno)?.clone_box();
        shadow.header.pgno = new_pgno.0;
        shadow.header.txnid = id.0;
        shadow.header.flags |= PageFlags::DIRTY;
        let w = self.write_state();
        w.gc.retire(pgno);
        w.dirty.insert(Shadow::Single(shadow));
        self.maybe_spill()?;
        Ok(new_pgno)
    }

    /// Retire a page (or return it to the pool if it never hit a commit)
    pub(crate) fn free_page(&mut self, pgno: PageId) {
        let w = self.write_state();
        if w.allocated.remove(&pgno.0) {
            w.dirty.remove(pgno);
            w.gc.repool(pgno);
        } else {
            w.gc.retire(pgno);
        }
    }

    /// Retire a large run
    pub(crate) fn free_run(&mut self, head: PageId, span: u64) {
        let w = self.write_state();
        let fresh = w.allocated.contains(&head.0);
        if fresh {
            for p in head.0..head.0 + span {
                w.allocated.remove(&p);
                w.gc.repool(PageId(p));
            }
            w.dirty.remove(head);
        } else {
            w.gc.retire_run(head, span);
        }
    }

    /// Mutable access to a dirty page; spilled shadows resurrect from their
    /// final location first
    pub(crate) fn dirty_page_mut(&mut self, pgno: PageId) -> Result<&mut Page> {
        if self.write_state_ref().dirty.is_spilled(pgno) {
            let mut page = {
                let bound = self.write_state_ref().next_pgno;
                self.env.pager().page_at(pgno, bound)?.clone_box()
            };
            page.header.flags |= PageFlags::DIRTY;
            self.write_state().dirty.unspill(Shadow::Single(page));
        }
        match self.write_state().dirty.touch(pgno) {
            Some(Shadow::Single(page)) => Ok(page),
            _ => Err(Error::Corruption {
                details: "expected a resident dirty page".into(),
                pgno: Some(pgno),
            }),
        }
    }

    /// Mutable access to a dirty large run, resurrecting it when spilled
    pub(crate) fn dirty_large_mut(&mut self, pgno: PageId) -> Result<&mut [u8]> {
        if self.write_state_ref().dirty.is_spilled(pgno) {
            let buf = {
                let bound = self.write_state_ref().next_pgno;
                let head = self.env.pager().page_at(pgno, bound)?;
                let span = head.header.pages as u64;
                self.env.pager().run_bytes(pgno, span, bound)?.to_vec().into_boxed_slice()
            };
            let mut buf = buf;
            let flags = crate::unaligned::peek_u16(&buf, 16) | PageFlags::DIRTY.bits();
            crate::unaligned::poke_u16(&mut buf, 16, flags);
            self.write_state().dirty.unspill(Shadow::Large(buf));
        }
        match self.write_state().dirty.touch(pgno) {
            Some(Shadow::Large(buf)) => Ok(buf),
            _ => Err(Error::Corruption {
                details: "expected a resident dirty large run".into(),
                pgno: Some(pgno),
            }),
        }
    }

    fn maybe_spill(&mut self) -> Result<()> {
        let budget = self.env.dirty_budget();
        {
            let w = self.write_state_ref();
            if w.nested_depth > 0 || w.dirty.resident() <= budget {
                return Ok(());
            }
        }
        self.spill()
    }

    /// Write the least-recently-touched unpinned shadows to their final
    /// locations and drop their buffers
    pub(crate) fn spill(&mut self) -> Result<()> {
        let pinned: std::collections::HashSet<u64> = self
            .write_state_ref()
            .pins
            .borrow()
            .values()
            .flat_map(|v| v.iter().copied())
            .collect();
        let candidates = self
            .write_state_ref()
            .dirty
            .spill_candidates(&|p| pinned.contains(&p.0));
        if candidates.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = candidates.len(), "spilling dirty pages");
        let mut shadows = Vec::with_capacity(candidates.len());
        for pgno in &candidates {
            if let Some(mut shadow) = self.write_state().dirty.remove(*pgno) {
                shadow.strip_volatile_flags();
                shadows.push(shadow);
            }
        }
        shadows.sort_unstable_by_key(|s| s.pgno().0);
        let pager = self.env.pager();
        let lck = self.env.lck();
        self.env
            .ring()
            .write_all(pager.file(), &shadows, |pgno, bytes| pager.coherency_check(lck, pgno, bytes))?;
        for shadow in shadows {
            let pgno = shadow.pgno();
            let span = shadow.span();
            self.write_state().dirty.insert_spilled(pgno, span);
        }
        Ok(())
    }

    /// Note a table created by this transaction (dangling-DBI detection)
    pub(crate) fn mark_tree_created(&mut self, dbi: Dbi) {
        if let Some(Some(state)) = self.trees.get_mut(dbi.0 as usize) {
            state.dirty = true;
        }
        self.env.note_dbi_dirty(dbi.0);
    }

    /// Begin a nested write transaction
    ///
    /// The child snapshots the parent's dirty list, tree states, and GC
    /// state; committing keeps the changes in the parent, aborting restores
    /// the snapshot.
    pub fn begin_nested(&mut self) -> Result<NestedTransaction<'_, 'env>> {
        self.ensure_active()?;
        let backup = NestedBackup {
            trees: self.trees.clone(),
            dirty: self.write_state_ref().dirty.snapshot(),
            gc: self.write_state_ref().gc.clone(),
            next_pgno: self.write_state_ref().next_pgno,
            allocated: self.write_state_ref().allocated.clone(),
            pending_dbis: self.pending_dbis.clone(),
        };
        self.write_state().nested_depth += 1;
        Ok(NestedTransaction { parent: self, backup: Some(backup), finished: false })
    }

    /// Abort and roll back every change
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if matches!(self.state, TxnState::Active | TxnState::Error) {
            // tables created but never committed leave the registry again
            let unpublished: Vec<u32> =
                self.pending_dbis.drain(..).map(|(dbi, _, _, _)| dbi).collect();
            self.env.retire_dbis(&unpublished);
            let w = self.write_state();
            w.dirty.clear();
            w.guard.take();
            self.state = TxnState::Aborted;
        }
    }

    /// Commit the transaction; the meta write is the linearization point
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        match self.commit_inner() {
            Ok(()) => {
                self.state = TxnState::Committed;
                let w = self.write_state();
                w.guard.take();
                Ok(())
            }
            Err(err) => {
                tracing::warn!(txnid = self.id.0, %err, "commit failed");
                if matches!(err, Error::Panic(_)) {
                    self.env.mark_broken();
                }
                self.note_error(&err);
                self.abort_in_place();
                Err(err)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        let durability = self.env.durability();

        // 1. flush named-tree records into MAIN
        self.flush_tree_records()?;

        // 2. GC convergence: persist the retired set, retire-as-you-edit
        self.converge_gc()?;

        let nothing_written = {
            let w = self.write_state_ref();
            w.dirty.is_empty() && !self.trees.iter().flatten().any(|t| t.dirty)
        };
        if nothing_written {
            return Ok(());
        }

        // 3. data pages through the write ring
        let mut shadows = self.write_state().dirty.take_resident_sorted();
        for shadow in &mut shadows {
            shadow.strip_volatile_flags();
        }
        let pager = self.env.pager();
        let lck = self.env.lck();
        self.env
            .ring()
            .write_all(pager.file(), &shadows, |pgno, bytes| pager.coherency_check(lck, pgno, bytes))?;
        drop(shadows);

        // 4. make data durable before the meta references it
        if durability != Durability::NoSync {
            pager.sync_data()?;
        }

        // 5. the next meta page
        let w = self.write_state_ref();
        let mut geometry = pager.geometry();
        geometry.current = pager.current_pages() as u32;
        let meta = MetaPage {
            geometry,
            gc: self.tree(GC_DBI)?,
            main: self.tree(MAIN_DBI)?,
            last_pgno: w.next_pgno - 1,
            txnid: self.id,
            retired: w.retired_total + w.gc.retired_len() as u64,
            canary: w.canary,
            steady: durability == Durability::FullSync,
        };
        let meta_page = meta.to_page(crate::meta::meta_slot(self.id));
        pager.write_page(&meta_page)?;

        // 6. make the commit durable
        if durability == Durability::FullSync {
            pager.sync_all()?;
        }

        // publish
        pager.set_first_unallocated(meta.last_pgno + 1);
        pager.maybe_shrink(meta.last_pgno + 1)?;
        self.env.publish_dbis(std::mem::take(&mut self.pending_dbis));
        let dropped: Vec<u32> = self
            .trees
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().filter(|t| t.dropped).map(|_| i as u32))
            .collect();
        self.env.retire_dbis(&dropped);
        tracing::trace!(txnid = self.id.0, last_pgno = meta.last_pgno, "committed");
        Ok(())
    }

    fn flush_tree_records(&mut self) -> Result<()> {
        let mut main = self.tree(MAIN_DBI)?;
        let mut main_touched = false;
        for dbi in 2..self.trees.len() as u32 {
            let Some(state) = self.trees[dbi as usize].clone() else { continue };
            let Some(name) = state.name.clone() else { continue };
            if state.dropped {
                match crate::btree::del(self, &mut main, name.as_bytes(), None) {
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                main_touched = true;
            } else if state.dirty {
                let bytes = state.record.to_bytes();
                crate::btree::put(
                    self,
                    &mut main,
                    name.as_bytes(),
                    &bytes,
                    crate::db::PutFlags::empty(),
                )?;
                main_touched = true;
            }
        }
        if main_touched {
            self.set_tree(MAIN_DBI, main)?;
        }
        Ok(())
    }

    fn converge_gc(&mut self) -> Result<()> {
        let own_key = gc::encode_key(self.id);
        for pass in 1..=GC_MAX_PASSES {
            let before = self.write_state_ref().gc.fingerprint();
            let mut gc_tree = self.tree(GC_DBI)?;

            // delete the entries we consumed into the pool
            for key in self.write_state_ref().gc.consumed_keys() {
                match crate::btree::del(self, &mut gc_tree, &key.to_le_bytes(), None) {
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }

            // upsert our own entry: retired pages plus leftover pool pages
            // (the latter left their old entries, which are gone above)
            let mut pages = self.write_state_ref().gc.retired_sorted();
            pages.extend(self.write_state_ref().gc.unused_repool());
            pages.sort_unstable();
            pages.dedup();
            if pages.is_empty() {
                match crate::btree::del(self, &mut gc_tree, &own_key, None) {
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            } else {
                let value = gc::encode_pages(&pages);
                crate::btree::put(self, &mut gc_tree, &own_key, &value, crate::db::PutFlags::empty())?;
            }
            self.set_tree(GC_DBI, gc_tree)?;

            if crate::registry::runtime_flags().contains(crate::registry::RuntimeFlags::GC_TRACE) {
                tracing::debug!(
                    pass,
                    retired = self.write_state_ref().gc.retired_len(),
                    pooled = self.write_state_ref().gc.repool_len(),
                    "gc convergence pass"
                );
            }
            if self.write_state_ref().gc.fingerprint() == before {
                tracing::trace!(passes = pass, "gc converged");
                return Ok(());
            }
        }
        Err(Error::Panic("GC did not converge within the pass budget".into()))
    }
}

impl<'env, M: mode::Mode> Transaction<'env, M> {
    /// The transaction id (snapshot id for readers)
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Whether this is a write transaction
    pub fn is_write(&self) -> bool {
        M::IS_WRITE
    }

    /// View a page: the writer's shadow if present, the map otherwise
    pub(crate) fn page(&self, pgno: PageId) -> Result<&Page> {
        if M::IS_WRITE {
            if let ModeData::Write(w) = &self.mode_data {
                if let Some(Shadow::Single(page)) = w.dirty.peek(pgno) {
                    return Ok(page);
                }
                // spilled pages and fresh writes live past the committed
                // high-water mark but inside this txn's allocation
                return self.env.pager().page_at(pgno, w.next_pgno);
            }
        }
        self.env.pager().page(pgno)
    }

    /// Bytes of a large value stored at `head`
    pub(crate) fn large_bytes(&self, head: PageId, logical_len: usize) -> Result<&[u8]> {
        let span = Page::large_run_length(logical_len) as u64;
        if M::IS_WRITE {
            if let ModeData::Write(w) = &self.mode_data {
                if let Some(Shadow::Large(buf)) = w.dirty.peek(head) {
                    return Ok(&buf[PageHeader::SIZE..PageHeader::SIZE + logical_len]);
                }
                let run = self.env.pager().run_bytes(head, span, w.next_pgno)?;
                return Ok(&run[PageHeader::SIZE..PageHeader::SIZE + logical_len]);
            }
        }
        let run = self.env.pager().run_bytes(head, span, self.env.pager().first_unallocated())?;
        Ok(&run[PageHeader::SIZE..PageHeader::SIZE + logical_len])
    }

    /// The tree record a DBI currently maps to
    pub(crate) fn tree(&self, dbi: Dbi) -> Result<TreeRecord> {
        self.trees
            .get(dbi.0 as usize)
            .and_then(|t| t.as_ref())
            .map(|t| t.record)
            .ok_or(Error::BadDbi(dbi.0))
    }

    /// Tree state including drop/seq bookkeeping
    pub(crate) fn tree_state(&self, dbi: Dbi) -> Result<&TreeState> {
        self.trees.get(dbi.0 as usize).and_then(|t| t.as_ref()).ok_or(Error::BadDbi(dbi.0))
    }

    /// Record the pages a cursor's stack pins (spill exemption)
    pub(crate) fn pin_pages(&self, cursor_id: u64, pages: Vec<u64>) {
        if let ModeData::Write(w) = &self.mode_data {
            w.pins.borrow_mut().insert(cursor_id, pages);
        }
    }

    /// Bump the tree's sequence so outstanding cursors turn "poor"; with
    /// `delete` the table's record also leaves MAIN at commit
    pub(crate) fn invalidate_tree(&mut self, dbi: Dbi, delete: bool) {
        if let Some(Some(state)) = self.trees.get_mut(dbi.0 as usize) {
            state.seq += 1;
            if delete {
                state.dropped = true;
            }
        }
    }

    /// Store back an updated tree record, marking it for persistence
    pub(crate) fn set_tree(&mut self, dbi: Dbi, record: TreeRecord) -> Result<()> {
        let id = self.id;
        let env = self.env;
        let state = self
            .trees
            .get_mut(dbi.0 as usize)
            .and_then(|t| t.as_mut())
            .ok_or(Error::BadDbi(dbi.0))?;
        if state.record != record {
            state.record = record;
            state.record.mod_txnid = id.0;
            state.dirty = true;
            env.note_dbi_dirty(dbi.0);
        }
        Ok(())
    }
}

impl<M: mode::Mode> Drop for Transaction<'_, M> {
    fn drop(&mut self) {
        match &mut self.mode_data {
            ModeData::Read { slot } => {
                if let Some(index) = slot.take() {
                    self.env.lck().release(index);
                }
            }
            ModeData::Write(w) => {
                if matches!(self.state, TxnState::Active | TxnState::Error) {
                    let unpublished: Vec<u32> =
                        self.pending_dbis.drain(..).map(|(dbi, _, _, _)| dbi).collect();
                    self.env.retire_dbis(&unpublished);
                    w.dirty.clear();
                    self.state = TxnState::Aborted;
                }
                w.guard.take();
            }
        }
    }
}

fn encode_header(buf: &mut [u8], header: &PageHeader) {
    use crate::unaligned::{poke_u16, poke_u32, poke_u64};
    poke_u64(buf, 0, header.pgno);
    poke_u64(buf, 8, header.txnid);
    poke_u16(buf, 16, header.flags.bits());
    poke_u16(buf, 18, header.lower);
    poke_u16(buf, 20, header.upper);
    poke_u16(buf, 22, header.dupfix);
    poke_u32(buf, 24, header.pages);
    poke_u32(buf, 28, header.reserved);
}

/// Backup taken at nested-transaction begin
struct NestedBackup {
    trees: Vec<Option<TreeState>>,
    dirty: DirtySet,
    gc: GcState,
    next_pgno: u64,
    allocated: BTreeSet<u64>,
    pending_dbis: Vec<(u32, String, u16, u32)>,
}

/// A nested write transaction
///
/// Operations run against the parent's state; [`NestedTransaction::commit`]
/// keeps them, [`NestedTransaction::abort`] restores the begin snapshot.
pub struct NestedTransaction<'p, 'env> {
    parent: &'p mut Transaction<'env, Write>,
    backup: Option<NestedBackup>,
    finished: bool,
}

impl<'p, 'env> NestedTransaction<'p, 'env> {
    /// Merge the child's changes into the parent
    pub fn commit(mut self) -> Result<()> {
        self.parent.ensure_active()?;
        self.backup.take();
        self.finished = true;
        self.parent.write_state().nested_depth -= 1;
        Ok(())
    }

    /// Discard the child's changes
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if let Some(backup) = self.backup.take() {
            // registry entries for tables only the child created go away
            let kept: std::collections::HashSet<u32> =
                backup.pending_dbis.iter().map(|(dbi, _, _, _)| *dbi).collect();
            let child_only: Vec<u32> = self
                .parent
                .pending_dbis
                .iter()
                .map(|(dbi, _, _, _)| *dbi)
                .filter(|dbi| !kept.contains(dbi))
                .collect();
            self.parent.env.retire_dbis(&child_only);
            self.parent.trees = backup.trees;
            self.parent.pending_dbis = backup.pending_dbis;
            let w = self.parent.write_state();
            w.dirty = backup.dirty;
            w.gc = backup.gc;
            w.next_pgno = backup.next_pgno;
            w.allocated = backup.allocated;
            w.nested_depth -= 1;
            self.finished = true;
        }
    }
}

impl<'env> std::ops::Deref for NestedTransaction<'_, 'env> {
    type Target = Transaction<'env, Write>;

    fn deref(&self) -> &Self::Target {
        self.parent
    }
}

impl std::ops::DerefMut for NestedTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.parent
    }
}

impl Drop for NestedTransaction<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

//! Dirty-page tracking, spill policy, and the vectored write ring
//!
//! The active writer shadows every page it mutates. When the shadow set
//! outgrows its budget, the least-recently-touched pages whose subtrees are
//! not pinned by open cursors are written to their final file location and
//! their buffers dropped; such spilled pages stay logically dirty (the
//! writer re-reads them from the map, and re-dirtying them resurrects a
//! shadow). Spilling never makes a page visible to a concurrent reader: the
//! target pgno is either fresh beyond every reader's pinned `last_pgno` or a
//! GC page reclaimed under the horizon rules.

use crate::error::{Error, PageId, Result};
use crate::page::{Page, PageFlags, PAGE_SIZE};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;

/// Default dirty-page budget before the spill policy kicks in
pub const DEFAULT_DIRTY_BUDGET: usize = 1024;

/// Fraction of the dirty set written out per spill pass (denominator)
const SPILL_DIVISOR: usize = 4;

/// Max iovec entries per pwritev call
const RING_IOV_MAX: usize = 64;

/// In-memory shadow of a dirty page or large-page run
pub enum Shadow {
    /// A single branch/leaf/dupfix page
    Single(Box<Page>),
    /// A large run: `pages * PAGE_SIZE` bytes starting with the head header
    Large(Box<[u8]>),
}

impl Shadow {
    /// Page number of the (head) page
    pub fn pgno(&self) -> PageId {
        match self {
            Shadow::Single(p) => PageId(p.header.pgno),
            Shadow::Large(b) => PageId(crate::unaligned::peek_u64(b, 0)),
        }
    }

    /// Raw bytes of the whole shadow
    pub fn bytes(&self) -> &[u8] {
        match self {
            Shadow::Single(p) => p.as_bytes(),
            Shadow::Large(b) => b,
        }
    }

    /// Number of file pages this shadow spans
    pub fn span(&self) -> u64 {
        (self.bytes().len() / PAGE_SIZE) as u64
    }

    /// Clear the in-memory flag bits before the shadow hits the file
    pub fn strip_volatile_flags(&mut self) {
        match self {
            Shadow::Single(p) => {
                p.header.flags &= PageFlags::PERSISTENT;
            }
            Shadow::Large(b) => {
                let flags = crate::unaligned::peek_u16(b, 16);
                let flags = flags & PageFlags::PERSISTENT.bits();
                crate::unaligned::poke_u16(b, 16, flags);
            }
        }
    }

    fn clone_shadow(&self) -> Shadow {
        match self {
            Shadow::Single(p) => Shadow::Single(p.clone_box()),
            Shadow::Large(b) => Shadow::Large(b.clone()),
        }
    }
}

enum EntryState {
    /// Shadow held in memory
    Resident(Shadow),
    /// Written at its final location; the buffer is gone
    Spilled {
        /// Pages the run spans (for accounting)
        span: u64,
    },
}

struct DirtyEntry {
    state: EntryState,
    tick: u64,
}

/// The writer's dirty set
pub struct DirtySet {
    entries: HashMap<u64, DirtyEntry>,
    clock: u64,
    resident: usize,
}

impl DirtySet {
    /// Empty dirty set
    pub fn new() -> Self {
        Self { entries: HashMap::new(), clock: 0, resident: 0 }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Number of resident (unspilled) shadows
    pub fn resident(&self) -> usize {
        self.resident
    }

    /// Total tracked entries, spilled included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a fresh shadow
    pub fn insert(&mut self, shadow: Shadow) {
        let pgno = shadow.pgno().0;
        let tick = self.tick();
        if let Some(prev) = self.entries.insert(pgno, DirtyEntry { state: EntryState::Resident(shadow), tick })
        {
            if matches!(prev.state, EntryState::Resident(_)) {
                self.resident -= 1;
            }
        }
        self.resident += 1;
    }

    /// Borrow a resident shadow without touching the clock
    pub fn peek(&self, pgno: PageId) -> Option<&Shadow> {
        match self.entries.get(&pgno.0) {
            Some(DirtyEntry { state: EntryState::Resident(s), .. }) => Some(s),
            _ => None,
        }
    }

    /// Whether this pgno is tracked (resident or spilled)
    pub fn contains(&self, pgno: PageId) -> bool {
        self.entries.contains_key(&pgno.0)
    }

    /// Whether this pgno is tracked but spilled out
    pub fn is_spilled(&self, pgno: PageId) -> bool {
        matches!(self.entries.get(&pgno.0), Some(DirtyEntry { state: EntryState::Spilled { .. }, .. }))
    }

    /// Borrow a resident shadow mutably, refreshing its LRU tick
    pub fn touch(&mut self, pgno: PageId) -> Option<&mut Shadow> {
        let tick = self.tick();
        match self.entries.get_mut(&pgno.0) {
            Some(entry) => {
                entry.tick = tick;
                match &mut entry.state {
                    EntryState::Resident(s) => Some(s),
                    EntryState::Spilled { .. } => None,
                }
            }
            None => None,
        }
    }

    /// Resurrect a spilled entry with a fresh shadow (re-dirtying)
    pub fn unspill(&mut self, shadow: Shadow) {
        let pgno = shadow.pgno().0;
        debug_assert!(self.is_spilled(PageId(pgno)));
        let tick = self.tick();
        self.entries.insert(pgno, DirtyEntry { state: EntryState::Resident(shadow), tick });
        self.resident += 1;
    }

    /// Stop tracking a page (retired before ever hitting the file)
    pub fn remove(&mut self, pgno: PageId) -> Option<Shadow> {
        match self.entries.remove(&pgno.0) {
            Some(DirtyEntry { state: EntryState::Resident(s), .. }) => {
                self.resident -= 1;
                Some(s)
            }
            Some(DirtyEntry { state: EntryState::Spilled { .. }, .. }) | None => None,
        }
    }

    /// Least-recently-touched resident pages eligible for spilling
    ///
    /// `pinned` holds the pgnos on some open cursor's stack; those subtrees
    /// stay resident so cursor repositioning never reads a half-flushed page.
    pub fn spill_candidates(&self, pinned: &dyn Fn(PageId) -> bool) -> Vec<PageId> {
        let mut c: Vec<(u64, PageId)> = self
            .entries
            .iter()
            .filter_map(|(pgno, e)| match e.state {
                EntryState::Resident(_) if !pinned(PageId(*pgno)) => Some((e.tick, PageId(*pgno))),
                _ => None,
            })
            .collect();
        c.sort_unstable();
        let take = (c.len() / SPILL_DIVISOR).max(1).min(c.len());
        c.truncate(take);
        c.into_iter().map(|(_, p)| p).collect()
    }

    /// Mark a page as spilled, dropping its buffer
    pub fn mark_spilled(&mut self, pgno: PageId) {
        if let Some(entry) = self.entries.get_mut(&pgno.0) {
            if let EntryState::Resident(s) = &entry.state {
                let span = s.span();
                entry.state = EntryState::Spilled { span };
                self.resident -= 1;
            }
        }
    }

    /// Track a page that was written out externally (spill write ring)
    pub fn insert_spilled(&mut self, pgno: PageId, span: u64) {
        let tick = self.tick();
        if let Some(prev) = self
            .entries
            .insert(pgno.0, DirtyEntry { state: EntryState::Spilled { span }, tick })
        {
            if matches!(prev.state, EntryState::Resident(_)) {
                self.resident -= 1;
            }
        }
    }

    /// Deep copy for nested-transaction snapshots
    pub fn snapshot(&self) -> DirtySet {
        let entries = self
            .entries
            .iter()
            .map(|(pgno, e)| {
                let state = match &e.state {
                    EntryState::Resident(s) => EntryState::Resident(s.clone_shadow()),
                    EntryState::Spilled { span } => EntryState::Spilled { span: *span },
                };
                (*pgno, DirtyEntry { state, tick: e.tick })
            })
            .collect();
        DirtySet { entries, clock: self.clock, resident: self.resident }
    }

    /// Drain every resident shadow, sorted by pgno (commit write-out order)
    pub fn take_resident_sorted(&mut self) -> Vec<Shadow> {
        let pgnos: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Resident(_)))
            .map(|(p, _)| *p)
            .collect();
        let mut out = Vec::with_capacity(pgnos.len());
        for pgno in pgnos {
            if let Some(DirtyEntry { state: EntryState::Resident(s), .. }) = self.entries.remove(&pgno) {
                self.resident -= 1;
                out.push(s);
            }
        }
        out.sort_unstable_by_key(|s| s.pgno().0);
        out
    }

    /// Discard everything (abort)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.resident = 0;
    }

    /// Snapshot of tracked pgnos (nested-txn bookkeeping)
    pub fn tracked_pgnos(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

impl Default for DirtySet {
    fn default() -> Self {
        Self::new()
    }
}

/// Vectored write batching for the commit/spill path
pub struct WriteRing {
    max_iov: usize,
}

impl WriteRing {
    /// Ring with the default chunking
    pub fn new() -> Self {
        Self { max_iov: RING_IOV_MAX }
    }

    /// Ring with an explicit iovec cap per batch
    pub fn with_chunk(max_iov: usize) -> Self {
        Self { max_iov: max_iov.clamp(1, RING_IOV_MAX) }
    }

    /// Write shadows (sorted by pgno) to their final locations.
    ///
    /// Contiguous pgno runs coalesce into single vectored writes; `verify`
    /// runs once per batch after it lands, giving the pager its coherency
    /// window.
    pub fn write_all<F>(&self, file: &File, shadows: &[Shadow], mut verify: F) -> Result<()>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut i = 0;
        while i < shadows.len() {
            // collect one physically contiguous batch
            let start = i;
            let mut next_pgno = shadows[i].pgno().0;
            while i < shadows.len()
                && i - start < self.max_iov
                && shadows[i].pgno().0 == next_pgno
            {
                next_pgno = shadows[i].pgno().0 + shadows[i].span();
                i += 1;
            }
            let batch = &shadows[start..i];
            let offset = batch[0].pgno().0 * PAGE_SIZE as u64;
            pwritev_full(file, batch, offset)?;
            for shadow in batch {
                verify(shadow.pgno(), shadow.bytes())?;
            }
        }
        Ok(())
    }
}

impl Default for WriteRing {
    fn default() -> Self {
        Self::new()
    }
}

/// pwritev the batch at `offset`, resuming on short writes
fn pwritev_full(file: &File, batch: &[Shadow], mut offset: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut iovs: Vec<libc::iovec> = batch
        .iter()
        .map(|s| libc::iovec {
            iov_base: s.bytes().as_ptr() as *mut libc::c_void,
            iov_len: s.bytes().len(),
        })
        .collect();
    let mut cursor = 0usize;
    while cursor < iovs.len() {
        let wrote = unsafe {
            libc::pwritev(
                fd,
                iovs[cursor..].as_ptr(),
                (iovs.len() - cursor) as libc::c_int,
                offset as libc::off_t,
            )
        };
        if wrote < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err.to_string()));
        }
        let mut wrote = wrote as usize;
        offset += wrote as u64;
        while cursor < iovs.len() && wrote >= iovs[cursor].iov_len {
            wrote -= iovs[cursor].iov_len;
            cursor += 1;
        }
        if cursor < iovs.len() && wrote > 0 {
            iovs[cursor].iov_base = unsafe { (iovs[cursor].iov_base as *mut u8).add(wrote) } as *mut libc::c_void;
            iovs[cursor].iov_len -= wrote;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxnId;
    use std::io::Read;
    use tempfile::TempDir;

    fn shadow(pgno: u64, fill: u8) -> Shadow {
        let mut page = Page::new(PageId(pgno), TxnId(1), PageFlags::LEAF);
        page.data.fill(fill);
        Shadow::Single(page)
    }

    #[test]
    fn test_lru_spill_candidates() {
        let mut set = DirtySet::new();
        for pgno in 10..18 {
            set.insert(shadow(pgno, pgno as u8));
        }
        // touch the oldest so it becomes the newest
        set.touch(PageId(10)).unwrap();
        let candidates = set.spill_candidates(&|_| false);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], PageId(11));
        assert_eq!(candidates[1], PageId(12));
    }

    #[test]
    fn test_pinned_pages_skipped() {
        let mut set = DirtySet::new();
        for pgno in 0..4 {
            set.insert(shadow(pgno, 0));
        }
        let candidates = set.spill_candidates(&|p| p.0 < 2);
        assert!(candidates.iter().all(|p| p.0 >= 2));
    }

    #[test]
    fn test_spill_state_machine() {
        let mut set = DirtySet::new();
        set.insert(shadow(5, 0xAA));
        assert_eq!(set.resident(), 1);
        set.mark_spilled(PageId(5));
        assert_eq!(set.resident(), 0);
        assert!(set.is_spilled(PageId(5)));
        assert!(set.contains(PageId(5)));
        assert!(set.touch(PageId(5)).is_none());
        // re-dirtying brings a fresh shadow back
        set.unspill(shadow(5, 0xBB));
        assert_eq!(set.resident(), 1);
        assert!(!set.is_spilled(PageId(5)));
    }

    #[test]
    fn test_ring_writes_contiguous_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring.bin");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(16 * PAGE_SIZE as u64).unwrap();

        let shadows = vec![shadow(2, 0x22), shadow(3, 0x33), shadow(7, 0x77)];
        let ring = WriteRing::with_chunk(2);
        let mut verified = Vec::new();
        ring.write_all(&file, &shadows, |pgno, bytes| {
            assert_eq!(bytes.len(), PAGE_SIZE);
            verified.push(pgno.0);
            Ok(())
        })
        .unwrap();
        assert_eq!(verified, vec![2, 3, 7]);

        let mut contents = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents[2 * PAGE_SIZE + 100], 0x22);
        assert_eq!(contents[3 * PAGE_SIZE + 100], 0x33);
        assert_eq!(contents[7 * PAGE_SIZE + 100], 0x77);
        assert_eq!(contents[4 * PAGE_SIZE + 100], 0);
    }

    #[test]
    fn test_take_resident_sorted() {
        let mut set = DirtySet::new();
        for pgno in [9u64, 3, 12, 5] {
            set.insert(shadow(pgno, 0));
        }
        set.mark_spilled(PageId(12));
        let drained = set.take_resident_sorted();
        let order: Vec<u64> = drained.iter().map(|s| s.pgno().0).collect();
        assert_eq!(order, vec![3, 5, 9]);
        // the spilled entry stays tracked
        assert!(set.is_spilled(PageId(12)));
    }
}

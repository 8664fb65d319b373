//! Reader slot table in the shared lock region
//!
//! The lock file holds a small header followed by a fixed array of reader
//! slots, mapped into every process using the database. A live slot with
//! `txnid = T` pins the GC horizon: no page retired by a transaction with id
//! <= T may be overwritten while the slot stands. Slots are written in a
//! fixed order (pid, then tid, then txnid) and enumerated with re-validation
//! so a torn write is never mistaken for a real snapshot.

use crate::error::{Error, Result, TxnId};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number of the lock file (independent of the data format)
pub const LCK_MAGIC: u64 = 0x6264_626C_636B_3031; // "bdblck01"

/// Lock region format; a mismatch means an incompatible peer process
pub const LCK_FORMAT: u32 = 1;

/// Default number of reader slots
pub const DEFAULT_MAX_READERS: usize = 126;

/// Header at the start of the lock region
#[repr(C)]
pub struct LckHeader {
    /// Lock region magic
    pub magic: u64,
    /// Lock region format
    pub format: u32,
    /// Number of slots following the header
    pub capacity: u32,
    /// Coherency-workaround counter; once nonzero every write batch gets a
    /// full verify. Reset at environment open.
    pub incoherence: AtomicU32,
    /// Padding to a 64-byte header
    pub reserved: [u32; 9],
}

const LCK_HEADER_SIZE: usize = 64;

/// One reader slot
#[repr(C)]
pub struct ReaderSlot {
    /// Owning process id, 0 when free
    pub pid: AtomicU32,
    /// Padding for the tid field
    pub pad: u32,
    /// Owning thread id
    pub tid: AtomicU64,
    /// Snapshot transaction id
    pub txnid: AtomicU64,
    /// `last_pgno` at snapshot time
    pub last_pgno: AtomicU64,
    /// Retired-pages counter at snapshot time
    pub retired: AtomicU64,
}

const SLOT_SIZE: usize = size_of::<ReaderSlot>();

/// Slot txnid value meaning "claimed but no snapshot yet"
const TXNID_NONE: u64 = u64::MAX;

/// A reader's registered snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSnapshot {
    /// Process id
    pub pid: u32,
    /// Thread id
    pub tid: u64,
    /// Snapshot transaction id
    pub txnid: TxnId,
    /// `last_pgno` at snapshot time
    pub last_pgno: u64,
    /// Retired counter at snapshot time
    pub retired: u64,
}

/// The mapped reader table
pub struct ReaderTable {
    file: std::fs::File,
    map: MmapMut,
    capacity: usize,
}

// Safety: all access to the mapped region goes through atomics.
unsafe impl Send for ReaderTable {}
unsafe impl Sync for ReaderTable {}

impl ReaderTable {
    /// Create or open the lock region backing file
    ///
    /// A fresh file is sized and stamped; an existing one must carry the
    /// lock magic/format. The incoherence counter is reset on every open,
    /// matching the source behaviour of the coherency workaround.
    pub fn open(path: &Path, max_readers: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let wanted = (LCK_HEADER_SIZE + max_readers * SLOT_SIZE) as u64;
        let existing = file.metadata()?.len();
        let fresh = existing < LCK_HEADER_SIZE as u64;
        if fresh {
            file.set_len(wanted)?;
        }
        let len = file.metadata()?.len() as usize;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let table = Self { file, map, capacity: 0 };

        let header = table.header();
        if fresh {
            header.magic = LCK_MAGIC;
            header.format = LCK_FORMAT;
            header.capacity = max_readers as u32;
            header.incoherence.store(0, Ordering::Relaxed);
        } else {
            if header.magic != LCK_MAGIC {
                return Err(Error::Corruption { details: "lock file magic".into(), pgno: None });
            }
            if header.format != LCK_FORMAT {
                return Err(Error::VersionMismatch { expected: LCK_FORMAT, found: header.format });
            }
            let cap = header.capacity as usize;
            if LCK_HEADER_SIZE + cap * SLOT_SIZE > len {
                return Err(Error::Corruption { details: "lock file truncated".into(), pgno: None });
            }
            header.incoherence.store(0, Ordering::Relaxed);
        }
        let capacity = table.header().capacity as usize;
        Ok(Self { file: table.file, map: table.map, capacity })
    }

    /// Take the cross-process writer lock (a range lock on the lock file)
    ///
    /// `block` selects F_SETLKW vs the non-blocking try mode of write-begin.
    #[cfg(unix)]
    pub fn lock_writer(&self, block: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 1;
        let cmd = if block { libc::F_SETLKW } else { libc::F_SETLK };
        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &fl) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EACCES) | Some(libc::EAGAIN) if !block => return Err(Error::Busy),
                _ => return Err(Error::Io(err.to_string())),
            }
        }
    }

    /// Release the cross-process writer lock
    #[cfg(unix)]
    pub fn unlock_writer(&self) {
        use std::os::unix::io::AsRawFd;
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 1;
        unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &fl) };
    }

    #[allow(clippy::mut_from_ref)]
    fn header(&self) -> &mut LckHeader {
        unsafe { &mut *(self.map.as_ptr() as *mut LckHeader) }
    }

    fn slot(&self, index: usize) -> &ReaderSlot {
        debug_assert!(index < self.capacity);
        unsafe {
            let base = self.map.as_ptr().add(LCK_HEADER_SIZE) as *const ReaderSlot;
            &*base.add(index)
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a free slot and publish the snapshot into it
    pub fn acquire(&self, snap: ReaderSnapshot) -> Result<usize> {
        for pass in 0..2 {
            for i in 0..self.capacity {
                let slot = self.slot(i);
                if pass == 1 && self.slot_is_stale(i) {
                    tracing::debug!(slot = i, "reaping stale reader slot");
                    self.clear(i);
                }
                if slot.pid.compare_exchange(0, snap.pid, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    // the invalid txnid goes out before any real one so a
                    // concurrent enumerator never reads a stale snapshot
                    slot.txnid.store(TXNID_NONE, Ordering::Release);
                    // publication order: pid above, then tid, then txnid
                    slot.tid.store(snap.tid, Ordering::Release);
                    slot.last_pgno.store(snap.last_pgno, Ordering::Release);
                    slot.retired.store(snap.retired, Ordering::Release);
                    slot.txnid.store(snap.txnid.0, Ordering::Release);
                    return Ok(i);
                }
            }
        }
        Err(Error::ReadersFull)
    }

    /// Re-publish a new snapshot into an owned slot (park/resume, renew)
    pub fn update(&self, index: usize, snap: ReaderSnapshot) -> Result<()> {
        let slot = self.slot(index);
        if slot.pid.load(Ordering::Acquire) != snap.pid {
            return Err(Error::BadReaderSlot);
        }
        slot.last_pgno.store(snap.last_pgno, Ordering::Release);
        slot.retired.store(snap.retired, Ordering::Release);
        slot.txnid.store(snap.txnid.0, Ordering::Release);
        Ok(())
    }

    /// Park an owned slot: the handle stays, the snapshot no longer pins GC
    pub fn park(&self, index: usize, pid: u32) -> Result<()> {
        let slot = self.slot(index);
        if slot.pid.load(Ordering::Acquire) != pid {
            return Err(Error::BadReaderSlot);
        }
        slot.txnid.store(TXNID_NONE, Ordering::Release);
        Ok(())
    }

    /// Release a slot entirely
    pub fn release(&self, index: usize) {
        self.clear(index);
    }

    fn clear(&self, index: usize) {
        let slot = self.slot(index);
        slot.txnid.store(TXNID_NONE, Ordering::Release);
        slot.tid.store(0, Ordering::Release);
        slot.last_pgno.store(0, Ordering::Release);
        slot.retired.store(0, Ordering::Release);
        // pid last: the slot becomes claimable only once fully cleared
        slot.pid.store(0, Ordering::Release);
    }

    /// Read one slot with torn-write re-validation
    pub fn snapshot_of(&self, index: usize) -> Option<ReaderSnapshot> {
        let slot = self.slot(index);
        loop {
            let pid = slot.pid.load(Ordering::Acquire);
            if pid == 0 {
                return None;
            }
            let tid = slot.tid.load(Ordering::Acquire);
            let txnid = slot.txnid.load(Ordering::Acquire);
            let last_pgno = slot.last_pgno.load(Ordering::Acquire);
            let retired = slot.retired.load(Ordering::Acquire);
            // re-read in publication order; retry if the slot changed hands
            if slot.pid.load(Ordering::Acquire) == pid
                && slot.tid.load(Ordering::Acquire) == tid
                && slot.txnid.load(Ordering::Acquire) == txnid
            {
                if txnid == TXNID_NONE {
                    return None;
                }
                return Some(ReaderSnapshot { pid, tid, txnid: TxnId(txnid), last_pgno, retired });
            }
            std::hint::spin_loop();
        }
    }

    /// Oldest live snapshot txnid across all slots (the GC horizon)
    pub fn oldest(&self) -> Option<TxnId> {
        let mut oldest: Option<TxnId> = None;
        for i in 0..self.capacity {
            if let Some(snap) = self.snapshot_of(i) {
                match oldest {
                    Some(t) if t.0 <= snap.txnid.0 => {}
                    _ => oldest = Some(snap.txnid),
                }
            }
        }
        oldest
    }

    /// Smallest `last_pgno` pinned by any live snapshot
    pub fn oldest_last_pgno(&self) -> Option<u64> {
        let mut out: Option<u64> = None;
        for i in 0..self.capacity {
            if let Some(snap) = self.snapshot_of(i) {
                out = Some(out.map_or(snap.last_pgno, |v| v.min(snap.last_pgno)));
            }
        }
        out
    }

    fn slot_is_stale(&self, index: usize) -> bool {
        let pid = self.slot(index).pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        !process_alive(pid)
    }

    /// Clear slots whose owning process is gone; returns the count reaped
    pub fn reap_stale(&self) -> usize {
        let mut reaped = 0;
        for i in 0..self.capacity {
            if self.slot_is_stale(i) {
                tracing::debug!(slot = i, "clearing slot of a dead process");
                self.clear(i);
                reaped += 1;
            }
        }
        reaped
    }

    /// Drop every slot owned by `pid` (fork resurrect, close)
    pub fn drop_pid(&self, pid: u32) {
        for i in 0..self.capacity {
            if self.slot(i).pid.load(Ordering::Acquire) == pid {
                self.clear(i);
            }
        }
    }

    /// Enumerate live snapshots
    pub fn enumerate(&self) -> Vec<(usize, ReaderSnapshot)> {
        (0..self.capacity).filter_map(|i| self.snapshot_of(i).map(|s| (i, s))).collect()
    }

    /// Bump the coherency-workaround counter
    pub fn incoherence_bump(&self) {
        self.header().incoherence.fetch_add(1, Ordering::AcqRel);
    }

    /// Current value of the coherency-workaround counter
    pub fn incoherence(&self) -> u32 {
        self.header().incoherence.load(Ordering::Acquire)
    }
}

/// Whether a process with this pid is alive
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    // EPERM still means the process exists
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Current thread id for slot publication
#[cfg(unix)]
pub fn current_tid() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
pub fn current_tid() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    h.finish()
}

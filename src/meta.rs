//! Meta pages and the crash-safe commit protocol
//!
//! Three meta pages occupy pgno 0..=2 and rotate round-robin: the commit of
//! transaction T writes slot `T % 3`. Each meta ends with a tail-sign
//! computed over the preceding bytes, so a torn meta write is detectable and
//! tolerated: the other two slots stay intact and the engine falls back to
//! the greatest remaining valid txnid. Everything is encoded little-endian
//! through the byte-copy thunks; the in-memory struct is never memcpy'd to
//! disk.

use crate::error::{Error, PageId, Result, TxnId};
use crate::page::{Page, PageFlags, PAGE_SIZE};
use crate::unaligned::{peek_u16, peek_u32, peek_u64, poke_u16, poke_u32, poke_u64};

/// Number of meta pages at the front of the data file
pub const META_COUNT: usize = 3;

/// Magic number identifying a burrowdb data file
pub const MAGIC: u64 = 0x4244_7752_7542_6462; // "bdBuRwDB"

/// On-disk format version; incompatible layout changes bump this
pub const FORMAT_VERSION: u32 = 1;

/// Meta slot written by the commit of transaction `txnid`
pub fn meta_slot(txnid: TxnId) -> PageId {
    PageId(txnid.0 % META_COUNT as u64)
}

/// Database file geometry, all sizes in pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Minimum file size
    pub lower: u32,
    /// Current file size
    pub current: u32,
    /// Maximum file size; allocation beyond this fails with map-full
    pub upper: u32,
    /// Pages added per growth step
    pub growth: u32,
    /// Shrink when this many trailing pages are unallocated (0 = never)
    pub shrink: u32,
    /// Page size the file was created with
    pub pagesize: u32,
}

impl Geometry {
    const ENCODED: usize = 24;

    fn encode(&self, buf: &mut [u8], off: usize) {
        poke_u32(buf, off, self.lower);
        poke_u32(buf, off + 4, self.current);
        poke_u32(buf, off + 8, self.upper);
        poke_u32(buf, off + 12, self.growth);
        poke_u32(buf, off + 16, self.shrink);
        poke_u32(buf, off + 20, self.pagesize);
    }

    fn decode(buf: &[u8], off: usize) -> Self {
        Self {
            lower: peek_u32(buf, off),
            current: peek_u32(buf, off + 4),
            upper: peek_u32(buf, off + 8),
            growth: peek_u32(buf, off + 12),
            shrink: peek_u32(buf, off + 16),
            pagesize: peek_u32(buf, off + 20),
        }
    }
}

/// Persistent identity of one table: the tree_t record
///
/// The two system trees (GC and MAIN) live in every meta page; named tables
/// store their record as a SUBDATA value in MAIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRecord {
    /// Table flags ([`crate::db::DatabaseFlags`] bits)
    pub flags: u16,
    /// Height of the tree (0 = empty)
    pub depth: u16,
    /// Fixed record size for DUPFIX tables, 0 otherwise
    pub dupfix_size: u32,
    /// Root page, or [`TreeRecord::NO_ROOT`] when empty
    pub root: u64,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of large (overflow) pages
    pub large_pages: u64,
    /// Number of items
    pub entries: u64,
    /// Transaction that last modified this tree
    pub mod_txnid: u64,
    /// Sequence counter (`dbi_sequence`)
    pub seq: u64,
}

impl TreeRecord {
    /// Root value of an empty tree
    pub const NO_ROOT: u64 = u64::MAX;

    /// Encoded size of a tree record
    pub const ENCODED: usize = 64;

    /// A fresh empty tree with the given flags
    pub fn empty(flags: u16, dupfix_size: u32) -> Self {
        Self {
            flags,
            depth: 0,
            dupfix_size,
            root: Self::NO_ROOT,
            branch_pages: 0,
            leaf_pages: 0,
            large_pages: 0,
            entries: 0,
            mod_txnid: 0,
            seq: 0,
        }
    }

    /// Encode at `off` in `buf`
    pub fn encode(&self, buf: &mut [u8], off: usize) {
        poke_u16(buf, off, self.flags);
        poke_u16(buf, off + 2, self.depth);
        poke_u32(buf, off + 4, self.dupfix_size);
        poke_u64(buf, off + 8, self.root);
        poke_u64(buf, off + 16, self.branch_pages);
        poke_u64(buf, off + 24, self.leaf_pages);
        poke_u64(buf, off + 32, self.large_pages);
        poke_u64(buf, off + 40, self.entries);
        poke_u64(buf, off + 48, self.mod_txnid);
        poke_u64(buf, off + 56, self.seq);
    }

    /// Decode from `off` in `buf`
    pub fn decode(buf: &[u8], off: usize) -> Self {
        Self {
            flags: peek_u16(buf, off),
            depth: peek_u16(buf, off + 2),
            dupfix_size: peek_u32(buf, off + 4),
            root: peek_u64(buf, off + 8),
            branch_pages: peek_u64(buf, off + 16),
            leaf_pages: peek_u64(buf, off + 24),
            large_pages: peek_u64(buf, off + 32),
            entries: peek_u64(buf, off + 40),
            mod_txnid: peek_u64(buf, off + 48),
            seq: peek_u64(buf, off + 56),
        }
    }

    /// Serialize for storage as a MAIN value
    pub fn to_bytes(&self) -> [u8; Self::ENCODED] {
        let mut b = [0u8; Self::ENCODED];
        self.encode(&mut b, 0);
        b
    }

    /// Parse a MAIN value back into a record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED {
            return Err(Error::Corruption { details: "tree record size".into(), pgno: None });
        }
        Ok(Self::decode(bytes, 0))
    }
}

// encoded field offsets
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_STEADY: usize = 12;
const OFF_GEO: usize = 16;
const OFF_GC: usize = OFF_GEO + Geometry::ENCODED; // 40
const OFF_MAIN: usize = OFF_GC + TreeRecord::ENCODED; // 104
const OFF_LAST_PGNO: usize = OFF_MAIN + TreeRecord::ENCODED; // 168
const OFF_TXNID: usize = OFF_LAST_PGNO + 8;
const OFF_RETIRED: usize = OFF_TXNID + 8;
const OFF_CANARY: usize = OFF_RETIRED + 8;
const OFF_TAIL: usize = OFF_CANARY + 32; // 216

/// Encoded size of a meta payload
pub const META_ENCODED: usize = OFF_TAIL + 8;

/// One decoded meta page
#[derive(Debug, Clone, Copy)]
pub struct MetaPage {
    /// File geometry at this commit
    pub geometry: Geometry,
    /// GC (free-list) tree snapshot
    pub gc: TreeRecord,
    /// Main tree snapshot
    pub main: TreeRecord,
    /// Highest allocated page number
    pub last_pgno: u64,
    /// Transaction this meta commits
    pub txnid: TxnId,
    /// Total pages ever retired (monotonic)
    pub retired: u64,
    /// User canary values
    pub canary: [u64; 4],
    /// Written through a full sync (durable), as opposed to a weak commit
    pub steady: bool,
}

impl MetaPage {
    /// Meta describing a freshly initialized database
    pub fn genesis(geometry: Geometry) -> Self {
        Self {
            geometry,
            // GC keys are txnids; the table orders them numerically
            gc: TreeRecord::empty(crate::db::DatabaseFlags::INTEGER_KEY.bits(), 0),
            main: TreeRecord::empty(0, 0),
            last_pgno: META_COUNT as u64 - 1,
            txnid: TxnId(0),
            retired: 0,
            canary: [0; 4],
            steady: true,
        }
    }

    /// Encode into a META page at `pgno`
    pub fn to_page(&self, pgno: PageId) -> Box<Page> {
        let mut page = Page::new(pgno, self.txnid, PageFlags::META);
        let buf = &mut page.data;
        poke_u64(buf, OFF_MAGIC, MAGIC);
        poke_u32(buf, OFF_VERSION, FORMAT_VERSION);
        poke_u32(buf, OFF_STEADY, self.steady as u32);
        self.geometry.encode(buf, OFF_GEO);
        self.gc.encode(buf, OFF_GC);
        self.main.encode(buf, OFF_MAIN);
        poke_u64(buf, OFF_LAST_PGNO, self.last_pgno);
        poke_u64(buf, OFF_TXNID, self.txnid.0);
        poke_u64(buf, OFF_RETIRED, self.retired);
        for (i, c) in self.canary.iter().enumerate() {
            poke_u64(buf, OFF_CANARY + i * 8, *c);
        }
        let tail = tail_sign(&buf[..OFF_TAIL]);
        poke_u64(buf, OFF_TAIL, tail);
        page
    }

    /// Decode and validate a meta payload
    pub fn from_page(page: &Page) -> Result<Self> {
        if !page.header.flags.contains(PageFlags::META) {
            return Err(Error::InvalidMeta);
        }
        let buf = &page.data;
        if peek_u64(buf, OFF_MAGIC) != MAGIC {
            return Err(Error::InvalidMeta);
        }
        let version = peek_u32(buf, OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch { expected: FORMAT_VERSION, found: version });
        }
        let tail = peek_u64(buf, OFF_TAIL);
        if tail != tail_sign(&buf[..OFF_TAIL]) {
            return Err(Error::InvalidMeta);
        }
        let geometry = Geometry::decode(buf, OFF_GEO);
        if geometry.pagesize as usize != PAGE_SIZE {
            return Err(Error::IncompatibleGeometry("page size differs from build"));
        }
        let mut canary = [0u64; 4];
        for (i, c) in canary.iter_mut().enumerate() {
            *c = peek_u64(buf, OFF_CANARY + i * 8);
        }
        Ok(Self {
            geometry,
            gc: TreeRecord::decode(buf, OFF_GC),
            main: TreeRecord::decode(buf, OFF_MAIN),
            last_pgno: peek_u64(buf, OFF_LAST_PGNO),
            txnid: TxnId(peek_u64(buf, OFF_TXNID)),
            retired: peek_u64(buf, OFF_RETIRED),
            canary,
            steady: peek_u32(buf, OFF_STEADY) != 0,
        })
    }

    /// Sanity bounds for a decoded meta against the actual file size
    pub fn plausible(&self, file_pages: u64) -> bool {
        let roots_ok = |r: u64| r == TreeRecord::NO_ROOT || (r >= META_COUNT as u64 && r <= self.last_pgno);
        self.last_pgno < file_pages
            && self.last_pgno >= META_COUNT as u64 - 1
            && roots_ok(self.gc.root)
            && roots_ok(self.main.root)
    }
}

/// Tail-sign over the meta bytes preceding the tail field
pub fn tail_sign(bytes: &[u8]) -> u64 {
    let mut h = crc32fast::Hasher::new();
    h.update(bytes);
    let crc = h.finalize();
    (u64::from(crc) << 32) | u64::from(!crc)
}

/// Pick the recent meta: greatest valid txnid (ties broken by slot order)
///
/// Metas that decode but reference pages beyond `file_pages` are demoted, so
/// a crash between data writes and the meta fsync can never resurrect a
/// half-written commit.
pub fn select_recent(metas: &[Result<MetaPage>; META_COUNT], file_pages: u64) -> Result<(usize, MetaPage)> {
    let mut best: Option<(usize, MetaPage)> = None;
    for (slot, meta) in metas.iter().enumerate() {
        let meta = match meta {
            Ok(m) if m.plausible(file_pages) => m,
            Ok(m) => {
                tracing::warn!(slot, txnid = m.txnid.0, "demoting meta: references pages beyond the file");
                continue;
            }
            Err(_) => continue,
        };
        match &best {
            Some((_, b)) if b.txnid.0 >= meta.txnid.0 => {}
            _ => best = Some((slot, *meta)),
        }
    }
    best.ok_or(Error::InvalidMeta)
}

/// Pick the stable meta: greatest valid txnid known durable
pub fn select_stable(metas: &[Result<MetaPage>; META_COUNT], file_pages: u64) -> Result<(usize, MetaPage)> {
    let mut best: Option<(usize, MetaPage)> = None;
    for (slot, meta) in metas.iter().enumerate() {
        let meta = match meta {
            Ok(m) if m.steady && m.plausible(file_pages) => m,
            _ => continue,
        };
        match &best {
            Some((_, b)) if b.txnid.0 >= meta.txnid.0 => {}
            _ => best = Some((slot, *meta)),
        }
    }
    best.ok_or(Error::InvalidMeta)
}

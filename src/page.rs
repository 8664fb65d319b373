//! Page layout and node codec
//!
//! Pages are the fundamental unit of storage. Each page is PAGE_SIZE bytes
//! and starts with a fixed header. Branch and leaf pages hold a u16 offset
//! table (`entries[]`) growing upward from the header and node bodies growing
//! downward from the end of the page; `lower`/`upper` are the watermarks of
//! the two regions. Large (overflow) pages carry only a run length and raw
//! payload. All multi-byte fields go through the byte-copy thunks in
//! [`crate::unaligned`]; the codec never assumes host alignment.

use crate::comparator::Comparator;
use crate::error::{Error, PageId, Result, TxnId};
use crate::unaligned::{peek_u16, peek_u64, poke_u16, poke_u64};
use bitflags::bitflags;
use static_assertions::const_assert;
use std::mem::size_of;

/// Page size in bytes; recorded in the meta geometry and checked at open
pub const PAGE_SIZE: usize = 4096;

/// Values larger than this go to a run of large pages
pub const MAX_INLINE_VALUE: usize = PAGE_SIZE / 4;

/// Maximum key size accepted by the codec
pub const MAX_KEY_SIZE: usize = 511;

/// Encoded sub-page above this converts to a nested tree
pub const SUBPAGE_MAX: usize = PAGE_SIZE / 2;

/// A nested tree whose content would encode below this converts back inline
pub const SUBPAGE_MIN: usize = PAGE_SIZE / 8;

const_assert!(PAGE_SIZE >= 512);
const_assert!(PAGE_SIZE.is_power_of_two());

bitflags! {
    /// Flags for page types and in-memory states
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page (internal B+tree node)
        const BRANCH = 0x01;
        /// Leaf page
        const LEAF = 0x02;
        /// Large (overflow) page run
        const LARGE = 0x04;
        /// Meta page
        const META = 0x08;
        /// Dup-fixed leaf: dense array of equal-sized values
        const DUPFIX = 0x10;
        /// Nested mini-page stored inside a leaf value slot
        const SUBPAGE = 0x20;
        /// Modified in the current transaction (in-memory only)
        const DIRTY = 0x40;
        /// Written to its final location but still owned by the txn
        const SPILLED = 0x80;
        /// Flags that persist on disk
        const PERSISTENT = Self::BRANCH.bits() | Self::LEAF.bits() | Self::LARGE.bits()
            | Self::META.bits() | Self::DUPFIX.bits() | Self::SUBPAGE.bits();
    }
}

/// Page header, at the start of every page
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Page number
    pub pgno: u64,
    /// Transaction that last wrote this page
    pub txnid: u64,
    /// Page flags
    pub flags: PageFlags,
    /// End of the entries[] table (absolute offset)
    pub lower: u16,
    /// Start of the node-body heap (absolute offset)
    pub upper: u16,
    /// Record size for DUPFIX leaves, 0 otherwise
    pub dupfix: u16,
    /// Run length for LARGE pages, 0 otherwise
    pub pages: u32,
    /// Reserved, zero on disk
    pub reserved: u32,
}

impl PageHeader {
    /// Size of the page header
    pub const SIZE: usize = size_of::<Self>();

    /// Create a header for an empty page
    pub fn new(pgno: u64, txnid: u64, flags: PageFlags) -> Self {
        Self {
            pgno,
            txnid,
            flags,
            lower: Self::SIZE as u16,
            upper: PAGE_SIZE as u16,
            dupfix: 0,
            pages: 0,
            reserved: 0,
        }
    }
}

const_assert!(PageHeader::SIZE == 32);

bitflags! {
    /// Node flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        /// Value lives in a run of large pages; body holds the starting pgno
        const BIGDATA = 0x01;
        /// Value is a serialized tree record (nested tree / named table)
        const SUBDATA = 0x02;
        /// Value is an inline sub-page of duplicates
        const DUPDATA = 0x04;
    }
}

/// Node header preceding each node body
///
/// `lo`/`hi` form the 32-bit value length. For branch nodes the body is the
/// 8-byte child pgno; for BIGDATA nodes the body is the 8-byte starting pgno
/// of the large run while `lo`/`hi` keep the logical value length.
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    /// Low 16 bits of the value length
    pub lo: u16,
    /// High 16 bits of the value length
    pub hi: u16,
    /// Node flags
    pub flags: NodeFlags,
    /// Key length
    pub ksize: u16,
}

impl NodeHeader {
    /// Encoded size of a node header
    pub const SIZE: usize = 8;

    /// Logical value length
    pub fn value_len(&self) -> usize {
        self.lo as usize | ((self.hi as usize) << 16)
    }

    fn read(buf: &[u8], off: usize) -> Self {
        Self {
            lo: peek_u16(buf, off),
            hi: peek_u16(buf, off + 2),
            flags: NodeFlags::from_bits_truncate(peek_u16(buf, off + 4)),
            ksize: peek_u16(buf, off + 6),
        }
    }

    fn write(&self, buf: &mut [u8], off: usize) {
        poke_u16(buf, off, self.lo);
        poke_u16(buf, off + 2, self.hi);
        poke_u16(buf, off + 4, self.flags.bits());
        poke_u16(buf, off + 6, self.ksize);
    }
}

/// Bytes a node occupies on the page (header + key + stored body, even-aligned)
pub fn node_size(key_len: usize, stored_value_len: usize) -> usize {
    (NodeHeader::SIZE + key_len + stored_value_len + 1) & !1
}

/// Largest node that still allows two nodes per leaf
pub const MAX_NODE_SIZE: usize = (PAGE_SIZE - PageHeader::SIZE) / 2 - size_of::<u16>();

/// Result of searching for a key in a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key found at index
    Found {
        /// Index of the matching node
        index: usize,
    },
    /// Key absent; it would sort at this index
    NotFound {
        /// Insertion position keeping the page sorted
        insert_pos: usize,
    },
}

/// A page in memory or in the map
#[repr(C, align(4096))]
pub struct Page {
    /// Page header
    pub header: PageHeader,
    /// Entries table and node heap
    pub data: [u8; PAGE_SIZE - PageHeader::SIZE],
}

const_assert!(size_of::<Page>() == PAGE_SIZE);

impl Page {
    /// Allocate a zeroed page with the given header
    pub fn new(pgno: PageId, txnid: TxnId, flags: PageFlags) -> Box<Self> {
        let layout = std::alloc::Layout::new::<Page>();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut Page;
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        let mut page = unsafe { Box::from_raw(ptr) };
        page.header = PageHeader::new(pgno.0, txnid.0, flags);
        page
    }

    /// Byte-copy this page into a fresh shadow
    pub fn clone_box(&self) -> Box<Self> {
        let layout = std::alloc::Layout::new::<Page>();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut Page;
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Page as *const u8, ptr as *mut u8, PAGE_SIZE);
            Box::from_raw(ptr)
        }
    }

    /// View a mapped page
    ///
    /// # Safety
    /// `bytes` must point at PAGE_SIZE page-aligned bytes that outlive `'a`.
    pub unsafe fn from_raw<'a>(bytes: *const u8) -> &'a Self {
        debug_assert_eq!(bytes as usize % PAGE_SIZE, 0);
        unsafe { &*(bytes as *const Page) }
    }

    /// Whole-page byte view
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const _ as *const u8, PAGE_SIZE) }
    }

    /// Whole-page mutable byte view
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut _ as *mut u8, PAGE_SIZE) }
    }

    /// Number of nodes on a branch/leaf page
    #[inline]
    pub fn nkeys(&self) -> usize {
        (self.header.lower as usize - PageHeader::SIZE) / size_of::<u16>()
    }

    /// Free bytes between the entries table and the node heap
    #[inline]
    pub fn room(&self) -> usize {
        self.header.upper as usize - self.header.lower as usize
    }

    /// Whether `extra` more bytes of node (plus its entry) still fit
    #[inline]
    pub fn fits(&self, extra: usize) -> bool {
        self.room() >= extra + size_of::<u16>()
    }

    /// Is this a leaf page (DUPFIX leaves included)
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.header.flags.contains(PageFlags::LEAF)
    }

    /// Is this a branch page
    #[inline]
    pub fn is_branch(&self) -> bool {
        self.header.flags.contains(PageFlags::BRANCH)
    }

    /// Is this a large (overflow) page
    #[inline]
    pub fn is_large(&self) -> bool {
        self.header.flags.contains(PageFlags::LARGE)
    }

    /// Is this a dup-fixed leaf
    #[inline]
    pub fn is_dupfix(&self) -> bool {
        self.header.flags.contains(PageFlags::DUPFIX)
    }

    #[inline]
    fn entry(&self, index: usize) -> u16 {
        peek_u16(&self.data, index * size_of::<u16>())
    }

    #[inline]
    fn set_entry(&mut self, index: usize, off: u16) {
        poke_u16(&mut self.data, index * size_of::<u16>(), off);
    }

    /// Decode the node at `index`
    pub fn node(&self, index: usize) -> Result<NodeRef<'_>> {
        if index >= self.nkeys() {
            return Err(Error::InvalidParameter("node index out of bounds"));
        }
        let off = self.entry(index);
        if off < self.header.upper || off as usize >= PAGE_SIZE {
            return Err(Error::Corruption {
                details: "node offset outside the heap".into(),
                pgno: Some(PageId(self.header.pgno)),
            });
        }
        let data_off = off as usize - PageHeader::SIZE;
        let header = NodeHeader::read(&self.data, data_off);
        let body = data_off + NodeHeader::SIZE;
        let stored = if header.flags.contains(NodeFlags::BIGDATA) {
            size_of::<u64>()
        } else {
            header.value_len()
        };
        if body + header.ksize as usize + stored > self.data.len() {
            return Err(Error::Corruption {
                details: "node extends beyond page".into(),
                pgno: Some(PageId(self.header.pgno)),
            });
        }
        Ok(NodeRef { header, page: self, data_off })
    }

    /// Binary search for `key` among the page's nodes
    pub fn search(&self, key: &[u8], cmp: &Comparator) -> Result<SearchResult> {
        let mut left = 0usize;
        let mut right = self.nkeys();
        while left < right {
            let mid = left + (right - left) / 2;
            let node = self.node(mid)?;
            match cmp.compare(key, node.key()) {
                std::cmp::Ordering::Less => right = mid,
                std::cmp::Ordering::Greater => left = mid + 1,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found { index: mid }),
            }
        }
        Ok(SearchResult::NotFound { insert_pos: left })
    }

    /// Insert a node at `index`, shifting the entries table
    ///
    /// `stored_value` is what lands in the body: the value itself, a child
    /// or large-run pgno, a tree record, or an encoded sub-page.
    /// `logical_len` is the length recorded in the header (differs from
    /// `stored_value.len()` only for BIGDATA).
    pub fn insert_node(
        &mut self,
        index: usize,
        key: &[u8],
        stored_value: &[u8],
        logical_len: usize,
        flags: NodeFlags,
    ) -> Result<()> {
        let nkeys = self.nkeys();
        if index > nkeys {
            return Err(Error::InvalidParameter("insert index out of bounds"));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::InvalidParameter("key too large"));
        }
        let size = node_size(key.len(), stored_value.len());
        if !self.fits(size) {
            return Err(Error::PageFull);
        }

        let new_upper = self.header.upper as usize - size;
        let data_off = new_upper - PageHeader::SIZE;
        let header = NodeHeader {
            lo: (logical_len & 0xffff) as u16,
            hi: (logical_len >> 16) as u16,
            flags,
            ksize: key.len() as u16,
        };
        header.write(&mut self.data, data_off);
        let kstart = data_off + NodeHeader::SIZE;
        self.data[kstart..kstart + key.len()].copy_from_slice(key);
        let vstart = kstart + key.len();
        self.data[vstart..vstart + stored_value.len()].copy_from_slice(stored_value);

        // shift entries right of the insertion point
        for i in (index..nkeys).rev() {
            let off = self.entry(i);
            self.set_entry(i + 1, off);
        }
        self.set_entry(index, new_upper as u16);
        self.header.lower += size_of::<u16>() as u16;
        self.header.upper = new_upper as u16;
        Ok(())
    }

    /// Remove the node at `index`, compacting the heap
    ///
    /// Bodies below the removed node shift up so that headers + bodies +
    /// free always sum to the page size.
    pub fn remove_node(&mut self, index: usize) -> Result<()> {
        let nkeys = self.nkeys();
        if index >= nkeys {
            return Err(Error::InvalidParameter("remove index out of bounds"));
        }
        let node = self.node(index)?;
        let size = node.on_page_size();
        let hole = self.entry(index) as usize;

        // close the gap in the heap: [upper, hole) moves up by `size`
        let upper = self.header.upper as usize;
        let lo = upper - PageHeader::SIZE;
        let hi = hole - PageHeader::SIZE;
        self.data.copy_within(lo..hi, lo + size);

        // drop the entry and rewrite offsets of nodes that moved
        for i in index..nkeys - 1 {
            let off = self.entry(i + 1);
            self.set_entry(i, off);
        }
        let remaining = nkeys - 1;
        for i in 0..remaining {
            let off = self.entry(i) as usize;
            if off < hole {
                self.set_entry(i, (off + size) as u16);
            }
        }
        self.header.lower -= size_of::<u16>() as u16;
        self.header.upper = (upper + size) as u16;
        Ok(())
    }

    /// Replace the stored body of the node at `index` with one of equal size
    pub fn replace_node_value(&mut self, index: usize, stored_value: &[u8]) -> Result<()> {
        let node = self.node(index)?;
        let stored = node.stored_len();
        if stored != stored_value.len() {
            return Err(Error::InvalidParameter("replacement body size differs"));
        }
        let vstart = node.data_off + NodeHeader::SIZE + node.header.ksize as usize;
        self.data[vstart..vstart + stored_value.len()].copy_from_slice(stored_value);
        Ok(())
    }

    /// Drop all nodes, resetting the watermarks
    pub fn clear(&mut self) {
        self.header.lower = PageHeader::SIZE as u16;
        self.header.upper = PAGE_SIZE as u16;
    }

    /// Pick a split index that balances the byte sizes of the two halves.
    ///
    /// When the insertion lands at the rightmost edge the split is biased all
    /// the way right, leaving the new page nearly empty so sequential
    /// (append) inserts fill pages densely instead of half-and-half.
    pub fn split_point(&self, insert_pos: usize) -> usize {
        let nkeys = self.nkeys();
        debug_assert!(nkeys >= 2);
        if insert_pos >= nkeys {
            return nkeys - 1;
        }
        let mut sizes = Vec::with_capacity(nkeys);
        let mut total = 0usize;
        for i in 0..nkeys {
            let sz = match self.node(i) {
                Ok(n) => n.on_page_size() + size_of::<u16>(),
                Err(_) => 0,
            };
            sizes.push(sz);
            total += sz;
        }
        let mut acc = 0usize;
        let mut best = nkeys / 2;
        let mut best_diff = usize::MAX;
        for (i, sz) in sizes.iter().enumerate().take(nkeys - 1) {
            acc += sz;
            let diff = acc.abs_diff(total - acc);
            if diff < best_diff {
                best_diff = diff;
                best = i + 1;
            }
        }
        best.clamp(1, nkeys - 1)
    }

    // --- DUPFIX dense-array accessors -------------------------------------

    /// Number of records on a DUPFIX leaf
    #[inline]
    pub fn dupfix_count(&self) -> usize {
        debug_assert!(self.is_dupfix());
        let vsize = self.header.dupfix as usize;
        if vsize == 0 {
            return 0;
        }
        (self.header.lower as usize - PageHeader::SIZE) / vsize
    }

    /// Record `i` of a DUPFIX leaf
    pub fn dupfix_get(&self, index: usize) -> Result<&[u8]> {
        let vsize = self.header.dupfix as usize;
        if index >= self.dupfix_count() {
            return Err(Error::InvalidParameter("dupfix index out of bounds"));
        }
        let off = index * vsize;
        Ok(&self.data[off..off + vsize])
    }

    /// Insert a record at `index` in a DUPFIX leaf
    pub fn dupfix_insert(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let vsize = self.header.dupfix as usize;
        if value.len() != vsize {
            return Err(Error::InvalidParameter("dupfix record size mismatch"));
        }
        let count = self.dupfix_count();
        if index > count {
            return Err(Error::InvalidParameter("dupfix index out of bounds"));
        }
        if self.room() < vsize {
            return Err(Error::PageFull);
        }
        let start = index * vsize;
        let end = count * vsize;
        self.data.copy_within(start..end, start + vsize);
        self.data[start..start + vsize].copy_from_slice(value);
        self.header.lower += vsize as u16;
        Ok(())
    }

    /// Remove the record at `index` from a DUPFIX leaf
    pub fn dupfix_remove(&mut self, index: usize) -> Result<()> {
        let vsize = self.header.dupfix as usize;
        let count = self.dupfix_count();
        if index >= count {
            return Err(Error::InvalidParameter("dupfix index out of bounds"));
        }
        let start = (index + 1) * vsize;
        let end = count * vsize;
        self.data.copy_within(start..end, index * vsize);
        self.header.lower -= vsize as u16;
        Ok(())
    }

    // --- LARGE pages ------------------------------------------------------

    /// Payload area of a large page run's head page
    pub fn large_payload(&self) -> &[u8] {
        debug_assert!(self.is_large());
        &self.data
    }

    /// Bytes of payload a single large page carries
    pub const LARGE_PAYLOAD: usize = PAGE_SIZE - PageHeader::SIZE;

    /// Pages needed for a large value of `len` bytes
    pub fn large_run_length(len: usize) -> u32 {
        len.div_ceil(Self::LARGE_PAYLOAD) as u32
    }
}

/// Immutable view of one node
pub struct NodeRef<'a> {
    /// Decoded node header
    pub header: NodeHeader,
    page: &'a Page,
    data_off: usize,
}

impl<'a> NodeRef<'a> {
    /// Key bytes
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        let start = self.data_off + NodeHeader::SIZE;
        &self.page.data[start..start + self.header.ksize as usize]
    }

    /// Bytes stored in the body (pgno ref for BIGDATA, value otherwise)
    #[inline]
    pub fn stored(&self) -> &'a [u8] {
        let start = self.data_off + NodeHeader::SIZE + self.header.ksize as usize;
        &self.page.data[start..start + self.stored_len()]
    }

    /// Length of the stored body
    #[inline]
    pub fn stored_len(&self) -> usize {
        if self.header.flags.contains(NodeFlags::BIGDATA) {
            size_of::<u64>()
        } else {
            self.header.value_len()
        }
    }

    /// Inline value bytes; fails for BIGDATA nodes
    pub fn value(&self) -> Result<&'a [u8]> {
        if self.header.flags.contains(NodeFlags::BIGDATA) {
            return Err(Error::Corruption {
                details: "inline read of a large value".into(),
                pgno: Some(PageId(self.page.header.pgno)),
            });
        }
        Ok(self.stored())
    }

    /// Child pgno of a branch node
    pub fn child_pgno(&self) -> Result<PageId> {
        if !self.page.is_branch() {
            return Err(Error::Corruption {
                details: "child pgno on a non-branch page".into(),
                pgno: Some(PageId(self.page.header.pgno)),
            });
        }
        let off = self.data_off + NodeHeader::SIZE + self.header.ksize as usize;
        Ok(PageId(peek_u64(&self.page.data, off)))
    }

    /// Starting pgno and logical length of a BIGDATA run, if any
    pub fn large_ref(&self) -> Option<(PageId, usize)> {
        if !self.header.flags.contains(NodeFlags::BIGDATA) {
            return None;
        }
        let off = self.data_off + NodeHeader::SIZE + self.header.ksize as usize;
        Some((PageId(peek_u64(&self.page.data, off)), self.header.value_len()))
    }

    /// Bytes this node occupies on the page
    #[inline]
    pub fn on_page_size(&self) -> usize {
        node_size(self.header.ksize as usize, self.stored_len())
    }
}

/// Encode a branch/BIGDATA body: an 8-byte little-endian pgno
pub fn encode_pgno(pgno: PageId) -> [u8; 8] {
    let mut b = [0u8; 8];
    poke_u64(&mut b, 0, pgno.0);
    b
}

// --- Sub-pages ------------------------------------------------------------

/// Header of an inline sub-page: the node format recursed into a value slot.
/// Offsets inside a sub-page are relative to the sub-page start.
#[derive(Debug, Clone, Copy)]
pub struct SubPageHeader {
    /// SUBPAGE | LEAF, plus DUPFIX for fixed-width duplicates
    pub flags: PageFlags,
    /// End of the sub-entries table
    pub lower: u16,
    /// Record size when DUPFIX, 0 otherwise
    pub dupfix: u16,
}

impl SubPageHeader {
    /// Encoded size of a sub-page header
    pub const SIZE: usize = 8;
}

/// Decode the duplicate values held by an encoded sub-page, in order
pub fn subpage_values(buf: &[u8]) -> Result<Vec<&[u8]>> {
    if buf.len() < SubPageHeader::SIZE {
        return Err(Error::Corruption { details: "sub-page too short".into(), pgno: None });
    }
    let flags = PageFlags::from_bits_truncate(peek_u16(buf, 0));
    let lower = peek_u16(buf, 2) as usize;
    let dupfix = peek_u16(buf, 4) as usize;
    if !flags.contains(PageFlags::SUBPAGE) {
        return Err(Error::Corruption { details: "not a sub-page".into(), pgno: None });
    }
    let mut out = Vec::new();
    if flags.contains(PageFlags::DUPFIX) {
        if dupfix == 0 {
            return Err(Error::Corruption { details: "dupfix sub-page width 0".into(), pgno: None });
        }
        let count = (lower - SubPageHeader::SIZE) / dupfix;
        for i in 0..count {
            let off = SubPageHeader::SIZE + i * dupfix;
            out.push(&buf[off..off + dupfix]);
        }
    } else {
        let count = (lower - SubPageHeader::SIZE) / size_of::<u16>();
        for i in 0..count {
            let off = peek_u16(buf, SubPageHeader::SIZE + i * size_of::<u16>()) as usize;
            let hdr = NodeHeader::read(buf, off);
            let kstart = off + NodeHeader::SIZE;
            out.push(&buf[kstart..kstart + hdr.ksize as usize]);
        }
    }
    Ok(out)
}

/// Encode sorted duplicate values as a sub-page.
///
/// Duplicates are keys of the nested ordering, so each node stores the value
/// bytes as its key with an empty body. With `dupfix` set the dense layout is
/// used instead and every value must be exactly that wide.
pub fn subpage_encode(values: &[&[u8]], dupfix: Option<u16>) -> Result<Vec<u8>> {
    if let Some(width) = dupfix {
        let width = width as usize;
        let mut buf = vec![0u8; SubPageHeader::SIZE + values.len() * width];
        poke_u16(&mut buf, 0, (PageFlags::SUBPAGE | PageFlags::LEAF | PageFlags::DUPFIX).bits());
        poke_u16(&mut buf, 2, (SubPageHeader::SIZE + values.len() * width) as u16);
        poke_u16(&mut buf, 4, width as u16);
        for (i, v) in values.iter().enumerate() {
            if v.len() != width {
                return Err(Error::InvalidParameter("dupfix record size mismatch"));
            }
            let off = SubPageHeader::SIZE + i * width;
            buf[off..off + width].copy_from_slice(v);
        }
        return Ok(buf);
    }

    let entries = values.len() * size_of::<u16>();
    let bodies: usize = values.iter().map(|v| node_size(v.len(), 0)).sum();
    let total = SubPageHeader::SIZE + entries + bodies;
    let mut buf = vec![0u8; total];
    poke_u16(&mut buf, 0, (PageFlags::SUBPAGE | PageFlags::LEAF).bits());
    poke_u16(&mut buf, 2, (SubPageHeader::SIZE + entries) as u16);
    poke_u16(&mut buf, 4, 0);

    let mut body_off = total;
    for (i, v) in values.iter().enumerate() {
        body_off -= node_size(v.len(), 0);
        let hdr = NodeHeader { lo: 0, hi: 0, flags: NodeFlags::empty(), ksize: v.len() as u16 };
        hdr.write(&mut buf, body_off);
        buf[body_off + NodeHeader::SIZE..body_off + NodeHeader::SIZE + v.len()].copy_from_slice(v);
        poke_u16(&mut buf, SubPageHeader::SIZE + i * size_of::<u16>(), body_off as u16);
    }
    Ok(buf)
}

/// Encoded size of a sub-page holding `values` (for threshold checks)
pub fn subpage_size(values: &[&[u8]], dupfix: Option<u16>) -> usize {
    match dupfix {
        Some(w) => SubPageHeader::SIZE + values.len() * w as usize,
        None => {
            SubPageHeader::SIZE
                + values.len() * size_of::<u16>()
                + values.iter().map(|v| node_size(v.len(), 0)).sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn leaf() -> Box<Page> {
        Page::new(PageId(7), TxnId(1), PageFlags::LEAF)
    }

    #[test]
    fn test_empty_page_accounting() {
        let page = leaf();
        assert_eq!(page.nkeys(), 0);
        assert_eq!(page.room(), PAGE_SIZE - PageHeader::SIZE);
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut page = leaf();
        page.insert_node(0, b"bb", b"2", 1, NodeFlags::empty()).unwrap();
        page.insert_node(0, b"aa", b"1", 1, NodeFlags::empty()).unwrap();
        page.insert_node(2, b"cc", b"3", 1, NodeFlags::empty()).unwrap();
        assert_eq!(page.nkeys(), 3);
        assert_eq!(page.node(0).unwrap().key(), b"aa");
        assert_eq!(page.node(1).unwrap().value().unwrap(), b"2");
        assert_eq!(page.node(2).unwrap().key(), b"cc");

        let cmp = Comparator::Lexicographic;
        assert_eq!(page.search(b"bb", &cmp).unwrap(), SearchResult::Found { index: 1 });
        assert_eq!(page.search(b"ab", &cmp).unwrap(), SearchResult::NotFound { insert_pos: 1 });
    }

    #[test]
    fn test_remove_compacts_heap() {
        let mut page = leaf();
        for (i, (k, v)) in [("a", "1111"), ("b", "2222"), ("c", "3333")].iter().enumerate() {
            page.insert_node(i, k.as_bytes(), v.as_bytes(), 4, NodeFlags::empty()).unwrap();
        }
        let room_before = page.room();
        page.remove_node(1).unwrap();
        assert_eq!(page.nkeys(), 2);
        assert_eq!(page.node(0).unwrap().key(), b"a");
        assert_eq!(page.node(1).unwrap().key(), b"c");
        assert_eq!(page.node(1).unwrap().value().unwrap(), b"3333");
        let freed = node_size(1, 4) + size_of::<u16>();
        assert_eq!(page.room(), room_before + freed);
    }

    #[test]
    fn test_offsets_monotonic_within_bounds() {
        let mut page = leaf();
        for i in 0..50u32 {
            let key = format!("key{i:04}");
            let idx = match page.search(key.as_bytes(), &Comparator::Lexicographic).unwrap() {
                SearchResult::NotFound { insert_pos } => insert_pos,
                SearchResult::Found { .. } => unreachable!(),
            };
            page.insert_node(idx, key.as_bytes(), &i.to_le_bytes(), 4, NodeFlags::empty())
                .unwrap();
        }
        for i in 0..page.nkeys() {
            let off = page.entry(i);
            assert!(off >= page.header.upper);
            assert!((off as usize) < PAGE_SIZE);
            if i > 0 {
                assert!(page.node(i - 1).unwrap().key() < page.node(i).unwrap().key());
            }
        }
    }

    #[test]
    fn test_page_full() {
        let mut page = leaf();
        let big = vec![0xAAu8; 900];
        let mut i = 0usize;
        loop {
            let key = format!("k{i:03}");
            match page.insert_node(i, key.as_bytes(), &big, big.len(), NodeFlags::empty()) {
                Ok(()) => i += 1,
                Err(Error::PageFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(i >= 3);
        assert!(page.room() < node_size(4, 900) + size_of::<u16>());
    }

    #[test]
    fn test_split_point_balanced_and_biased() {
        let mut page = leaf();
        for i in 0..8usize {
            let key = format!("k{i}");
            page.insert_node(i, key.as_bytes(), &[0u8; 64], 64, NodeFlags::empty()).unwrap();
        }
        let mid = page.split_point(3);
        assert!((3..=5).contains(&mid));
        // append at the right edge biases the split fully right
        assert_eq!(page.split_point(8), 7);
    }

    #[test]
    fn test_dupfix_dense_array() {
        let mut page = Page::new(PageId(9), TxnId(1), PageFlags::LEAF | PageFlags::DUPFIX);
        page.header.dupfix = 4;
        page.dupfix_insert(0, &1u32.to_le_bytes()).unwrap();
        page.dupfix_insert(1, &3u32.to_le_bytes()).unwrap();
        page.dupfix_insert(1, &2u32.to_le_bytes()).unwrap();
        assert_eq!(page.dupfix_count(), 3);
        assert_eq!(page.dupfix_get(1).unwrap(), 2u32.to_le_bytes());
        page.dupfix_remove(0).unwrap();
        assert_eq!(page.dupfix_count(), 2);
        assert_eq!(page.dupfix_get(0).unwrap(), 2u32.to_le_bytes());
    }

    #[test]
    fn test_subpage_round_trip() {
        let values: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma"];
        let buf = subpage_encode(&values, None).unwrap();
        assert_eq!(buf.len(), subpage_size(&values, None));
        let decoded = subpage_values(&buf).unwrap();
        assert_eq!(decoded, values);

        let fixed: Vec<&[u8]> = vec![b"aaaa", b"bbbb"];
        let buf = subpage_encode(&fixed, Some(4)).unwrap();
        let decoded = subpage_values(&buf).unwrap();
        assert_eq!(decoded, fixed);
    }

    #[test]
    fn test_large_run_length() {
        assert_eq!(Page::large_run_length(1), 1);
        assert_eq!(Page::large_run_length(Page::LARGE_PAYLOAD), 1);
        assert_eq!(Page::large_run_length(Page::LARGE_PAYLOAD + 1), 2);
    }

    #[quickcheck]
    fn prop_insert_remove_round_trip(keys: Vec<Vec<u8>>) -> bool {
        let mut page = leaf();
        let mut kept: Vec<Vec<u8>> = Vec::new();
        for key in keys {
            if key.is_empty() || key.len() > 64 || kept.iter().any(|k| *k == key) {
                continue;
            }
            let idx = match page.search(&key, &Comparator::Lexicographic).unwrap() {
                SearchResult::NotFound { insert_pos } => insert_pos,
                SearchResult::Found { .. } => continue,
            };
            if page.insert_node(idx, &key, b"v", 1, NodeFlags::empty()).is_err() {
                break;
            }
            kept.push(key);
        }
        kept.sort();
        if page.nkeys() != kept.len() {
            return false;
        }
        for (i, key) in kept.iter().enumerate() {
            if page.node(i).unwrap().key() != key.as_slice() {
                return false;
            }
        }
        // removing everything restores the empty accounting
        while page.nkeys() > 0 {
            page.remove_node(0).unwrap();
        }
        page.room() == PAGE_SIZE - PageHeader::SIZE
    }
}

//! Copy-on-write B+tree
//!
//! Every mutation dirties the path from leaf to root; siblings are touched
//! only when rebalancing needs them. Structure edits follow the
//! collect-and-rebuild discipline: node contents are gathered into owned
//! buffers from the source page, then the affected pages are rebuilt, so no
//! map reference is ever held across a mutation of the dirty set.
//!
//! DUPSORT keys keep their values in a nested tree, inlined as a sub-page
//! while small. DUPFIX nested leaves use the dense fixed-width layout.
//! Values above a quarter page live in contiguous large-page runs.

use std::borrow::Cow;

use crate::comparator::Comparator;
use crate::db::{dup_comparator, key_comparator, DatabaseFlags, Dbi, PutFlags};
use crate::error::{Error, PageId, Result, TxnId};
use crate::gc;
use crate::meta::TreeRecord;
use crate::page::{
    encode_pgno, node_size, subpage_encode, subpage_size, subpage_values, NodeFlags, Page,
    PageFlags, PageHeader, SearchResult, MAX_INLINE_VALUE, MAX_KEY_SIZE, PAGE_SIZE, SUBPAGE_MAX,
    SUBPAGE_MIN,
};
use crate::txn::{mode::Mode, Transaction, Write};

/// Maximum tree depth a path may reach
const MAX_DEPTH: usize = 32;

/// Usable bytes on a branch/leaf page
const PAGE_SPACE: usize = PAGE_SIZE - PageHeader::SIZE;

/// Rebalance when a page's used share drops below half
const FILL_THRESHOLD: usize = PAGE_SPACE / 2;

/// One level of a root-to-leaf path: the branch page and the child index
/// taken through it
type Path = Vec<(PageId, usize)>;

/// A node lifted off a page into owned buffers
#[derive(Clone)]
struct OwnedNode {
    key: Vec<u8>,
    stored: Vec<u8>,
    logical: usize,
    flags: NodeFlags,
}

impl OwnedNode {
    fn size(&self) -> usize {
        node_size(self.key.len(), self.stored.len())
    }
}

fn collect_nodes(page: &Page) -> Result<Vec<OwnedNode>> {
    let mut out = Vec::with_capacity(page.nkeys());
    for i in 0..page.nkeys() {
        let node = page.node(i)?;
        out.push(OwnedNode {
            key: node.key().to_vec(),
            stored: node.stored().to_vec(),
            logical: node.header.value_len(),
            flags: node.header.flags,
        });
    }
    Ok(out)
}

fn fill_page(page: &mut Page, nodes: &[OwnedNode]) -> Result<()> {
    page.clear();
    for (i, n) in nodes.iter().enumerate() {
        page.insert_node(i, &n.key, &n.stored, n.logical, n.flags)?;
    }
    Ok(())
}

fn used_bytes(page: &Page) -> usize {
    PAGE_SPACE - page.room()
}

// --- descent ---------------------------------------------------------------

fn branch_child_index(page: &Page, key: &[u8], cmp: &Comparator) -> Result<usize> {
    match page.search(key, cmp)? {
        SearchResult::Found { index } => Ok(index),
        SearchResult::NotFound { insert_pos } => Ok(insert_pos.saturating_sub(1)),
    }
}

fn descend<M: Mode>(
    txn: &Transaction<'_, M>,
    rec: &TreeRecord,
    key: &[u8],
    cmp: &Comparator,
) -> Result<(Path, PageId)> {
    let mut path = Path::new();
    let mut pgno = PageId(rec.root);
    loop {
        let page = txn.page(pgno)?;
        if page.is_leaf() {
            return Ok((path, pgno));
        }
        if !page.is_branch() || page.nkeys() == 0 {
            return Err(Error::Corruption {
                details: "descent hit a non-branch page".into(),
                pgno: Some(pgno),
            });
        }
        let idx = branch_child_index(page, key, cmp)?;
        let child = page.node(idx)?.child_pgno()?;
        path.push((pgno, idx));
        pgno = child;
        if path.len() > MAX_DEPTH {
            return Err(Error::CursorFull);
        }
    }
}

/// Descend along one edge (0 = leftmost child, otherwise rightmost)
pub(crate) fn descend_edge<M: Mode>(
    txn: &Transaction<'_, M>,
    rec: &TreeRecord,
    leftmost: bool,
) -> Result<Option<(Path, PageId)>> {
    if rec.root == TreeRecord::NO_ROOT {
        return Ok(None);
    }
    let mut path = Path::new();
    let mut pgno = PageId(rec.root);
    loop {
        let page = txn.page(pgno)?;
        if page.is_leaf() {
            return Ok(Some((path, pgno)));
        }
        if !page.is_branch() || page.nkeys() == 0 {
            return Err(Error::Corruption {
                details: "descent hit a non-branch page".into(),
                pgno: Some(pgno),
            });
        }
        let idx = if leftmost { 0 } else { page.nkeys() - 1 };
        let child = page.node(idx)?.child_pgno()?;
        path.push((pgno, idx));
        pgno = child;
        if path.len() > MAX_DEPTH {
            return Err(Error::CursorFull);
        }
    }
}

/// COW the whole path plus the leaf, patching parent child pointers as the
/// page numbers move. Returns the relocated path and leaf.
fn touch_path(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    path: &Path,
    leaf: PageId,
) -> Result<(Path, PageId)> {
    let mut new_path = Path::with_capacity(path.len());
    let mut parent: Option<(PageId, usize)> = None;
    for (pgno, idx) in path {
        let moved = txn.touch(*pgno)?;
        if moved != *pgno {
            match parent {
                Some((ppg, pidx)) => {
                    txn.dirty_page_mut(ppg)?.replace_node_value(pidx, &encode_pgno(moved))?;
                }
                None => rec.root = moved.0,
            }
        }
        parent = Some((moved, *idx));
        new_path.push((moved, *idx));
    }
    let new_leaf = txn.touch(leaf)?;
    if new_leaf != leaf {
        match parent {
            Some((ppg, pidx)) => {
                txn.dirty_page_mut(ppg)?.replace_node_value(pidx, &encode_pgno(new_leaf))?;
            }
            None => rec.root = new_leaf.0,
        }
    }
    Ok((new_path, new_leaf))
}

// --- value resolution -------------------------------------------------------

fn resolve_value<'t, M: Mode>(
    txn: &'t Transaction<'_, M>,
    node_flags: NodeFlags,
    stored: &'t [u8],
    logical: usize,
) -> Result<Cow<'t, [u8]>> {
    if node_flags.contains(NodeFlags::BIGDATA) {
        let head = PageId(crate::unaligned::peek_u64(stored, 0));
        return Ok(Cow::Borrowed(txn.large_bytes(head, logical)?));
    }
    if node_flags.contains(NodeFlags::DUPDATA) {
        let values = subpage_values(stored)?;
        let first = values.first().ok_or(Error::Corruption {
            details: "empty sub-page".into(),
            pgno: None,
        })?;
        return Ok(Cow::Owned(first.to_vec()));
    }
    if node_flags.contains(NodeFlags::SUBDATA) {
        let nested = TreeRecord::from_bytes(stored)?;
        let first = nested_first(txn, &nested)?.ok_or(Error::Corruption {
            details: "empty nested tree".into(),
            pgno: None,
        })?;
        return Ok(Cow::Owned(first));
    }
    Ok(Cow::Borrowed(stored))
}

/// Look up `key`; DUPSORT keys resolve to their first value
pub(crate) fn get<'t, M: Mode>(
    txn: &'t Transaction<'_, M>,
    rec: &TreeRecord,
    key: &[u8],
) -> Result<Option<Cow<'t, [u8]>>> {
    if rec.root == TreeRecord::NO_ROOT {
        return Ok(None);
    }
    let cmp = key_comparator(rec.flags);
    let (_, leaf) = descend(txn, rec, key, &cmp)?;
    let page = txn.page(leaf)?;
    match page.search(key, &cmp)? {
        SearchResult::Found { index } => {
            let node = page.node(index)?;
            Ok(Some(resolve_value(txn, node.header.flags, node.stored(), node.header.value_len())?))
        }
        SearchResult::NotFound { .. } => Ok(None),
    }
}

/// Number of values stored under `key`
pub(crate) fn dup_count<M: Mode>(
    txn: &Transaction<'_, M>,
    rec: &TreeRecord,
    key: &[u8],
) -> Result<u64> {
    if rec.root == TreeRecord::NO_ROOT {
        return Err(Error::NotFound);
    }
    let cmp = key_comparator(rec.flags);
    let (_, leaf) = descend(txn, rec, key, &cmp)?;
    let page = txn.page(leaf)?;
    match page.search(key, &cmp)? {
        SearchResult::Found { index } => {
            let node = page.node(index)?;
            if node.header.flags.contains(NodeFlags::DUPDATA) {
                Ok(subpage_values(node.stored())?.len() as u64)
            } else if node.header.flags.contains(NodeFlags::SUBDATA) {
                Ok(TreeRecord::from_bytes(node.stored())?.entries)
            } else {
                Ok(1)
            }
        }
        SearchResult::NotFound { .. } => Err(Error::NotFound),
    }
}

// --- insert -----------------------------------------------------------------

fn encode_value(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    value: &[u8],
) -> Result<(Vec<u8>, usize, NodeFlags)> {
    if value.len() > MAX_INLINE_VALUE {
        let (head, span) = txn.alloc_large(value.len())?;
        let buf = txn.dirty_large_mut(head)?;
        buf[PageHeader::SIZE..PageHeader::SIZE + value.len()].copy_from_slice(value);
        rec.large_pages += span;
        Ok((encode_pgno(head).to_vec(), value.len(), NodeFlags::BIGDATA))
    } else {
        Ok((value.to_vec(), value.len(), NodeFlags::empty()))
    }
}

/// Release whatever storage a leaf node's value occupies beyond the page
fn release_value(txn: &mut Transaction<'_, Write>, rec: &mut TreeRecord, node: &OwnedNode) -> Result<()> {
    if node.flags.contains(NodeFlags::BIGDATA) {
        let head = PageId(crate::unaligned::peek_u64(&node.stored, 0));
        let span = Page::large_run_length(node.logical) as u64;
        txn.free_run(head, span);
        rec.large_pages = rec.large_pages.saturating_sub(span);
    } else if node.flags.contains(NodeFlags::SUBDATA) {
        let nested = TreeRecord::from_bytes(&node.stored)?;
        free_tree_pages(txn, &nested)?;
        rec.leaf_pages = rec.leaf_pages.saturating_sub(nested.leaf_pages);
        rec.branch_pages = rec.branch_pages.saturating_sub(nested.branch_pages);
    }
    Ok(())
}

/// Insert or update `key`. Returns true when a new item was added.
pub(crate) fn put(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    key: &[u8],
    value: &[u8],
    flags: PutFlags,
) -> Result<bool> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::InvalidParameter("key length out of range"));
    }
    let is_dup = DatabaseFlags::from_bits_truncate(rec.flags).contains(DatabaseFlags::DUP_SORT);
    if is_dup && value.len() > MAX_KEY_SIZE {
        return Err(Error::InvalidParameter("DUPSORT value too large"));
    }
    if flags.intersects(PutFlags::NO_DUP_DATA | PutFlags::APPEND_DUP) && !is_dup {
        return Err(Error::IncompatibleFlags("dup flag on a non-DUPSORT table"));
    }
    let cmp = key_comparator(rec.flags);

    // first item plants the root leaf
    if rec.root == TreeRecord::NO_ROOT {
        let (stored, logical, nflags) = encode_value(txn, rec, value)?;
        let pgno = txn.alloc_page(PageFlags::LEAF)?;
        let page = txn.dirty_page_mut(pgno)?;
        page.insert_node(0, key, &stored, logical, nflags)?;
        rec.root = pgno.0;
        rec.depth = 1;
        rec.leaf_pages += 1;
        rec.entries += 1;
        if DatabaseFlags::from_bits_truncate(rec.flags).contains(DatabaseFlags::DUP_FIXED)
            && rec.dupfix_size == 0
        {
            rec.dupfix_size = value.len() as u32;
        }
        return Ok(true);
    }

    if DatabaseFlags::from_bits_truncate(rec.flags).contains(DatabaseFlags::DUP_FIXED) {
        if rec.dupfix_size == 0 {
            rec.dupfix_size = value.len() as u32;
        } else if value.len() != rec.dupfix_size as usize {
            return Err(Error::InvalidParameter("DUPFIX value size mismatch"));
        }
    }

    let (path, leaf) = descend(txn, rec, key, &cmp)?;
    let leaf_page = txn.page(leaf)?;
    let search = leaf_page.search(key, &cmp)?;

    // append ordering check against the current last key
    if flags.contains(PutFlags::APPEND) {
        if let Some(last_key) = tree_last_key(txn, rec)? {
            match cmp.compare(key, &last_key) {
                std::cmp::Ordering::Less => return Err(Error::KeyMismatch),
                std::cmp::Ordering::Equal if !is_dup => return Err(Error::KeyExists),
                _ => {}
            }
        }
    }

    match search {
        SearchResult::NotFound { insert_pos } => {
            let (stored, logical, nflags) = encode_value(txn, rec, value)?;
            let (path, leaf) = touch_path(txn, rec, &path, leaf)?;
            insert_in_leaf(txn, rec, &path, leaf, insert_pos, key, &stored, logical, nflags)?;
            rec.entries += 1;
            Ok(true)
        }
        SearchResult::Found { index } => {
            if !is_dup {
                if flags.contains(PutFlags::NO_OVERWRITE) {
                    return Err(Error::KeyExists);
                }
                let old = {
                    let page = txn.page(leaf)?;
                    let node = page.node(index)?;
                    OwnedNode {
                        key: node.key().to_vec(),
                        stored: node.stored().to_vec(),
                        logical: node.header.value_len(),
                        flags: node.header.flags,
                    }
                };
                release_value(txn, rec, &old)?;
                let (stored, logical, nflags) = encode_value(txn, rec, value)?;
                let (path, leaf) = touch_path(txn, rec, &path, leaf)?;
                txn.dirty_page_mut(leaf)?.remove_node(index)?;
                insert_in_leaf(txn, rec, &path, leaf, index, key, &stored, logical, nflags)?;
                Ok(false)
            } else {
                put_dup(txn, rec, &path, leaf, index, key, value, flags)
            }
        }
    }
}

/// Insert a duplicate value under an existing key
#[allow(clippy::too_many_arguments)]
fn put_dup(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    path: &Path,
    leaf: PageId,
    index: usize,
    key: &[u8],
    value: &[u8],
    flags: PutFlags,
) -> Result<bool> {
    if flags.contains(PutFlags::NO_OVERWRITE) {
        return Err(Error::KeyExists);
    }
    let dcmp = dup_comparator(rec.flags);
    let dupfix = DatabaseFlags::from_bits_truncate(rec.flags)
        .contains(DatabaseFlags::DUP_FIXED)
        .then_some(rec.dupfix_size as u16);

    let node = {
        let page = txn.page(leaf)?;
        let n = page.node(index)?;
        OwnedNode {
            key: n.key().to_vec(),
            stored: n.stored().to_vec(),
            logical: n.header.value_len(),
            flags: n.header.flags,
        }
    };

    if node.flags.contains(NodeFlags::SUBDATA) {
        // values live in a nested tree
        let mut nested = TreeRecord::from_bytes(&node.stored)?;
        let before = (nested.leaf_pages, nested.branch_pages);
        let inserted = nested_put(txn, &mut nested, &dcmp, value, dupfix, flags)?;
        if !inserted {
            return if flags.contains(PutFlags::NO_DUP_DATA) { Err(Error::KeyExists) } else { Ok(false) };
        }
        rec.leaf_pages += nested.leaf_pages - before.0;
        rec.branch_pages += nested.branch_pages - before.1;
        let (_, leaf) = touch_path(txn, rec, path, leaf)?;
        txn.dirty_page_mut(leaf)?.replace_node_value(index, &nested.to_bytes())?;
        rec.entries += 1;
        return Ok(true);
    }

    // gather the present values
    let mut values: Vec<Vec<u8>> = if node.flags.contains(NodeFlags::DUPDATA) {
        subpage_values(&node.stored)?.into_iter().map(|v| v.to_vec()).collect()
    } else {
        vec![node.stored.clone()]
    };

    let pos = match values.binary_search_by(|v| dcmp.compare(v, value)) {
        Ok(_) => {
            return if flags.contains(PutFlags::NO_DUP_DATA) { Err(Error::KeyExists) } else { Ok(false) };
        }
        Err(pos) => pos,
    };
    if flags.contains(PutFlags::APPEND_DUP) && pos != values.len() {
        return Err(Error::KeyMismatch);
    }
    values.insert(pos, value.to_vec());

    let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
    let encoded_size = subpage_size(&refs, dupfix);
    let (path, leaf) = touch_path(txn, rec, path, leaf)?;

    if encoded_size <= SUBPAGE_MAX {
        let encoded = subpage_encode(&refs, dupfix)?;
        txn.dirty_page_mut(leaf)?.remove_node(index)?;
        insert_in_leaf(txn, rec, &path, leaf, index, key, &encoded, encoded.len(), NodeFlags::DUPDATA)?;
    } else {
        // the dup list outgrew the inline threshold: spill to a nested tree
        let mut nested = TreeRecord::empty(rec.flags & DatabaseFlags::PERSISTENT.bits(), rec.dupfix_size);
        for v in &values {
            nested_put(txn, &mut nested, &dcmp, v, dupfix, PutFlags::empty())?;
        }
        rec.leaf_pages += nested.leaf_pages;
        rec.branch_pages += nested.branch_pages;
        let bytes = nested.to_bytes();
        txn.dirty_page_mut(leaf)?.remove_node(index)?;
        insert_in_leaf(txn, rec, &path, leaf, index, key, &bytes, bytes.len(), NodeFlags::SUBDATA)?;
    }
    rec.entries += 1;
    Ok(true)
}

/// Last key of the tree, if any
fn tree_last_key<M: Mode>(txn: &Transaction<'_, M>, rec: &TreeRecord) -> Result<Option<Vec<u8>>> {
    match descend_edge(txn, rec, false)? {
        None => Ok(None),
        Some((_, leaf)) => {
            let page = txn.page(leaf)?;
            if page.nkeys() == 0 {
                return Ok(None);
            }
            Ok(Some(page.node(page.nkeys() - 1)?.key().to_vec()))
        }
    }
}

/// Insert a node into a dirty leaf, splitting up the tree as needed
#[allow(clippy::too_many_arguments)]
fn insert_in_leaf(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    path: &Path,
    leaf: PageId,
    index: usize,
    key: &[u8],
    stored: &[u8],
    logical: usize,
    nflags: NodeFlags,
) -> Result<()> {
    let outcome = txn.dirty_page_mut(leaf)?.insert_node(index, key, stored, logical, nflags);
    match outcome {
        Ok(()) => Ok(()),
        Err(Error::PageFull) => split_insert(
            txn,
            rec,
            path,
            leaf,
            index,
            OwnedNode { key: key.to_vec(), stored: stored.to_vec(), logical, flags: nflags },
            PageFlags::LEAF,
        ),
        Err(e) => Err(e),
    }
}

/// Split `pgno` (already dirty) to make room for `new_node` at `index`,
/// pushing a separator into the parent (recursively splitting branches).
fn split_insert(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    path: &Path,
    pgno: PageId,
    index: usize,
    new_node: OwnedNode,
    kind: PageFlags,
) -> Result<()> {
    let mut nodes = {
        let page = txn.page(pgno)?;
        collect_nodes(page)?
    };
    nodes.insert(index, new_node);

    // byte-balanced split point, biased fully right on edge appends
    let total: usize = nodes.iter().map(|n| n.size() + 2).sum();
    let split = if index == nodes.len() - 1 {
        nodes.len() - 1
    } else {
        let mut acc = 0usize;
        let mut best = nodes.len() / 2;
        let mut best_diff = usize::MAX;
        for (i, n) in nodes.iter().enumerate().take(nodes.len() - 1) {
            acc += n.size() + 2;
            let diff = acc.abs_diff(total - acc);
            if diff < best_diff {
                best_diff = diff;
                best = i + 1;
            }
        }
        best.clamp(1, nodes.len() - 1)
    };

    let right_nodes = nodes.split_off(split);
    let sep_key = right_nodes[0].key.clone();
    let left_min = nodes[0].key.clone();

    let right_pgno = txn.alloc_page(kind)?;
    fill_page(txn.dirty_page_mut(right_pgno)?, &right_nodes)?;
    fill_page(txn.dirty_page_mut(pgno)?, &nodes)?;
    if kind == PageFlags::LEAF {
        rec.leaf_pages += 1;
    } else {
        rec.branch_pages += 1;
    }

    match path.split_last() {
        None => {
            // the split page was the root: grow a new one
            let root = txn.alloc_page(PageFlags::BRANCH)?;
            let page = txn.dirty_page_mut(root)?;
            page.insert_node(0, &left_min, &encode_pgno(pgno), 8, NodeFlags::empty())?;
            page.insert_node(1, &sep_key, &encode_pgno(right_pgno), 8, NodeFlags::empty())?;
            rec.root = root.0;
            rec.depth += 1;
            rec.branch_pages += 1;
            Ok(())
        }
        Some(((parent, pidx), rest)) => {
            let insert_at = *pidx + 1;
            let outcome = txn.dirty_page_mut(*parent)?.insert_node(
                insert_at,
                &sep_key,
                &encode_pgno(right_pgno),
                8,
                NodeFlags::empty(),
            );
            match outcome {
                Ok(()) => Ok(()),
                Err(Error::PageFull) => split_insert(
                    txn,
                    rec,
                    &rest.to_vec(),
                    *parent,
                    insert_at,
                    OwnedNode {
                        key: sep_key,
                        stored: encode_pgno(right_pgno).to_vec(),
                        logical: 8,
                        flags: NodeFlags::empty(),
                    },
                    PageFlags::BRANCH,
                ),
                Err(e) => Err(e),
            }
        }
    }
}

// --- delete -----------------------------------------------------------------

/// Delete `key`, or a single duplicate when `value` is given.
/// Returns true when something was removed.
pub(crate) fn del(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<bool> {
    if rec.root == TreeRecord::NO_ROOT {
        return Err(Error::NotFound);
    }
    let cmp = key_comparator(rec.flags);
    let is_dup = DatabaseFlags::from_bits_truncate(rec.flags).contains(DatabaseFlags::DUP_SORT);
    let (path, leaf) = descend(txn, rec, key, &cmp)?;
    let index = match txn.page(leaf)?.search(key, &cmp)? {
        SearchResult::Found { index } => index,
        SearchResult::NotFound { .. } => return Err(Error::NotFound),
    };
    let node = {
        let page = txn.page(leaf)?;
        let n = page.node(index)?;
        OwnedNode {
            key: n.key().to_vec(),
            stored: n.stored().to_vec(),
            logical: n.header.value_len(),
            flags: n.header.flags,
        }
    };

    match (value, is_dup) {
        (Some(v), true) => return del_dup(txn, rec, &path, leaf, index, key, &node, v),
        (Some(v), false) => {
            // plain table: the value must match to delete
            let current = resolve_value(txn, node.flags, &node.stored, node.logical)?;
            if current.as_ref() != v {
                return Err(Error::NotFound);
            }
        }
        (None, _) => {}
    }

    // whole-key removal
    let removed_entries = if node.flags.contains(NodeFlags::DUPDATA) {
        subpage_values(&node.stored)?.len() as u64
    } else if node.flags.contains(NodeFlags::SUBDATA) {
        TreeRecord::from_bytes(&node.stored)?.entries
    } else {
        1
    };
    release_value(txn, rec, &node)?;
    let (path, leaf) = touch_path(txn, rec, &path, leaf)?;
    txn.dirty_page_mut(leaf)?.remove_node(index)?;
    rec.entries = rec.entries.saturating_sub(removed_entries);
    rebalance(txn, rec, &path, leaf)?;
    Ok(true)
}

/// Delete one duplicate value of `key`
#[allow(clippy::too_many_arguments)]
fn del_dup(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    path: &Path,
    leaf: PageId,
    index: usize,
    key: &[u8],
    node: &OwnedNode,
    value: &[u8],
) -> Result<bool> {
    let dcmp = dup_comparator(rec.flags);
    let dupfix = DatabaseFlags::from_bits_truncate(rec.flags)
        .contains(DatabaseFlags::DUP_FIXED)
        .then_some(rec.dupfix_size as u16);

    if node.flags.contains(NodeFlags::SUBDATA) {
        let mut nested = TreeRecord::from_bytes(&node.stored)?;
        let before = (nested.leaf_pages, nested.branch_pages);
        if !nested_del(txn, &mut nested, &dcmp, value, dupfix)? {
            return Err(Error::NotFound);
        }
        rec.leaf_pages = rec.leaf_pages.saturating_sub(before.0 - nested.leaf_pages);
        rec.branch_pages = rec.branch_pages.saturating_sub(before.1 - nested.branch_pages);
        rec.entries = rec.entries.saturating_sub(1);
        let (path, leaf) = touch_path(txn, rec, path, leaf)?;

        if nested.entries == 0 {
            txn.dirty_page_mut(leaf)?.remove_node(index)?;
            rebalance(txn, rec, &path, leaf)?;
            return Ok(true);
        }
        // shrink back inline once the content is small enough
        let values = nested_collect(txn, &nested)?;
        let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
        if subpage_size(&refs, dupfix) <= SUBPAGE_MIN {
            free_tree_pages(txn, &nested)?;
            rec.leaf_pages = rec.leaf_pages.saturating_sub(nested.leaf_pages);
            rec.branch_pages = rec.branch_pages.saturating_sub(nested.branch_pages);
            txn.dirty_page_mut(leaf)?.remove_node(index)?;
            if refs.len() == 1 {
                insert_in_leaf(txn, rec, &path, leaf, index, key, &refs[0].to_vec(), refs[0].len(), NodeFlags::empty())?;
            } else {
                let encoded = subpage_encode(&refs, dupfix)?;
                insert_in_leaf(txn, rec, &path, leaf, index, key, &encoded, encoded.len(), NodeFlags::DUPDATA)?;
            }
        } else {
            txn.dirty_page_mut(leaf)?.replace_node_value(index, &nested.to_bytes())?;
        }
        return Ok(true);
    }

    let mut values: Vec<Vec<u8>> = if node.flags.contains(NodeFlags::DUPDATA) {
        subpage_values(&node.stored)?.into_iter().map(|v| v.to_vec()).collect()
    } else {
        vec![node.stored.clone()]
    };
    let pos = match values.binary_search_by(|v| dcmp.compare(v, value)) {
        Ok(pos) => pos,
        Err(_) => return Err(Error::NotFound),
    };
    values.remove(pos);
    rec.entries = rec.entries.saturating_sub(1);
    let (path, leaf) = touch_path(txn, rec, path, leaf)?;
    txn.dirty_page_mut(leaf)?.remove_node(index)?;

    if values.is_empty() {
        rebalance(txn, rec, &path, leaf)?;
    } else if values.len() == 1 {
        let single = values.pop().unwrap_or_default();
        insert_in_leaf(txn, rec, &path, leaf, index, key, &single, single.len(), NodeFlags::empty())?;
    } else {
        let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
        let encoded = subpage_encode(&refs, dupfix)?;
        insert_in_leaf(txn, rec, &path, leaf, index, key, &encoded, encoded.len(), NodeFlags::DUPDATA)?;
    }
    Ok(true)
}

/// Merge or rotate an underfull page, collapsing the root when it thins out
fn rebalance(
    txn: &mut Transaction<'_, Write>,
    rec: &mut TreeRecord,
    path: &Path,
    pgno: PageId,
) -> Result<()> {
    let (nkeys, used, is_leaf) = {
        let page = txn.page(pgno)?;
        (page.nkeys(), used_bytes(page), page.is_leaf())
    };

    match path.split_last() {
        None => {
            // the page is the root
            if is_leaf {
                if nkeys == 0 {
                    txn.free_page(pgno);
                    rec.root = TreeRecord::NO_ROOT;
                    rec.depth = 0;
                    rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
                }
            } else if nkeys == 1 {
                // root collapse: promote the only child
                let child = txn.page(pgno)?.node(0)?.child_pgno()?;
                txn.free_page(pgno);
                rec.root = child.0;
                rec.depth = rec.depth.saturating_sub(1);
                rec.branch_pages = rec.branch_pages.saturating_sub(1);
            }
            Ok(())
        }
        Some(((parent, pidx), rest)) => {
            if used >= FILL_THRESHOLD && nkeys > 0 {
                return Ok(());
            }
            let parent = *parent;
            let pidx = *pidx;
            let parent_keys = txn.page(parent)?.nkeys();

            // prefer merging with a same-parent neighbour
            let (left_idx, right_idx) = if pidx > 0 { (pidx - 1, pidx) } else { (pidx, pidx + 1) };
            if right_idx >= parent_keys {
                // no sibling under this parent (single-child chain)
                return rebalance(txn, rec, &rest.to_vec(), parent);
            }
            let left_pgno = txn.page(parent)?.node(left_idx)?.child_pgno()?;
            let right_pgno = txn.page(parent)?.node(right_idx)?.child_pgno()?;

            // both children become ours before any move
            let left_pgno = {
                let moved = txn.touch(left_pgno)?;
                if moved != left_pgno {
                    txn.dirty_page_mut(parent)?.replace_node_value(left_idx, &encode_pgno(moved))?;
                }
                moved
            };
            let right_pgno = {
                let moved = txn.touch(right_pgno)?;
                if moved != right_pgno {
                    txn.dirty_page_mut(parent)?.replace_node_value(right_idx, &encode_pgno(moved))?;
                }
                moved
            };

            let left_nodes = collect_nodes(txn.page(left_pgno)?)?;
            let right_nodes = collect_nodes(txn.page(right_pgno)?)?;
            let combined: usize = left_nodes.iter().chain(&right_nodes).map(|n| n.size() + 2).sum();

            if combined <= PAGE_SPACE {
                // merge right into left
                let mut nodes = left_nodes;
                nodes.extend(right_nodes);
                fill_page(txn.dirty_page_mut(left_pgno)?, &nodes)?;
                txn.dirty_page_mut(parent)?.remove_node(right_idx)?;
                txn.free_page(right_pgno);
                if is_leaf {
                    rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
                } else {
                    rec.branch_pages = rec.branch_pages.saturating_sub(1);
                }
                rebalance(txn, rec, &rest.to_vec(), parent)
            } else {
                // rotate one node from the richer sibling toward the poorer
                let donate_from_left = left_nodes.len() > right_nodes.len();
                let mut left_nodes = left_nodes;
                let mut right_nodes = right_nodes;
                if donate_from_left {
                    if let Some(moved) = left_nodes.pop() {
                        right_nodes.insert(0, moved);
                    }
                } else if !right_nodes.is_empty() {
                    left_nodes.push(right_nodes.remove(0));
                }
                if left_nodes.is_empty() || right_nodes.is_empty() {
                    return Ok(());
                }
                let new_right_key = right_nodes[0].key.clone();
                // the separator swap must fit the parent, or the rotation is
                // skipped and the page stays slightly underfull
                let fits = {
                    let parent_page = txn.page(parent)?;
                    let old_sep = parent_page.node(right_idx)?;
                    let freed = node_size(old_sep.key().len(), 8);
                    node_size(new_right_key.len(), 8) <= parent_page.room() + freed
                };
                if !fits {
                    return Ok(());
                }
                fill_page(txn.dirty_page_mut(left_pgno)?, &left_nodes)?;
                fill_page(txn.dirty_page_mut(right_pgno)?, &right_nodes)?;
                let parent_page = txn.dirty_page_mut(parent)?;
                parent_page.remove_node(right_idx)?;
                parent_page.insert_node(right_idx, &new_right_key, &encode_pgno(right_pgno), 8, NodeFlags::empty())?;
                Ok(())
            }
        }
    }
}

// --- nested duplicate trees -------------------------------------------------

fn nested_leaf_flags(dupfix: Option<u16>) -> PageFlags {
    match dupfix {
        Some(_) => PageFlags::LEAF | PageFlags::DUPFIX,
        None => PageFlags::LEAF,
    }
}

fn dupfix_search(page: &Page, value: &[u8], cmp: &Comparator) -> Result<SearchResult> {
    let mut left = 0usize;
    let mut right = page.dupfix_count();
    while left < right {
        let mid = left + (right - left) / 2;
        match cmp.compare(value, page.dupfix_get(mid)?) {
            std::cmp::Ordering::Less => right = mid,
            std::cmp::Ordering::Greater => left = mid + 1,
            std::cmp::Ordering::Equal => return Ok(SearchResult::Found { index: mid }),
        }
    }
    Ok(SearchResult::NotFound { insert_pos: left })
}

/// Insert a value into a nested duplicate tree. Returns false if present.
fn nested_put(
    txn: &mut Transaction<'_, Write>,
    nested: &mut TreeRecord,
    dcmp: &Comparator,
    value: &[u8],
    dupfix: Option<u16>,
    flags: PutFlags,
) -> Result<bool> {
    if nested.root == TreeRecord::NO_ROOT {
        let pgno = txn.alloc_page(nested_leaf_flags(dupfix))?;
        let page = txn.dirty_page_mut(pgno)?;
        match dupfix {
            Some(width) => {
                page.header.dupfix = width;
                page.dupfix_insert(0, value)?;
            }
            None => page.insert_node(0, value, &[], 0, NodeFlags::empty())?,
        }
        nested.root = pgno.0;
        nested.depth = 1;
        nested.leaf_pages += 1;
        nested.entries += 1;
        return Ok(true);
    }

    if flags.contains(PutFlags::APPEND_DUP) {
        if let Some(last) = nested_last(txn, nested, dupfix)? {
            if dcmp.compare(value, &last) != std::cmp::Ordering::Greater {
                return Err(Error::KeyMismatch);
            }
        }
    }

    let (path, leaf) = descend(txn, nested, value, dcmp)?;
    let page = txn.page(leaf)?;
    let search = match dupfix {
        Some(_) => dupfix_search(page, value, dcmp)?,
        None => page.search(value, dcmp)?,
    };
    let insert_pos = match search {
        SearchResult::Found { .. } => return Ok(false),
        SearchResult::NotFound { insert_pos } => insert_pos,
    };

    let (path, leaf) = touch_path(txn, nested, &path, leaf)?;
    let outcome = match dupfix {
        Some(_) => txn.dirty_page_mut(leaf)?.dupfix_insert(insert_pos, value),
        None => txn.dirty_page_mut(leaf)?.insert_node(insert_pos, value, &[], 0, NodeFlags::empty()),
    };
    match outcome {
        Ok(()) => {}
        Err(Error::PageFull) => match dupfix {
            Some(width) => nested_dupfix_split(txn, nested, &path, leaf, insert_pos, value, width)?,
            None => split_insert(
                txn,
                nested,
                &path,
                leaf,
                insert_pos,
                OwnedNode { key: value.to_vec(), stored: Vec::new(), logical: 0, flags: NodeFlags::empty() },
                PageFlags::LEAF,
            )?,
        },
        Err(e) => return Err(e),
    }
    nested.entries += 1;
    Ok(true)
}

/// Split a dense DUPFIX leaf around an insertion
#[allow(clippy::too_many_arguments)]
fn nested_dupfix_split(
    txn: &mut Transaction<'_, Write>,
    nested: &mut TreeRecord,
    path: &Path,
    leaf: PageId,
    insert_pos: usize,
    value: &[u8],
    width: u16,
) -> Result<()> {
    let mut values: Vec<Vec<u8>> = {
        let page = txn.page(leaf)?;
        (0..page.dupfix_count()).map(|i| page.dupfix_get(i).map(|v| v.to_vec())).collect::<Result<_>>()?
    };
    values.insert(insert_pos, value.to_vec());
    let split = if insert_pos == values.len() - 1 { values.len() - 1 } else { values.len() / 2 };
    let right_values = values.split_off(split);
    let sep = right_values[0].clone();

    let right_pgno = txn.alloc_page(PageFlags::LEAF | PageFlags::DUPFIX)?;
    {
        let page = txn.dirty_page_mut(right_pgno)?;
        page.header.dupfix = width;
        for (i, v) in right_values.iter().enumerate() {
            page.dupfix_insert(i, v)?;
        }
    }
    {
        let page = txn.dirty_page_mut(leaf)?;
        page.clear();
        page.header.dupfix = width;
        for (i, v) in values.iter().enumerate() {
            page.dupfix_insert(i, v)?;
        }
    }
    nested.leaf_pages += 1;

    match path.split_last() {
        None => {
            let left_min = {
                let page = txn.page(leaf)?;
                page.dupfix_get(0)?.to_vec()
            };
            let root = txn.alloc_page(PageFlags::BRANCH)?;
            let page = txn.dirty_page_mut(root)?;
            page.insert_node(0, &left_min, &encode_pgno(leaf), 8, NodeFlags::empty())?;
            page.insert_node(1, &sep, &encode_pgno(right_pgno), 8, NodeFlags::empty())?;
            nested.root = root.0;
            nested.depth += 1;
            nested.branch_pages += 1;
            Ok(())
        }
        Some(((parent, pidx), rest)) => {
            let insert_at = *pidx + 1;
            let outcome = txn
                .dirty_page_mut(*parent)?
                .insert_node(insert_at, &sep, &encode_pgno(right_pgno), 8, NodeFlags::empty());
            match outcome {
                Ok(()) => {}
                Err(Error::PageFull) => split_insert(
                    txn,
                    nested,
                    &rest.to_vec(),
                    *parent,
                    insert_at,
                    OwnedNode {
                        key: sep,
                        stored: encode_pgno(right_pgno).to_vec(),
                        logical: 8,
                        flags: NodeFlags::empty(),
                    },
                    PageFlags::BRANCH,
                )?,
                Err(e) => return Err(e),
            }
            Ok(())
        }
    }
}

/// Last (greatest) value of a nested tree
fn nested_last<M: Mode>(
    txn: &Transaction<'_, M>,
    nested: &TreeRecord,
    dupfix: Option<u16>,
) -> Result<Option<Vec<u8>>> {
    match descend_edge(txn, nested, false)? {
        None => Ok(None),
        Some((_, leaf)) => {
            let page = txn.page(leaf)?;
            match dupfix {
                Some(_) => {
                    let count = page.dupfix_count();
                    if count == 0 {
                        return Ok(None);
                    }
                    Ok(Some(page.dupfix_get(count - 1)?.to_vec()))
                }
                None => {
                    if page.nkeys() == 0 {
                        return Ok(None);
                    }
                    Ok(Some(page.node(page.nkeys() - 1)?.key().to_vec()))
                }
            }
        }
    }
}

/// Remove a value from a nested tree. Returns false when absent.
fn nested_del(
    txn: &mut Transaction<'_, Write>,
    nested: &mut TreeRecord,
    dcmp: &Comparator,
    value: &[u8],
    dupfix: Option<u16>,
) -> Result<bool> {
    if nested.root == TreeRecord::NO_ROOT {
        return Ok(false);
    }
    let (path, leaf) = descend(txn, nested, value, dcmp)?;
    let page = txn.page(leaf)?;
    let index = match dupfix {
        Some(_) => match dupfix_search(page, value, dcmp)? {
            SearchResult::Found { index } => index,
            SearchResult::NotFound { .. } => return Ok(false),
        },
        None => match page.search(value, dcmp)? {
            SearchResult::Found { index } => index,
            SearchResult::NotFound { .. } => return Ok(false),
        },
    };
    let (path, leaf) = touch_path(txn, nested, &path, leaf)?;
    match dupfix {
        Some(_) => txn.dirty_page_mut(leaf)?.dupfix_remove(index)?,
        None => txn.dirty_page_mut(leaf)?.remove_node(index)?,
    }
    nested.entries = nested.entries.saturating_sub(1);

    // nested rebalance: drop emptied leaves and collapse thin roots
    let emptied = {
        let page = txn.page(leaf)?;
        if page.is_dupfix() { page.dupfix_count() == 0 } else { page.nkeys() == 0 }
    };
    if emptied {
        match path.split_last() {
            None => {
                txn.free_page(leaf);
                nested.root = TreeRecord::NO_ROOT;
                nested.depth = 0;
                nested.leaf_pages = nested.leaf_pages.saturating_sub(1);
            }
            Some(((parent, pidx), rest)) => {
                txn.dirty_page_mut(*parent)?.remove_node(*pidx)?;
                txn.free_page(leaf);
                nested.leaf_pages = nested.leaf_pages.saturating_sub(1);
                rebalance(txn, nested, &rest.to_vec(), *parent)?;
            }
        }
    }
    Ok(true)
}

/// First (smallest) value of a nested tree
fn nested_first<M: Mode>(txn: &Transaction<'_, M>, nested: &TreeRecord) -> Result<Option<Vec<u8>>> {
    match descend_edge(txn, nested, true)? {
        None => Ok(None),
        Some((_, leaf)) => {
            let page = txn.page(leaf)?;
            if page.is_dupfix() {
                if page.dupfix_count() == 0 {
                    return Ok(None);
                }
                Ok(Some(page.dupfix_get(0)?.to_vec()))
            } else {
                if page.nkeys() == 0 {
                    return Ok(None);
                }
                Ok(Some(page.node(0)?.key().to_vec()))
            }
        }
    }
}

/// All values of a nested tree, in order
pub(crate) fn nested_collect<M: Mode>(
    txn: &Transaction<'_, M>,
    nested: &TreeRecord,
) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    walk_tree(txn, nested, &mut |page| {
        if page.is_leaf() {
            if page.is_dupfix() {
                for i in 0..page.dupfix_count() {
                    out.push(page.dupfix_get(i)?.to_vec());
                }
            } else {
                for i in 0..page.nkeys() {
                    out.push(page.node(i)?.key().to_vec());
                }
            }
        }
        Ok(())
    })?;
    Ok(out)
}

/// Depth-first walk over every page of a tree
fn walk_tree<M: Mode, F>(txn: &Transaction<'_, M>, rec: &TreeRecord, visit: &mut F) -> Result<()>
where
    F: FnMut(&Page) -> Result<()>,
{
    if rec.root == TreeRecord::NO_ROOT {
        return Ok(());
    }
    let mut stack = vec![PageId(rec.root)];
    while let Some(pgno) = stack.pop() {
        let page = txn.page(pgno)?;
        visit(page)?;
        if page.is_branch() {
            for i in 0..page.nkeys() {
                stack.push(page.node(i)?.child_pgno()?);
            }
        }
        if stack.len() > 1 << 20 {
            return Err(Error::Corruption { details: "tree walk exploded".into(), pgno: Some(pgno) });
        }
    }
    Ok(())
}

/// Retire every page of a tree (branches, leaves, large runs, nested trees)
fn free_tree_pages(txn: &mut Transaction<'_, Write>, rec: &TreeRecord) -> Result<()> {
    if rec.root == TreeRecord::NO_ROOT {
        return Ok(());
    }
    // gather first, then free: reads must not race the dirty-set edits
    let mut pages = Vec::new();
    let mut runs: Vec<(PageId, u64)> = Vec::new();
    let mut nested_records = Vec::new();
    walk_tree(txn, rec, &mut |page| {
        pages.push(PageId(page.header.pgno));
        if page.is_leaf() && !page.is_dupfix() {
            for i in 0..page.nkeys() {
                let node = page.node(i)?;
                if let Some((head, len)) = node.large_ref() {
                    runs.push((head, Page::large_run_length(len) as u64));
                } else if node.header.flags.contains(NodeFlags::SUBDATA) {
                    nested_records.push(TreeRecord::from_bytes(node.stored())?);
                }
            }
        }
        Ok(())
    })?;
    for nested in nested_records {
        free_tree_pages(txn, &nested)?;
    }
    for (head, span) in runs {
        txn.free_run(head, span);
    }
    for pgno in pages {
        txn.free_page(pgno);
    }
    Ok(())
}

/// Empty a table; with `delete` the table's record disappears from MAIN too
pub(crate) fn drop_tree(txn: &mut Transaction<'_, Write>, dbi: Dbi, delete: bool) -> Result<()> {
    let rec = txn.tree(dbi)?;
    free_tree_pages(txn, &rec)?;
    let empty = TreeRecord::empty(rec.flags, rec.dupfix_size);
    txn.set_tree(dbi, empty)?;
    txn.invalidate_tree(dbi, delete);
    Ok(())
}

// --- GC reclamation ---------------------------------------------------------

/// Pull reclaimable GC entries (strictly below the reader horizon and our
/// own txnid) into the writer's reuse pool. Returns how many were absorbed.
pub(crate) fn gc_reclaim(
    txn: &mut Transaction<'_, Write>,
    oldest_reader: Option<TxnId>,
    own_id: TxnId,
) -> Result<usize> {
    const RECLAIM_BATCH: usize = 4;
    let rec = txn.tree(crate::db::GC_DBI)?;
    if rec.root == TreeRecord::NO_ROOT {
        return Ok(0);
    }
    // collect candidate entries from the left edge of the GC tree
    let mut candidates: Vec<(TxnId, Vec<u64>)> = Vec::new();
    {
        let mut stack = vec![(PageId(rec.root), 0usize)];
        'walk: while let Some((pgno, idx)) = stack.pop() {
            let page = txn.page(pgno)?;
            if page.is_branch() {
                if idx < page.nkeys() {
                    let child = page.node(idx)?.child_pgno()?;
                    stack.push((pgno, idx + 1));
                    stack.push((child, 0));
                }
                continue;
            }
            for i in 0..page.nkeys() {
                let node = page.node(i)?;
                let key_bytes = node.key();
                if key_bytes.len() != 8 {
                    return Err(Error::Corruption {
                        details: "GC key is not a txnid".into(),
                        pgno: Some(pgno),
                    });
                }
                let key = TxnId(crate::unaligned::peek_u64(key_bytes, 0));
                if !gc::reclaimable(key, oldest_reader) || key.0 >= own_id.0 {
                    break 'walk;
                }
                if txn.write_state_ref().gc.is_consumed(key) {
                    continue;
                }
                let pages = if let Some((head, len)) = node.large_ref() {
                    gc::decode_pages(txn.large_bytes(head, len)?)
                } else {
                    gc::decode_pages(node.value()?)
                };
                candidates.push((key, pages));
                if candidates.len() >= RECLAIM_BATCH {
                    break 'walk;
                }
            }
        }
    }
    let absorbed = candidates.len();
    let trace = crate::registry::runtime_flags().contains(crate::registry::RuntimeFlags::GC_TRACE);
    for (key, pages) in candidates {
        if trace {
            tracing::debug!(key = key.0, pages = pages.len(), "reclaiming GC entry");
        } else {
            tracing::trace!(key = key.0, pages = pages.len(), "reclaiming GC entry");
        }
        txn.write_state().gc.absorb_entry(key, &pages);
    }
    Ok(absorbed)
}

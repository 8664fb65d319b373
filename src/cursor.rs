//! Stack-based cursors
//!
//! A cursor holds the (page, index) stack from the root to its current
//! position, plus a coupled inner position for DUPSORT values (an index into
//! an inline sub-page, or a second stack through the nested tree). Stacks
//! hold page numbers, never pointers, so every step re-reads through the
//! transaction; when the tree changed under the cursor it re-seeks by the
//! remembered key instead of trusting a stale stack. Dropping or clearing
//! the table turns its cursors "poor": they keep existing but every
//! operation fails until the cursor is re-created.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::btree;
use crate::comparator::Comparator;
use crate::db::{dup_comparator, key_comparator, Database, DatabaseFlags, Dbi, PutFlags};
use crate::error::{Error, PageId, Result};
use crate::meta::TreeRecord;
use crate::page::{subpage_values, NodeFlags, SearchResult};
use crate::txn::{mode::Mode, Transaction, Write};

static CURSOR_IDS: AtomicU64 = AtomicU64::new(1);

/// Inner position over a key's duplicate values
#[derive(Debug, Clone)]
enum DupPos {
    /// The key holds a single plain value
    Single,
    /// Values inline in a sub-page; the index selects one
    SubPage(usize),
    /// Values in a nested tree; a second stack tracks the position
    Nested {
        stack: Vec<(PageId, usize)>,
        leaf: (PageId, usize),
    },
}

/// A key/value pair as borrowed or rebuilt bytes
pub type Pair<'t> = (Cow<'t, [u8]>, Cow<'t, [u8]>);

/// A table cursor
pub struct Cursor {
    dbi: Dbi,
    id: u64,
    seq: u64,
    cached: TreeRecord,
    stack: Vec<(PageId, usize)>,
    leaf: Option<(PageId, usize)>,
    dup: Option<DupPos>,
    cur_key: Option<Vec<u8>>,
    cur_val: Option<Vec<u8>>,
}

impl Cursor {
    /// Open a cursor over `db`
    pub fn new<M: Mode>(txn: &Transaction<'_, M>, db: &Database) -> Result<Self> {
        let state = txn.tree_state(db.dbi())?;
        Ok(Self {
            dbi: db.dbi(),
            id: CURSOR_IDS.fetch_add(1, Ordering::Relaxed),
            seq: state.seq,
            cached: state.record,
            stack: Vec::new(),
            leaf: None,
            dup: None,
            cur_key: None,
            cur_val: None,
        })
    }

    fn guard<M: Mode>(&mut self, txn: &Transaction<'_, M>) -> Result<TreeRecord> {
        let state = txn.tree_state(self.dbi)?;
        if state.seq != self.seq {
            return Err(Error::BadCursor);
        }
        let rec = state.record;
        if rec != self.cached {
            // the tree changed shape; rebuild the stack from the remembered key
            self.cached = rec;
            if let Some(key) = self.cur_key.clone() {
                let value = self.cur_val.clone();
                self.reposition(txn, &rec, &key, value.as_deref())?;
            } else {
                self.reset();
            }
        }
        Ok(rec)
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.leaf = None;
        self.dup = None;
        self.cur_key = None;
        self.cur_val = None;
    }

    fn is_dupsort(&self, rec: &TreeRecord) -> bool {
        DatabaseFlags::from_bits_truncate(rec.flags).contains(DatabaseFlags::DUP_SORT)
    }

    fn key_cmp(&self, rec: &TreeRecord) -> Comparator {
        key_comparator(rec.flags)
    }

    fn dup_cmp(&self, rec: &TreeRecord) -> Comparator {
        dup_comparator(rec.flags)
    }

    // --- stack plumbing ---------------------------------------------------

    fn descend_to<M: Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        rec: &TreeRecord,
        key: &[u8],
    ) -> Result<Option<usize>> {
        self.stack.clear();
        self.leaf = None;
        self.dup = None;
        if rec.root == TreeRecord::NO_ROOT {
            return Ok(None);
        }
        let cmp = self.key_cmp(rec);
        let mut pgno = PageId(rec.root);
        loop {
            let page = txn.page(pgno)?;
            if page.is_leaf() {
                return match page.search(key, &cmp)? {
                    SearchResult::Found { index } => {
                        self.leaf = Some((pgno, index));
                        Ok(Some(index))
                    }
                    SearchResult::NotFound { insert_pos } => {
                        self.leaf = Some((pgno, insert_pos));
                        Ok(None)
                    }
                };
            }
            let idx = match page.search(key, &cmp)? {
                SearchResult::Found { index } => index,
                SearchResult::NotFound { insert_pos } => insert_pos.saturating_sub(1),
            };
            let child = page.node(idx)?.child_pgno()?;
            self.stack.push((pgno, idx));
            pgno = child;
            if self.stack.len() > 32 {
                return Err(Error::CursorFull);
            }
        }
    }

    fn descend_edge<M: Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        rec: &TreeRecord,
        leftmost: bool,
    ) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        self.dup = None;
        match btree::descend_edge(txn, rec, leftmost)? {
            None => Ok(false),
            Some((path, leaf)) => {
                self.stack = path;
                let page = txn.page(leaf)?;
                if page.nkeys() == 0 {
                    // an empty page can linger at the root after deletes
                    self.leaf = Some((leaf, 0));
                    return Ok(false);
                }
                let idx = if leftmost { 0 } else { page.nkeys() - 1 };
                self.leaf = Some((leaf, idx));
                Ok(true)
            }
        }
    }

    /// Step the leaf position to the next node, climbing as needed
    fn next_node<M: Mode>(&mut self, txn: &Transaction<'_, M>) -> Result<bool> {
        let (leaf, idx) = match self.leaf {
            Some(pos) => pos,
            None => return Ok(false),
        };
        let page = txn.page(leaf)?;
        if idx + 1 < page.nkeys() {
            self.leaf = Some((leaf, idx + 1));
            return Ok(true);
        }
        // climb to the first ancestor with a right sibling
        while let Some((pgno, i)) = self.stack.pop() {
            let branch = txn.page(pgno)?;
            if i + 1 < branch.nkeys() {
                self.stack.push((pgno, i + 1));
                let mut child = branch.node(i + 1)?.child_pgno()?;
                // descend along the left edge
                loop {
                    let page = txn.page(child)?;
                    if page.is_leaf() {
                        if page.nkeys() == 0 {
                            self.leaf = Some((child, 0));
                            return self.next_node(txn);
                        }
                        self.leaf = Some((child, 0));
                        return Ok(true);
                    }
                    self.stack.push((child, 0));
                    child = page.node(0)?.child_pgno()?;
                }
            }
        }
        self.leaf = None;
        Ok(false)
    }

    /// Step the leaf position to the previous node
    fn prev_node<M: Mode>(&mut self, txn: &Transaction<'_, M>) -> Result<bool> {
        let (leaf, idx) = match self.leaf {
            Some(pos) => pos,
            None => return Ok(false),
        };
        if idx > 0 {
            self.leaf = Some((leaf, idx - 1));
            return Ok(true);
        }
        while let Some((pgno, i)) = self.stack.pop() {
            let branch = txn.page(pgno)?;
            if i > 0 {
                self.stack.push((pgno, i - 1));
                let mut child = branch.node(i - 1)?.child_pgno()?;
                loop {
                    let page = txn.page(child)?;
                    if page.is_leaf() {
                        if page.nkeys() == 0 {
                            self.leaf = Some((child, 0));
                            return self.prev_node(txn);
                        }
                        self.leaf = Some((child, page.nkeys() - 1));
                        return Ok(true);
                    }
                    let last = page.nkeys() - 1;
                    self.stack.push((child, last));
                    child = page.node(last)?.child_pgno()?;
                }
            }
        }
        self.leaf = None;
        Ok(false)
    }

    // --- dup coupling ------------------------------------------------------

    fn load_dup<M: Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        rec: &TreeRecord,
        at_first: bool,
    ) -> Result<()> {
        self.dup = None;
        if !self.is_dupsort(rec) {
            return Ok(());
        }
        let (leaf, idx) = self.leaf.ok_or(Error::NotFound)?;
        let page = txn.page(leaf)?;
        let node = page.node(idx)?;
        if node.header.flags.contains(NodeFlags::SUBDATA) {
            let nested = TreeRecord::from_bytes(node.stored())?;
            let edge = btree::descend_edge(txn, &nested, at_first)?.ok_or(Error::Corruption {
                details: "empty nested dup tree".into(),
                pgno: Some(leaf),
            })?;
            let (stack, nleaf) = edge;
            let npage = txn.page(nleaf)?;
            let count = if npage.is_dupfix() { npage.dupfix_count() } else { npage.nkeys() };
            if count == 0 {
                return Err(Error::Corruption {
                    details: "empty nested dup leaf".into(),
                    pgno: Some(nleaf),
                });
            }
            let nidx = if at_first { 0 } else { count - 1 };
            self.dup = Some(DupPos::Nested { stack, leaf: (nleaf, nidx) });
        } else if node.header.flags.contains(NodeFlags::DUPDATA) {
            let count = subpage_values(node.stored())?.len();
            let index = if at_first { 0 } else { count.saturating_sub(1) };
            self.dup = Some(DupPos::SubPage(index));
        } else {
            self.dup = Some(DupPos::Single);
        }
        Ok(())
    }

    fn advance_dup<M: Mode>(&mut self, txn: &Transaction<'_, M>, forward: bool) -> Result<bool> {
        let Some(dup) = self.dup.clone() else { return Ok(false) };
        match dup {
            DupPos::Single => Ok(false),
            DupPos::SubPage(index) => {
                let (leaf, idx) = self.leaf.ok_or(Error::NotFound)?;
                let page = txn.page(leaf)?;
                let count = subpage_values(page.node(idx)?.stored())?.len();
                if forward {
                    if index + 1 < count {
                        self.dup = Some(DupPos::SubPage(index + 1));
                        return Ok(true);
                    }
                } else if index > 0 {
                    self.dup = Some(DupPos::SubPage(index - 1));
                    return Ok(true);
                }
                Ok(false)
            }
            DupPos::Nested { mut stack, leaf } => {
                let (nleaf, nidx) = leaf;
                let page = txn.page(nleaf)?;
                let count = if page.is_dupfix() { page.dupfix_count() } else { page.nkeys() };
                if forward && nidx + 1 < count {
                    self.dup = Some(DupPos::Nested { stack, leaf: (nleaf, nidx + 1) });
                    return Ok(true);
                }
                if !forward && nidx > 0 {
                    self.dup = Some(DupPos::Nested { stack, leaf: (nleaf, nidx - 1) });
                    return Ok(true);
                }
                // climb the nested stack
                while let Some((pgno, i)) = stack.pop() {
                    let branch = txn.page(pgno)?;
                    let nkeys = branch.nkeys();
                    let step_ok = if forward { i + 1 < nkeys } else { i > 0 };
                    if !step_ok {
                        continue;
                    }
                    let ni = if forward { i + 1 } else { i - 1 };
                    stack.push((pgno, ni));
                    let mut child = branch.node(ni)?.child_pgno()?;
                    loop {
                        let page = txn.page(child)?;
                        if page.is_leaf() {
                            let count =
                                if page.is_dupfix() { page.dupfix_count() } else { page.nkeys() };
                            if count == 0 {
                                return Ok(false);
                            }
                            let pos = if forward { 0 } else { count - 1 };
                            self.dup = Some(DupPos::Nested { stack, leaf: (child, pos) });
                            return Ok(true);
                        }
                        let pos = if forward { 0 } else { page.nkeys() - 1 };
                        stack.push((child, pos));
                        child = page.node(pos)?.child_pgno()?;
                    }
                }
                Ok(false)
            }
        }
    }

    // --- pair assembly ------------------------------------------------------

    fn current_pair<'t, M: Mode>(
        &mut self,
        txn: &'t Transaction<'_, M>,
        rec: &TreeRecord,
    ) -> Result<Pair<'t>> {
        let (leaf, idx) = self.leaf.ok_or(Error::NotFound)?;
        let page = txn.page(leaf)?;
        if idx >= page.nkeys() {
            return Err(Error::NotFound);
        }
        let node = page.node(idx)?;
        let key = Cow::Borrowed(node.key());
        let value: Cow<'t, [u8]> = match &self.dup {
            Some(DupPos::SubPage(index)) => {
                let values = subpage_values(node.stored())?;
                Cow::Owned(
                    values
                        .get(*index)
                        .ok_or(Error::NotFound)?
                        .to_vec(),
                )
            }
            Some(DupPos::Nested { leaf: (nleaf, nidx), .. }) => {
                let npage = txn.page(*nleaf)?;
                if npage.is_dupfix() {
                    Cow::Borrowed(npage.dupfix_get(*nidx)?)
                } else {
                    Cow::Borrowed(npage.node(*nidx)?.key())
                }
            }
            _ => {
                if let Some((head, len)) = node.large_ref() {
                    Cow::Borrowed(txn.large_bytes(head, len)?)
                } else {
                    Cow::Borrowed(node.value()?)
                }
            }
        };
        self.cur_key = Some(key.to_vec());
        self.cur_val = Some(value.to_vec());
        self.cached = *rec;
        self.register_pins(txn);
        Ok((key, value))
    }

    fn register_pins<M: Mode>(&self, txn: &Transaction<'_, M>) {
        if !M::IS_WRITE {
            return;
        }
        let mut pages: Vec<u64> = self.stack.iter().map(|(p, _)| p.0).collect();
        if let Some((leaf, _)) = self.leaf {
            pages.push(leaf.0);
        }
        if let Some(DupPos::Nested { stack, leaf, .. }) = &self.dup {
            pages.extend(stack.iter().map(|(p, _)| p.0));
            pages.push(leaf.0 .0);
        }
        txn.pin_pages(self.id, pages);
    }

    fn reposition<M: Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        rec: &TreeRecord,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        match self.descend_to(txn, rec, key)? {
            Some(_) => {
                self.load_dup(txn, rec, true)?;
                if let (Some(v), true) = (value, self.is_dupsort(rec)) {
                    let _ = self.seek_dup_value(txn, rec, v)?;
                }
            }
            None => {
                self.dup = None;
            }
        }
        Ok(())
    }

    fn seek_dup_value<M: Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        rec: &TreeRecord,
        value: &[u8],
    ) -> Result<bool> {
        let dcmp = self.dup_cmp(rec);
        loop {
            let cur = {
                let (leaf, idx) = self.leaf.ok_or(Error::NotFound)?;
                let page = txn.page(leaf)?;
                let node = page.node(idx)?;
                match &self.dup {
                    Some(DupPos::SubPage(index)) => {
                        subpage_values(node.stored())?.get(*index).map(|v| v.to_vec())
                    }
                    Some(DupPos::Nested { leaf: (nleaf, nidx), .. }) => {
                        let npage = txn.page(*nleaf)?;
                        if npage.is_dupfix() {
                            Some(npage.dupfix_get(*nidx)?.to_vec())
                        } else {
                            Some(npage.node(*nidx)?.key().to_vec())
                        }
                    }
                    Some(DupPos::Single) => node.value().ok().map(|v| v.to_vec()),
                    None => None,
                }
            };
            let Some(cur) = cur else { return Ok(false) };
            match dcmp.compare(&cur, value) {
                std::cmp::Ordering::Less => {
                    if !self.advance_dup(txn, true)? {
                        return Ok(false);
                    }
                }
                _ => return Ok(true),
            }
        }
    }

    // --- public movement ----------------------------------------------------

    /// First key, first value
    pub fn first<'t, M: Mode>(&mut self, txn: &'t Transaction<'_, M>) -> Result<Option<Pair<'t>>> {
        let rec = self.guard(txn)?;
        if !self.descend_edge(txn, &rec, true)? {
            self.reset();
            return Ok(None);
        }
        self.load_dup(txn, &rec, true)?;
        self.current_pair(txn, &rec).map(Some)
    }

    /// Last key, last value
    pub fn last<'t, M: Mode>(&mut self, txn: &'t Transaction<'_, M>) -> Result<Option<Pair<'t>>> {
        let rec = self.guard(txn)?;
        if !self.descend_edge(txn, &rec, false)? {
            self.reset();
            return Ok(None);
        }
        self.load_dup(txn, &rec, false)?;
        self.current_pair(txn, &rec).map(Some)
    }

    /// Next value (stepping through duplicates, then keys)
    pub fn next<'t, M: Mode>(&mut self, txn: &'t Transaction<'_, M>) -> Result<Option<Pair<'t>>> {
        let rec = self.guard(txn)?;
        if self.leaf.is_none() {
            // an exhausted cursor stays exhausted; only a fresh one restarts
            if self.cur_key.is_some() {
                return Ok(None);
            }
            return self.first(txn);
        }
        if self.advance_dup(txn, true)? {
            return self.current_pair(txn, &rec).map(Some);
        }
        if !self.next_node(txn)? {
            return Ok(None);
        }
        self.load_dup(txn, &rec, true)?;
        self.current_pair(txn, &rec).map(Some)
    }

    /// Previous value
    pub fn prev<'t, M: Mode>(&mut self, txn: &'t Transaction<'_, M>) -> Result<Option<Pair<'t>>> {
        let rec = self.guard(txn)?;
        if self.leaf.is_none() {
            if self.cur_key.is_some() {
                return Ok(None);
            }
            return self.last(txn);
        }
        if self.advance_dup(txn, false)? {
            return self.current_pair(txn, &rec).map(Some);
        }
        if !self.prev_node(txn)? {
            return Ok(None);
        }
        self.load_dup(txn, &rec, false)?;
        self.current_pair(txn, &rec).map(Some)
    }

    /// Position at `key` exactly
    pub fn seek_exact<'t, M: Mode>(
        &mut self,
        txn: &'t Transaction<'_, M>,
        key: &[u8],
    ) -> Result<Option<Pair<'t>>> {
        let rec = self.guard(txn)?;
        match self.descend_to(txn, &rec, key)? {
            Some(_) => {
                self.load_dup(txn, &rec, true)?;
                self.current_pair(txn, &rec).map(Some)
            }
            None => {
                self.dup = None;
                Ok(None)
            }
        }
    }

    /// Position at the first key >= `key`
    pub fn seek<'t, M: Mode>(
        &mut self,
        txn: &'t Transaction<'_, M>,
        key: &[u8],
    ) -> Result<Option<Pair<'t>>> {
        let rec = self.guard(txn)?;
        match self.descend_to(txn, &rec, key)? {
            Some(_) => {
                self.load_dup(txn, &rec, true)?;
                self.current_pair(txn, &rec).map(Some)
            }
            None => {
                if self.leaf.is_none() {
                    return Ok(None);
                }
                // insert position may sit one past the leaf's end
                let (leaf, idx) = self.leaf.ok_or(Error::NotFound)?;
                let nkeys = txn.page(leaf)?.nkeys();
                if idx >= nkeys && !self.next_node(txn)? {
                    return Ok(None);
                }
                self.load_dup(txn, &rec, true)?;
                self.current_pair(txn, &rec).map(Some)
            }
        }
    }

    /// Number of duplicate values at the current key
    pub fn count<M: Mode>(&mut self, txn: &Transaction<'_, M>) -> Result<u64> {
        let rec = self.guard(txn)?;
        let key = self.cur_key.clone().ok_or(Error::NotFound)?;
        btree::dup_count(txn, &rec, &key)
    }

    /// Insert through the cursor, leaving it on the written pair
    pub fn put(
        &mut self,
        txn: &mut Transaction<'_, Write>,
        db: &Database,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<()> {
        let _ = self.guard(txn)?;
        db.put(txn, key, value, flags)?;
        let rec = txn.tree(self.dbi)?;
        self.cached = rec;
        self.reposition(txn, &rec, key, Some(value))?;
        self.cur_key = Some(key.to_vec());
        self.cur_val = Some(value.to_vec());
        Ok(())
    }

    /// Delete the pair under the cursor; the cursor moves to the successor
    pub fn del(&mut self, txn: &mut Transaction<'_, Write>, db: &Database) -> Result<()> {
        let rec = self.guard(txn)?;
        let key = self.cur_key.clone().ok_or(Error::NotFound)?;
        let value = self.cur_val.clone();
        if self.is_dupsort(&rec) {
            db.del(txn, &key, value.as_deref())?;
        } else {
            db.del(txn, &key, None)?;
        }
        let rec = txn.tree(self.dbi)?;
        self.cached = rec;
        self.reposition(txn, &rec, &key, value.as_deref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_ids_are_unique() {
        let a = CURSOR_IDS.fetch_add(1, Ordering::Relaxed);
        let b = CURSOR_IDS.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }
}

//! Full-database copy over an MVCC snapshot
//!
//! A copy streams the snapshot of one read transaction: three regenerated
//! meta pages naming the snapshot's roots, then every data page up to the
//! snapshot's high-water mark. Compaction skips pages no tree reaches
//! (emitting file holes when the target can seek). Throttled copies park
//! their reader between chunks so a concurrent writer is not starved of
//! page reclamation; if the snapshot moved while parked the copy restarts
//! on the newer one.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write as IoWrite};
use std::path::Path;

use crate::db::MAIN_DBI;
use crate::env::Environment;
use crate::error::{Error, PageId, Result};
use crate::meta::{MetaPage, TreeRecord, META_COUNT};
use crate::page::{NodeFlags, Page, PAGE_SIZE};
use crate::txn::{mode::Mode, Transaction};

/// Options for copying an environment
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Skip pages no tree reaches (holes in seekable targets)
    pub compact: bool,
    /// Overwrite an existing target file
    pub force: bool,
    /// Shrink the target geometry to the copied size
    pub dynamic_size: bool,
    /// Park the MVCC snapshot between chunks so the writer keeps reclaiming
    pub throttle: bool,
}

/// Pages streamed between throttle checkpoints
const CHUNK_PAGES: u64 = 256;

/// Restarts tolerated before finishing without throttling
const MAX_RESTARTS: usize = 3;

/// Copy the environment into a file at `path`
pub fn copy_to_file(env: &Environment, path: impl AsRef<Path>, options: CopyOptions) -> Result<()> {
    let path = path.as_ref();
    if path.exists() && !options.force {
        return Err(Error::InvalidParameter("target exists (use force to overwrite)"));
    }
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    {
        let mut target = FileTarget { file: &mut file };
        copy_with_restarts(env, &mut target, options)?;
    }
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Copy the environment into a non-seekable writer (stdout)
pub fn copy_to_writer<W: IoWrite>(env: &Environment, writer: &mut W, options: CopyOptions) -> Result<()> {
    let mut sink = StreamTarget { writer };
    copy_with_restarts(env, &mut sink, options)
}

trait CopyTarget {
    fn emit(&mut self, bytes: &[u8]) -> Result<()>;
    fn skip(&mut self, bytes: u64) -> Result<()>;
    fn rewind(&mut self) -> Result<()>;
    fn finish(&mut self, total: u64) -> Result<()>;
}

struct StreamTarget<'a, W: IoWrite> {
    writer: &'a mut W,
}

impl<W: IoWrite> CopyTarget for StreamTarget<'_, W> {
    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn skip(&mut self, bytes: u64) -> Result<()> {
        // a stream cannot hole-punch; emit explicit zero pages
        let zero = vec![0u8; PAGE_SIZE];
        let mut left = bytes;
        while left > 0 {
            let n = left.min(PAGE_SIZE as u64);
            self.writer.write_all(&zero[..n as usize])?;
            left -= n;
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        Err(Error::InvalidParameter("cannot restart a copy to a stream"))
    }

    fn finish(&mut self, _total: u64) -> Result<()> {
        // the holes were already emitted as zero pages
        Ok(())
    }
}

struct FileTarget<'a> {
    file: &'a mut std::fs::File,
}

impl CopyTarget for FileTarget<'_> {
    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn skip(&mut self, bytes: u64) -> Result<()> {
        self.file.seek(SeekFrom::Current(bytes as i64))?;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn finish(&mut self, total: u64) -> Result<()> {
        // a copy ending on a hole must still reach its full length
        self.file.set_len(total)?;
        Ok(())
    }
}

fn copy_with_restarts<T: CopyTarget>(env: &Environment, target: &mut T, options: CopyOptions) -> Result<()> {
    let mut throttle = options.throttle;
    for attempt in 0..=MAX_RESTARTS {
        match copy_snapshot(env, target, options, throttle) {
            Ok(()) => return Ok(()),
            Err(Error::Busy) if throttle && attempt < MAX_RESTARTS => {
                tracing::debug!(attempt, "snapshot moved while parked; restarting copy");
                target.rewind()?;
                if attempt + 1 == MAX_RESTARTS {
                    // last try runs unthrottled so it cannot be ousted again
                    throttle = false;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Busy)
}

fn copy_snapshot<T: CopyTarget>(
    env: &Environment,
    target: &mut T,
    options: CopyOptions,
    throttle: bool,
) -> Result<()> {
    let mut txn = env.read_txn()?;
    let snapshot = env.load_recent_meta()?;
    let pages_total = snapshot.last_pgno + 1;

    // regenerate the three meta slots for the copied snapshot
    let mut meta = snapshot;
    meta.steady = true;
    if options.dynamic_size {
        meta.geometry.current = pages_total.max(META_COUNT as u64 + 1) as u32;
        meta.geometry.lower = meta.geometry.lower.min(meta.geometry.current);
    }
    for slot in 0..META_COUNT as u64 {
        let page = meta.to_page(PageId(slot));
        target.emit(page.as_bytes())?;
    }

    let reachable = if options.compact { Some(reachable_pages(&txn, &snapshot)?) } else { None };

    let mut pgno = META_COUNT as u64;
    while pgno < pages_total {
        if throttle && pgno % CHUNK_PAGES == 0 && pgno > META_COUNT as u64 {
            // let the writer reclaim: drop the pin, then take a new slot
            let before = txn.id();
            txn.park()?;
            txn.resume()?;
            if txn.id() != before {
                return Err(Error::Busy);
            }
        }
        match &reachable {
            Some(set) if !set.contains(&pgno) => {
                // coalesce the hole
                let mut run = 1u64;
                while pgno + run < pages_total && !set.contains(&(pgno + run)) {
                    run += 1;
                }
                target.skip(run * PAGE_SIZE as u64)?;
                pgno += run;
            }
            _ => {
                let page = txn.page(PageId(pgno))?;
                target.emit(page.as_bytes())?;
                pgno += 1;
            }
        }
    }
    target.finish(pages_total * PAGE_SIZE as u64)?;
    Ok(())
}

fn plausible_tree(rec: &TreeRecord, last_pgno: u64) -> bool {
    (rec.root == TreeRecord::NO_ROOT || (rec.root >= META_COUNT as u64 && rec.root <= last_pgno))
        && rec.depth as usize <= 32
}

/// Every page reachable from the snapshot's roots: the GC and MAIN trees,
/// named tables found in MAIN, nested duplicate trees, and large runs
fn reachable_pages<M: Mode>(txn: &Transaction<'_, M>, snapshot: &MetaPage) -> Result<BTreeSet<u64>> {
    let main = txn.tree(MAIN_DBI)?;
    let mut reachable = BTreeSet::new();
    let mut queue: Vec<(TreeRecord, bool)> = vec![(snapshot.gc, false), (main, true)];

    while let Some((rec, is_main)) = queue.pop() {
        if rec.root == TreeRecord::NO_ROOT {
            continue;
        }
        let mut stack = vec![PageId(rec.root)];
        while let Some(pgno) = stack.pop() {
            if !reachable.insert(pgno.0) {
                continue;
            }
            let page = txn.page(pgno)?;
            if page.is_branch() {
                for i in 0..page.nkeys() {
                    stack.push(page.node(i)?.child_pgno()?);
                }
                continue;
            }
            if !page.is_leaf() || page.is_dupfix() {
                continue;
            }
            for i in 0..page.nkeys() {
                let node = page.node(i)?;
                if let Some((head, len)) = node.large_ref() {
                    let span = Page::large_run_length(len) as u64;
                    for p in head.0..head.0 + span {
                        reachable.insert(p);
                    }
                } else if node.header.flags.contains(NodeFlags::SUBDATA) {
                    let nested = TreeRecord::from_bytes(node.stored())?;
                    if plausible_tree(&nested, snapshot.last_pgno) {
                        queue.push((nested, false));
                    }
                } else if is_main && node.header.value_len() == TreeRecord::ENCODED {
                    // MAIN values of record size are named-table records
                    if let Ok(named) = TreeRecord::from_bytes(node.stored()) {
                        if plausible_tree(&named, snapshot.last_pgno) {
                            queue.push((named, false));
                        }
                    }
                }
            }
        }
    }
    Ok(reachable)
}

//! Data-file pager: map window, page lookup, geometry
//!
//! The data file is mapped once at the upper geometry bound, so the window
//! never moves for the life of the environment; growth only extends the file
//! underneath it. Reads never go past `first_unallocated`. Writes land
//! through the file descriptor (the write ring), after which the written
//! buffer is verified against the map view, because some page/buffer-cache
//! implementations make a freshly written block visible in the mapping
//! late.

use crate::error::{Error, PageId, Result};
use crate::meta::{self, Geometry, MetaPage, META_COUNT};
use crate::page::{Page, PAGE_SIZE};
use crate::reader::ReaderTable;
use memmap2::MmapRaw;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long a coherency retry may wait for the cache to settle
const COHERENCY_TIMEOUT: Duration = Duration::from_millis(250);

/// The pager over one data file
pub struct Pager {
    file: File,
    map: MmapRaw,
    geo: Mutex<Geometry>,
    /// High-water mark: lowest pgno never allocated
    first_unallocated: AtomicU64,
}

impl Pager {
    /// Create a fresh data file with genesis metas, then open it
    pub fn create(path: &Path, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.set_len(geometry.current as u64 * PAGE_SIZE as u64)?;
        let genesis = MetaPage::genesis(geometry);
        for slot in 0..META_COUNT {
            let page = genesis.to_page(PageId(slot as u64));
            file.write_all_at(page.as_bytes(), slot as u64 * PAGE_SIZE as u64)?;
        }
        file.sync_all()?;
        drop(file);
        Self::open(path, geometry)
    }

    /// Open an existing data file
    ///
    /// `requested` supplies the mapping bound (upper) and growth knobs; the
    /// recorded geometry of the chosen meta wins for sizes already in the
    /// file.
    pub fn open(path: &Path, requested: Geometry) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < (META_COUNT * PAGE_SIZE) as u64 {
            return Err(Error::InvalidMeta);
        }
        let map = memmap2::MmapOptions::new()
            .len(requested.upper as usize * PAGE_SIZE)
            .map_raw(&file)?;
        // the page cast needs the base aligned to our page size; mmap hands
        // out OS-page-aligned addresses, so this only trips when the OS page
        // is smaller than ours and the allocator got unlucky
        if (map.as_ptr() as usize) % PAGE_SIZE != 0 {
            return Err(Error::IncompatibleGeometry("map base is not page-aligned"));
        }
        tracing::debug!(
            os_page = page_size::get(),
            pages = requested.upper,
            "mapped data file window"
        );
        let pager = Self {
            file,
            map,
            geo: Mutex::new(requested),
            first_unallocated: AtomicU64::new(META_COUNT as u64),
        };
        Ok(pager)
    }

    /// Read all three meta slots directly from the file
    pub fn read_metas(&self) -> [Result<MetaPage>; META_COUNT] {
        let mut out: [Result<MetaPage>; META_COUNT] =
            [Err(Error::InvalidMeta), Err(Error::InvalidMeta), Err(Error::InvalidMeta)];
        for (slot, entry) in out.iter_mut().enumerate() {
            *entry = self.read_meta_slot(slot);
        }
        out
    }

    fn read_meta_slot(&self, slot: usize) -> Result<MetaPage> {
        let mut page = Page::new(PageId(slot as u64), crate::error::TxnId(0), crate::page::PageFlags::META);
        self.file.read_exact_at(page.as_bytes_mut(), (slot * PAGE_SIZE) as u64)?;
        MetaPage::from_page(&page)
    }

    /// Adopt the state of the selected meta after open/recovery
    ///
    /// Sizes already in the file (lower, current, pagesize) come from the
    /// meta and the actual file length; the runtime knobs (upper, growth,
    /// shrink) stay as requested since the mapping was sized from them.
    pub fn adopt(&self, meta: &MetaPage) -> Result<()> {
        let file_pages = self.file.metadata()?.len() / PAGE_SIZE as u64;
        let mut geo = self.geo.lock();
        if file_pages > geo.upper as u64 {
            return Err(Error::IncompatibleGeometry("file exceeds the requested upper bound"));
        }
        geo.lower = meta.geometry.lower;
        geo.current = (file_pages as u32).max(META_COUNT as u32);
        geo.pagesize = meta.geometry.pagesize;
        self.first_unallocated.store(meta.last_pgno + 1, Ordering::Release);
        Ok(())
    }

    /// Current geometry
    pub fn geometry(&self) -> Geometry {
        *self.geo.lock()
    }

    /// File size in pages
    pub fn current_pages(&self) -> u64 {
        self.geo.lock().current as u64
    }

    /// Lowest never-allocated pgno
    pub fn first_unallocated(&self) -> u64 {
        self.first_unallocated.load(Ordering::Acquire)
    }

    /// Publish a new high-water mark (commit / recovery)
    pub fn set_first_unallocated(&self, pgno: u64) {
        self.first_unallocated.store(pgno, Ordering::Release);
    }

    /// Borrow the backing file (write ring, copy)
    pub fn file(&self) -> &File {
        &self.file
    }

    /// View a committed page in the map
    ///
    /// The reference stays valid for the environment's life: the mapping is
    /// fixed-size and committed pages are immutable under MVCC until no
    /// snapshot can reach them.
    pub fn page(&self, pgno: PageId) -> Result<&Page> {
        self.page_at(pgno, self.first_unallocated())
    }

    /// View a page below an explicit bound (writers pass their own
    /// `next_pgno`, which may run past the committed high-water mark)
    pub fn page_at(&self, pgno: PageId, bound: u64) -> Result<&Page> {
        if pgno.0 >= bound || pgno.0 >= self.current_pages() {
            return Err(Error::Corruption {
                details: "page reference beyond the allocation high-water mark".into(),
                pgno: Some(pgno),
            });
        }
        let offset = pgno.0 as usize * PAGE_SIZE;
        let page = unsafe { Page::from_raw(self.map.as_ptr().add(offset)) };
        if crate::registry::runtime_flags().contains(crate::registry::RuntimeFlags::PARANOID_READS)
            && page.header.pgno != pgno.0
        {
            return Err(Error::Corruption {
                details: "mapped page carries a different pgno".into(),
                pgno: Some(pgno),
            });
        }
        Ok(page)
    }

    /// Contiguous byte view of a large-page run
    pub fn run_bytes(&self, head: PageId, span: u64, bound: u64) -> Result<&[u8]> {
        if head.0 + span > bound || head.0 + span > self.current_pages() {
            return Err(Error::Corruption {
                details: "large run beyond the allocation high-water mark".into(),
                pgno: Some(head),
            });
        }
        let offset = head.0 as usize * PAGE_SIZE;
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), span as usize * PAGE_SIZE) })
    }

    /// Raw byte view of a mapped page (coherency check, copy)
    pub fn page_bytes(&self, pgno: PageId) -> Result<&[u8]> {
        Ok(self.page(pgno)?.as_bytes())
    }

    /// Ensure pages `[0, needed)` exist in the file, growing inside the
    /// configured geometry. Fails with map-full at the upper bound.
    pub fn ensure_pages(&self, needed: u64) -> Result<()> {
        let mut geo = self.geo.lock();
        if needed <= geo.current as u64 {
            return Ok(());
        }
        if needed > geo.upper as u64 {
            return Err(Error::MapFull { upper: geo.upper as u64 });
        }
        let step = geo.growth.max(1) as u64;
        let grown = needed.div_ceil(step) * step;
        let new_current = grown.min(geo.upper as u64).max(geo.lower as u64);
        tracing::debug!(from = geo.current, to = new_current, "growing data file");
        self.file.set_len(new_current * PAGE_SIZE as u64)?;
        geo.current = new_current as u32;
        Ok(())
    }

    /// Shrink the file when enough trailing pages fell out of use
    pub fn maybe_shrink(&self, first_unallocated: u64) -> Result<()> {
        let mut geo = self.geo.lock();
        if geo.shrink == 0 {
            return Ok(());
        }
        let slack = (geo.current as u64).saturating_sub(first_unallocated);
        if slack < geo.shrink as u64 {
            return Ok(());
        }
        let step = geo.growth.max(1) as u64;
        let target = first_unallocated.div_ceil(step) * step;
        let target = target.max(geo.lower as u64).max(META_COUNT as u64);
        if target >= geo.current as u64 {
            return Ok(());
        }
        tracing::debug!(from = geo.current, to = target, "shrinking data file");
        self.file.set_len(target * PAGE_SIZE as u64)?;
        geo.current = target as u32;
        Ok(())
    }

    /// fdatasync the data file
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// fsync the data file (meta durability)
    pub fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Write one page at its file position (meta writes)
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let offset = page.header.pgno * PAGE_SIZE as u64;
        self.file.write_all_at(page.as_bytes(), offset)?;
        Ok(())
    }

    /// Verify that `expected` (just written at `pgno`, possibly spanning a
    /// large run) is visible in the map, retrying on delayed-arrival cache
    /// incoherence. First mismatch arms the lock-region counter so every
    /// later batch gets the full check.
    pub fn coherency_check(&self, lck: &ReaderTable, pgno: PageId, expected: &[u8]) -> Result<()> {
        debug_assert_eq!(expected.len() % PAGE_SIZE, 0);
        let offset = pgno.0 as usize * PAGE_SIZE;
        let view = unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), expected.len()) };
        if view == expected {
            return Ok(());
        }
        lck.incoherence_bump();
        tracing::warn!(pgno = pgno.0, "delayed/non-arrived page in the map; waiting for coherence");
        let deadline = Instant::now() + COHERENCY_TIMEOUT;
        loop {
            std::thread::sleep(Duration::from_millis(1));
            if view == expected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                crate::registry::debug_emit(
                    tracing::Level::ERROR,
                    "pager",
                    &format!("page {pgno} never became coherent in the map"),
                );
                return Err(Error::Incoherent(pgno));
            }
        }
    }

    /// Advise the kernel that the whole map will be needed (warmup)
    #[cfg(unix)]
    pub fn warmup(&self, lock_resident: bool) -> Result<()> {
        let len = self.current_pages() as usize * PAGE_SIZE;
        let ptr = self.map.as_ptr() as *mut libc::c_void;
        let rc = unsafe { libc::madvise(ptr, len, libc::MADV_WILLNEED) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error().to_string()));
        }
        if lock_resident {
            let rc = unsafe { libc::mlock(ptr, len) };
            if rc != 0 {
                return Err(Error::Io(std::io::Error::last_os_error().to_string()));
            }
        }
        Ok(())
    }
}

//! Fixed-size page cache over a single heap file
//!
//! Pages are identified by a 32-bit `PageId`; page offsets in the heap file
//! are `id * page_size`. Frames live in an LRU keyed by page id and are
//! handed out as `Arc<Page>`: the `Arc` doubles as the pin count, so a
//! frame with an outstanding reference is never evicted. Evicting a dirty
//! frame writes it back first.
//!
//! ## Locking
//! - `frames` mutex serializes admission/eviction bookkeeping; the heap
//!   file mutex nests inside it. Never take them in the other order.
//! - Each page carries its own reader/writer lock over the buffer. Readers
//!   take a shared guard; a writer takes the upgradable guard and upgrades,
//!   which admits exactly one upgrader at a time.

use crate::{IndexError, Result};
use lru::LruCache;
use parking_lot::{
    Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub type PageId = u32;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// One cached page frame.
pub struct Page {
    id: PageId,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Page {
    fn new(id: PageId, size: usize, dirty: bool) -> Self {
        Self {
            id,
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
            dirty: AtomicBool::new(dirty),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Shared access to the page buffer.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Upgradable shared access; pass to [`Page::upgrade`] for exclusive
    /// access. Only one upgradable guard exists at a time.
    pub fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, Box<[u8]>> {
        self.data.upgradable_read()
    }

    pub fn upgrade<'a>(
        guard: RwLockUpgradableReadGuard<'a, Box<[u8]>>,
    ) -> RwLockWriteGuard<'a, Box<[u8]>> {
        RwLockUpgradableReadGuard::upgrade(guard)
    }

    /// Exclusive access to the page buffer.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Cache counters, for sizing and debugging.
#[derive(Debug, Default, Clone)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl PageCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Page cache over one heap file.
pub struct PageCache {
    file: Mutex<File>,
    page_size: usize,
    capacity: usize,
    next_page_id: AtomicU32,
    frames: Mutex<LruCache<PageId, Arc<Page>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageCache {
    /// Open (or create) a heap file. `next_page_id` resumes from the file
    /// length; a torn trailing page is treated as unallocated.
    pub fn open(path: impl AsRef<Path>, capacity: usize, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let next = (len / page_size as u64) as u32;

        Ok(Self {
            file: Mutex::new(file),
            page_size,
            capacity: capacity.max(1),
            next_page_id: AtomicU32::new(next),
            frames: Mutex::new(LruCache::unbounded()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages allocated so far (cached or on file).
    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::Acquire)
    }

    /// Allocate a fresh zeroed page. New pages start dirty so they reach
    /// the file on the next flush even if never written to.
    pub fn new_page(&self) -> Result<Arc<Page>> {
        let id = self.next_page_id.fetch_add(1, Ordering::AcqRel);
        if id == PageId::MAX {
            return Err(IndexError::CapacityExceeded(
                "page id space exhausted".into(),
            ));
        }

        let page = Arc::new(Page::new(id, self.page_size, true));
        let mut frames = self.frames.lock();
        self.make_room(&mut frames)?;
        frames.put(id, Arc::clone(&page));
        Ok(page)
    }

    /// Fetch a page, reading it from the heap file on a cache miss.
    pub fn fetch_page(&self, id: PageId) -> Result<Arc<Page>> {
        let mut frames = self.frames.lock();
        if let Some(page) = frames.get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(page));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if id >= self.next_page_id.load(Ordering::Acquire) {
            return Err(IndexError::corrupt(format!(
                "fetch of unallocated page {}",
                id
            )));
        }

        let page = Arc::new(Page::new(id, self.page_size, false));
        {
            let mut buf = page.write();
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(id as u64 * self.page_size as u64))?;
            file.read_exact(&mut buf[..]).map_err(|e| {
                IndexError::corrupt(format!("short read of page {}: {}", id, e))
            })?;
        }

        self.make_room(&mut frames)?;
        frames.put(id, Arc::clone(&page));
        Ok(page)
    }

    /// Write every dirty frame back and fsync the heap file.
    pub fn flush_all(&self) -> Result<()> {
        let frames = self.frames.lock();
        for (_, page) in frames.iter() {
            if page.is_dirty() {
                self.write_back(page)?;
                page.dirty.store(false, Ordering::Release);
            }
        }
        drop(frames);

        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Evict unpinned frames until the cache is under capacity. Pinned
    /// frames (strong count > 1) are skipped and re-admitted.
    fn make_room(&self, frames: &mut LruCache<PageId, Arc<Page>>) -> Result<()> {
        if frames.len() < self.capacity {
            return Ok(());
        }

        let mut pinned = Vec::new();
        let mut scanned = 0;
        let scan_limit = frames.len();

        while frames.len() + pinned.len() >= self.capacity && scanned < scan_limit {
            let Some((id, page)) = frames.pop_lru() else {
                break;
            };
            scanned += 1;

            if Arc::strong_count(&page) > 1 {
                pinned.push((id, page));
                continue;
            }
            if page.is_dirty() {
                self.write_back(&page)?;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        for (id, page) in pinned {
            frames.put(id, page);
        }
        Ok(())
    }

    fn write_back(&self, page: &Arc<Page>) -> Result<()> {
        let data = page.read();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(
            page.id as u64 * self.page_size as u64,
        ))?;
        file.write_all(&data[..])?;
        Ok(())
    }
}

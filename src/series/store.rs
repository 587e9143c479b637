//! Series store: TSID ↔ label-set mapping
//!
//! A bounded LRU of decoded [`SeriesEntry`]s fronts one of two persistence
//! backends; a concurrent fingerprint map finds an entry by label set
//! without scanning. Entries are immutable once created — only the dirty
//! flag changes, flipping to clean when the WAL commit covering the series
//! returns.

use crate::config::{IndexConfig, SeriesBackendKind};
use crate::labels::{fingerprint, Label, Tsid};
use crate::series::series_file::SeriesFile;
use crate::series::symbol_table::{SymbolRef, SymbolTable};
use crate::storage::page_cache::PageCache;
use crate::tree::CowTree;
use crate::{IndexError, Result};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One cached series.
pub struct SeriesEntry {
    pub tsid: Tsid,
    pub labels: Vec<Label>,
    dirty: AtomicBool,
}

impl SeriesEntry {
    fn new(tsid: Tsid, labels: Vec<Label>, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            tsid,
            labels,
            dirty: AtomicBool::new(dirty),
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// Persistence behind the cache. Implementations buffer writes until
/// `flush`.
pub trait SeriesBackend: Send + Sync {
    fn read_entry(&self, tsid: Tsid) -> Result<Option<Vec<(SymbolRef, SymbolRef)>>>;
    fn write_entry(&self, tsid: Tsid, refs: &[(SymbolRef, SymbolRef)]) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// Segment-file backend: `series/00000000`, `series/00000001`, ...
pub struct SegmentFileBackend {
    dir: PathBuf,
    segment_size: usize,
    files: Mutex<HashMap<u64, Arc<SeriesFile>>>,
}

impl SegmentFileBackend {
    pub fn open(dir: PathBuf, segment_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            segment_size,
            files: Mutex::new(HashMap::new()),
        })
    }

    fn segment_path(&self, seg: u64) -> PathBuf {
        self.dir.join(format!("{:08}", seg))
    }

    fn segment_file(&self, seg: u64, create: bool) -> Result<Option<Arc<SeriesFile>>> {
        let mut files = self.files.lock();
        if let Some(sf) = files.get(&seg) {
            return Ok(Some(Arc::clone(sf)));
        }

        let path = self.segment_path(seg);
        if !create && !path.exists() {
            return Ok(None);
        }

        let sf = Arc::new(SeriesFile::open(path, create, self.segment_size)?);
        files.insert(seg, Arc::clone(&sf));
        Ok(Some(sf))
    }
}

impl SeriesBackend for SegmentFileBackend {
    fn read_entry(&self, tsid: Tsid) -> Result<Option<Vec<(SymbolRef, SymbolRef)>>> {
        let seg = tsid / self.segment_size as u64;
        let slot = (tsid % self.segment_size as u64) as usize;
        match self.segment_file(seg, false)? {
            Some(sf) => sf.read_entry(slot),
            None => Ok(None),
        }
    }

    fn write_entry(&self, tsid: Tsid, refs: &[(SymbolRef, SymbolRef)]) -> Result<()> {
        let seg = tsid / self.segment_size as u64;
        let slot = (tsid % self.segment_size as u64) as usize;
        let sf = self
            .segment_file(seg, true)?
            .expect("segment file created on demand");
        sf.write_entry(slot, refs)
    }

    fn flush(&self) -> Result<()> {
        let files: Vec<Arc<SeriesFile>> = self.files.lock().values().cloned().collect();
        for sf in files {
            sf.flush()?;
        }
        Ok(())
    }
}

const SERIES_TREE_FANOUT: usize = 200;

/// Single-file backend: a B+tree maps TSID to an offset in a flat entry
/// file. Tree inserts are buffered and committed on `flush`.
pub struct BTreeSeriesBackend {
    tree: CowTree<u64, u64, SERIES_TREE_FANOUT>,
    entry_file: Mutex<File>,
    pending: Mutex<HashMap<Tsid, u64>>,
}

impl BTreeSeriesBackend {
    pub fn open(index_path: PathBuf, entry_path: PathBuf, cache_size: usize) -> Result<Self> {
        let cache = Arc::new(PageCache::open(
            index_path,
            cache_size,
            crate::storage::page_cache::DEFAULT_PAGE_SIZE,
        )?);
        let tree = CowTree::open(cache)?;

        let entry_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(entry_path)?;

        Ok(Self {
            tree,
            entry_file: Mutex::new(entry_file),
            pending: Mutex::new(HashMap::new()),
        })
    }
}

impl SeriesBackend for BTreeSeriesBackend {
    fn read_entry(&self, tsid: Tsid) -> Result<Option<Vec<(SymbolRef, SymbolRef)>>> {
        let offset = match self.pending.lock().get(&tsid) {
            Some(&off) => off,
            None => match self.tree.get_value(tsid)?.last() {
                Some(&off) => off,
                None => return Ok(None),
            },
        };

        let mut file = self.entry_file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)
            .map_err(|_| IndexError::corrupt("truncated series entry record"))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|_| IndexError::corrupt("truncated series entry record"))?;

        if len < 8 || (len - 8) % 8 != 0 {
            return Err(IndexError::corrupt("malformed series entry record"));
        }
        let stored = u64::from_le_bytes(buf[..8].try_into().unwrap());
        if stored != tsid {
            return Err(IndexError::corrupt(format!(
                "series entry tsid mismatch: expected {}, found {}",
                tsid, stored
            )));
        }

        let mut refs = Vec::with_capacity((len - 8) / 8);
        for chunk in buf[8..].chunks_exact(8) {
            let name_ref = u32::from_le_bytes(chunk[..4].try_into().unwrap());
            let value_ref = u32::from_le_bytes(chunk[4..].try_into().unwrap());
            refs.push((name_ref, value_ref));
        }
        Ok(Some(refs))
    }

    fn write_entry(&self, tsid: Tsid, refs: &[(SymbolRef, SymbolRef)]) -> Result<()> {
        let entry_len = 8 + refs.len() * 8;
        let mut buf = Vec::with_capacity(4 + entry_len);
        buf.extend_from_slice(&(entry_len as u32).to_le_bytes());
        buf.extend_from_slice(&tsid.to_le_bytes());
        for (name_ref, value_ref) in refs {
            buf.extend_from_slice(&name_ref.to_le_bytes());
            buf.extend_from_slice(&value_ref.to_le_bytes());
        }

        let mut file = self.entry_file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        drop(file);

        self.pending.lock().insert(tsid, offset);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let pending: Vec<(Tsid, u64)> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        // Entry bytes must be durable before the tree can reference them.
        self.entry_file.lock().sync_all()?;

        loop {
            let mut txn = self.tree.begin()?;
            for &(tsid, offset) in &pending {
                if !self.tree.update(tsid, offset, &mut txn)? {
                    self.tree.insert(tsid, offset, &mut txn)?;
                }
            }
            match self.tree.commit(txn) {
                Ok(_) => return Ok(()),
                Err(IndexError::TransactionAborted) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Cache counters, for sizing and debugging.
#[derive(Debug, Default, Clone)]
pub struct SeriesCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// The store itself: symbol table + backend + caches.
pub struct SeriesStore {
    symtab: SymbolTable,
    backend: Box<dyn SeriesBackend>,
    cache: Mutex<LruCache<Tsid, Arc<SeriesEntry>>>,
    fingerprints: DashMap<u64, Arc<SeriesEntry>>,
    max_entries: usize,
    full_cache: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SeriesStore {
    pub fn open(config: &IndexConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.index_dir)?;
        let symtab = SymbolTable::open(config.symbol_file())?;

        let backend: Box<dyn SeriesBackend> = match config.series_backend {
            SeriesBackendKind::SegmentFile => Box::new(SegmentFileBackend::open(
                config.series_dir(),
                config.segment_size,
            )?),
            SeriesBackendKind::BTree => Box::new(BTreeSeriesBackend::open(
                config.index_dir.join("series.idx"),
                config.index_dir.join("series.db"),
                config.cache_size,
            )?),
        };

        Ok(Self {
            symtab,
            backend,
            cache: Mutex::new(LruCache::unbounded()),
            fingerprints: DashMap::new(),
            max_entries: config.series_cache_size.max(1),
            full_cache: config.full_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> SeriesCacheStats {
        SeriesCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.cache.lock().len(),
        }
    }

    pub fn add_symbol(&self, symbol: &str) -> SymbolRef {
        self.symtab.add_symbol(symbol)
    }

    pub fn get_symbol(&self, r: SymbolRef) -> Result<String> {
        self.symtab.get_symbol(r)
    }

    pub fn find_symbol(&self, symbol: &str) -> Option<SymbolRef> {
        self.symtab.find_symbol(symbol)
    }

    fn encode_refs(&self, labels: &[Label]) -> Vec<(SymbolRef, SymbolRef)> {
        labels
            .iter()
            .map(|l| (self.symtab.add_symbol(&l.name), self.symtab.add_symbol(&l.value)))
            .collect()
    }

    fn decode_refs(&self, refs: &[(SymbolRef, SymbolRef)]) -> Result<Vec<Label>> {
        refs.iter()
            .map(|&(n, v)| {
                Ok(Label {
                    name: self.symtab.get_symbol(n)?,
                    value: self.symtab.get_symbol(v)?,
                })
            })
            .collect()
    }

    /// Insert an entry into the cache, persisting it through the backend
    /// when `is_new`. Labels must already be in canonical order.
    pub fn add(&self, tsid: Tsid, labels: Vec<Label>, is_new: bool) -> Result<Arc<SeriesEntry>> {
        if is_new {
            let refs = self.encode_refs(&labels);
            self.backend.write_entry(tsid, &refs)?;
        }

        let entry = SeriesEntry::new(tsid, labels, is_new);
        self.insert_cached(Arc::clone(&entry))?;
        Ok(entry)
    }

    fn insert_cached(&self, entry: Arc<SeriesEntry>) -> Result<()> {
        let fp = fingerprint(&entry.labels);
        let mut cache = self.cache.lock();

        if !self.full_cache {
            while cache.len() >= self.max_entries {
                let Some((_, victim)) = cache.pop_lru() else {
                    break;
                };
                if victim.is_dirty() {
                    let refs = self.encode_refs(&victim.labels);
                    self.backend.write_entry(victim.tsid, &refs)?;
                    victim.mark_clean();
                }
                let vfp = fingerprint(&victim.labels);
                self.fingerprints
                    .remove_if(&vfp, |_, held| Arc::ptr_eq(held, &victim));
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        cache.put(entry.tsid, Arc::clone(&entry));
        drop(cache);
        self.fingerprints.insert(fp, entry);
        Ok(())
    }

    /// Fetch by TSID, loading through the backend on a miss.
    pub fn get(&self, tsid: Tsid) -> Result<Option<Arc<SeriesEntry>>> {
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&tsid) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(Arc::clone(entry)));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let Some(refs) = self.backend.read_entry(tsid)? else {
            return Ok(None);
        };
        let labels = self.decode_refs(&refs)?;
        let entry = SeriesEntry::new(tsid, labels, false);
        self.insert_cached(Arc::clone(&entry))?;
        Ok(Some(entry))
    }

    /// Fingerprint lookup with a labels-equal confirmation against hash
    /// collisions. Labels must be canonical.
    pub fn get_by_label_set(&self, labels: &[Label]) -> Option<Arc<SeriesEntry>> {
        let fp = fingerprint(labels);
        let entry = self.fingerprints.get(&fp).map(|e| Arc::clone(&e))?;
        if entry.labels == labels {
            Some(entry)
        } else {
            None
        }
    }

    /// Mark a cached entry clean after its WAL record committed.
    pub fn mark_clean(&self, tsid: Tsid) {
        if let Some(entry) = self.cache.lock().peek(&tsid) {
            entry.mark_clean();
        }
    }

    /// Flush the symbol table and the backing files.
    pub fn flush(&self) -> Result<()> {
        self.symtab.flush()?;
        self.backend.flush()
    }

    /// Flush only the symbol table. The index tree calls this before
    /// committing pages that embed symbol references.
    pub fn flush_symbols(&self) -> Result<()> {
        self.symtab.flush()
    }
}

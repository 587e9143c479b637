//! Fixed-slot series segment file
//!
//! One file holds the label-set entries for one TSID segment. Layout:
//!
//! ```text
//! | magic (4) | offset_table[S] (4 each) | crc32 (4) |  -> padded to 4096
//! | 4 KiB data pages ...                             |
//! ```
//!
//! `offset_table[slot] = 0` means the slot is absent; otherwise it is the
//! absolute file offset of the entry. Entries never cross a page boundary:
//!
//! ```text
//! | num_labels (2) | name_ref (4) value_ref (4) ... | crc32 (4) |
//! ```
//!
//! Writes fill in-memory pages; `flush` extends the file, writes the data
//! pages, rewrites the header (table + CRC) and fsyncs. The partially
//! filled tail page stays buffered and is rewritten by the next flush.

use crate::series::symbol_table::SymbolRef;
use crate::{IndexError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;

const MAGIC: u32 = 0x53_52_53_46; // "SRSF"

pub type RefLabels = Vec<(SymbolRef, SymbolRef)>;

struct Inner {
    file: File,
    offset_table: Vec<u32>,
    /// Buffered data pages not yet (fully) flushed, keyed by file offset.
    write_pages: BTreeMap<u64, Box<[u8]>>,
    /// Clean pages previously read or flushed.
    read_cache: HashMap<u64, Box<[u8]>>,
    /// File offset of the page currently being filled.
    cur_page: Option<u64>,
    /// Next free file offset for a fresh page.
    next_page_offset: u64,
    /// Bytes used in the current page.
    page_alloc: usize,
    header_dirty: bool,
}

pub struct SeriesFile {
    inner: Mutex<Inner>,
    segment_size: usize,
}

fn header_size(segment_size: usize) -> u64 {
    let raw = (2 + segment_size) * 4;
    raw.div_ceil(PAGE_SIZE) as u64 * PAGE_SIZE as u64
}

impl SeriesFile {
    pub fn open(path: impl AsRef<Path>, create: bool, segment_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let exists = path.exists();
        if !exists && !create {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("series file {} does not exist", path.display()),
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut inner = Inner {
            file,
            offset_table: vec![0u32; segment_size],
            write_pages: BTreeMap::new(),
            read_cache: HashMap::new(),
            cur_page: None,
            next_page_offset: header_size(segment_size),
            page_alloc: 0,
            header_dirty: false,
        };

        if !exists {
            inner.file.set_len(header_size(segment_size))?;
            write_header(&mut inner)?;
        } else {
            let mut len = inner.file.metadata()?.len();
            if len < header_size(segment_size) {
                return Err(IndexError::corrupt("series file shorter than its header"));
            }
            if len % PAGE_SIZE as u64 != 0 {
                // Pad a torn tail back to a page boundary.
                let pad = PAGE_SIZE as u64 - (len % PAGE_SIZE as u64);
                inner.file.seek(SeekFrom::End(0))?;
                inner.file.write_all(&vec![0u8; pad as usize])?;
                len += pad;
            }
            inner.next_page_offset = len;
            read_header(&mut inner, segment_size)?;
        }

        Ok(Self {
            inner: Mutex::new(inner),
            segment_size,
        })
    }

    /// Read the entry in `slot`, verifying its checksum.
    pub fn read_entry(&self, slot: usize) -> Result<Option<RefLabels>> {
        let mut inner = self.inner.lock();
        debug_assert!(slot < self.segment_size);

        let offset = inner.offset_table[slot] as u64;
        if offset == 0 {
            return Ok(None);
        }

        let page_off = offset - offset % PAGE_SIZE as u64;
        let in_page = (offset % PAGE_SIZE as u64) as usize;

        let page = load_page(&mut inner, page_off)?;
        let buf = &page[in_page..];

        let num_labels = u16::from_le_bytes(buf[..2].try_into().unwrap()) as usize;
        let body_len = 2 + num_labels * 8;
        if in_page + body_len + 4 > PAGE_SIZE {
            return Err(IndexError::corrupt("series entry crosses page boundary"));
        }

        let crc = crc32fast::hash(&buf[..body_len]);
        let stored = u32::from_le_bytes(buf[body_len..body_len + 4].try_into().unwrap());
        if crc != stored {
            return Err(IndexError::corrupt(format!(
                "series entry checksum mismatch in slot {}",
                slot
            )));
        }

        let mut labels = Vec::with_capacity(num_labels);
        for i in 0..num_labels {
            let off = 2 + i * 8;
            let name_ref = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            let value_ref = u32::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
            labels.push((name_ref, value_ref));
        }
        Ok(Some(labels))
    }

    /// Buffer the entry for `slot` into the current write page.
    pub fn write_entry(&self, slot: usize, labels: &[(SymbolRef, SymbolRef)]) -> Result<()> {
        let mut inner = self.inner.lock();
        debug_assert!(slot < self.segment_size);

        let entry_size = 2 + labels.len() * 8 + 4;
        if entry_size > PAGE_SIZE {
            return Err(IndexError::CapacityExceeded(format!(
                "series entry with {} labels exceeds the page size",
                labels.len()
            )));
        }

        if inner.cur_page.is_none() || PAGE_SIZE - inner.page_alloc < entry_size {
            open_page(&mut inner);
        }

        let page_off = inner.cur_page.expect("page opened above");
        let alloc = inner.page_alloc;
        let page = inner.write_pages.get_mut(&page_off).expect("current page");

        let buf = &mut page[alloc..alloc + entry_size];
        buf[..2].copy_from_slice(&(labels.len() as u16).to_le_bytes());
        for (i, (name_ref, value_ref)) in labels.iter().enumerate() {
            let off = 2 + i * 8;
            buf[off..off + 4].copy_from_slice(&name_ref.to_le_bytes());
            buf[off + 4..off + 8].copy_from_slice(&value_ref.to_le_bytes());
        }
        let body_len = entry_size - 4;
        let crc = crc32fast::hash(&buf[..body_len]);
        buf[body_len..].copy_from_slice(&crc.to_le_bytes());

        inner.offset_table[slot] = (page_off + alloc as u64) as u32;
        inner.page_alloc += entry_size;
        inner.header_dirty = true;
        Ok(())
    }

    /// Write buffered pages, rewrite the header and fsync.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.write_pages.is_empty() && !inner.header_dirty {
            return Ok(());
        }

        let inner = &mut *inner;
        if let Some((&last_off, _)) = inner.write_pages.iter().next_back() {
            let needed = last_off + PAGE_SIZE as u64;
            if inner.file.metadata()?.len() < needed {
                inner.file.set_len(needed)?;
            }
        }

        for (&off, page) in inner.write_pages.iter() {
            inner.file.seek(SeekFrom::Start(off))?;
            inner.file.write_all(page)?;
        }

        write_header(inner)?;
        inner.file.sync_all()?;

        // Full pages become clean; the tail page keeps accepting entries.
        let cur = inner.cur_page;
        let flushed: Vec<u64> = inner
            .write_pages
            .keys()
            .copied()
            .filter(|off| Some(*off) != cur)
            .collect();
        for off in flushed {
            if let Some(page) = inner.write_pages.remove(&off) {
                inner.read_cache.insert(off, page);
            }
        }
        inner.header_dirty = false;
        Ok(())
    }
}

fn open_page(inner: &mut Inner) {
    let off = inner.next_page_offset;
    inner
        .write_pages
        .insert(off, vec![0u8; PAGE_SIZE].into_boxed_slice());
    inner.cur_page = Some(off);
    inner.next_page_offset += PAGE_SIZE as u64;
    inner.page_alloc = 0;
}

fn load_page<'a>(inner: &'a mut Inner, page_off: u64) -> Result<&'a [u8]> {
    if inner.write_pages.contains_key(&page_off) {
        return Ok(&inner.write_pages[&page_off]);
    }
    if !inner.read_cache.contains_key(&page_off) {
        let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
        inner.file.seek(SeekFrom::Start(page_off))?;
        inner
            .file
            .read_exact(&mut page)
            .map_err(|_| IndexError::corrupt("short read of series data page"))?;
        inner.read_cache.insert(page_off, page);
    }
    Ok(&inner.read_cache[&page_off])
}

fn write_header(inner: &mut Inner) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + inner.offset_table.len() * 4 + 4);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    for off in &inner.offset_table {
        buf.extend_from_slice(&off.to_le_bytes());
    }
    let crc = crc32fast::hash(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());

    inner.file.seek(SeekFrom::Start(0))?;
    inner.file.write_all(&buf)?;
    Ok(())
}

fn read_header(inner: &mut Inner, segment_size: usize) -> Result<()> {
    let mut buf = vec![0u8; 4 + segment_size * 4 + 4];
    inner.file.seek(SeekFrom::Start(0))?;
    inner
        .file
        .read_exact(&mut buf)
        .map_err(|_| IndexError::corrupt("short read of series file header"))?;

    let magic = u32::from_le_bytes(buf[..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(IndexError::corrupt("bad series file magic"));
    }

    let table_end = 4 + segment_size * 4;
    let crc = crc32fast::hash(&buf[4..table_end]);
    let stored = u32::from_le_bytes(buf[table_end..table_end + 4].try_into().unwrap());
    if crc != stored {
        return Err(IndexError::corrupt("series file header checksum mismatch"));
    }

    for (i, chunk) in buf[4..table_end].chunks_exact(4).enumerate() {
        inner.offset_table[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(())
}

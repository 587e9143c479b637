//! Write-ahead log
//!
//! Segment files (`00000001`, `00000002`, ...) written in 4096-byte pages.
//! A page holds zero or more record chunks followed by zero padding; a
//! record larger than a page splits into `First, Middle*, Last` chunks.
//! Chunk layout:
//!
//! ```text
//! | type (1) | length BE (2) | crc32 (4) | payload |
//! ```
//!
//! A chunk type of `None` (zero) means the rest of the page is padding.
//! All writes go through one mutex; `log_record(.., flush=true)` pushes the
//! current page to the OS, and durability across crashes is provided by the
//! checkpoint that compaction writes after persisting everything the log
//! covers.
//!
//! `checkpoint.meta` = `last_segment (4) | low_watermark (8) | crc32 (4)`,
//! replaced atomically via a tmp file and rename.

pub mod records;

use crate::labels::Tsid;
use crate::{IndexError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const WAL_PAGE_SIZE: usize = 4096;
pub const RECORD_HEADER_SIZE: usize = 7;
pub const MAX_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

const CHUNK_NONE: u8 = 0;
const CHUNK_FULL: u8 = 1;
const CHUNK_FIRST: u8 = 2;
const CHUNK_MIDDLE: u8 = 3;
const CHUNK_LAST: u8 = 4;

/// Where replay starts: everything persisted before this checkpoint is
/// already in the tree and series store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub last_segment: u64,
    pub low_watermark: Tsid,
}

struct Writer {
    file: File,
    page: Box<[u8]>,
    page_start: usize,
    page_end: usize,
    /// Byte offset of the current page inside the segment.
    segment_start: usize,
    last_segment: u64,
}

pub struct Wal {
    log_dir: PathBuf,
    checkpoint_path: PathBuf,
    writer: Mutex<Writer>,
}

fn segment_filename(dir: &Path, seg: u64) -> PathBuf {
    dir.join(format!("{:08}", seg))
}

impl Wal {
    pub fn open(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        let checkpoint_path = log_dir.join("checkpoint.meta");

        let (_, mut end) = scan_segments(&log_dir)?;
        if end == 0 {
            create_segment(&log_dir, 1)?;
            end = 1;
        }

        let (file, segment_start) = open_write_segment(&log_dir, end)?;
        Ok(Self {
            log_dir,
            checkpoint_path,
            writer: Mutex::new(Writer {
                file,
                page: vec![0u8; WAL_PAGE_SIZE].into_boxed_slice(),
                page_start: 0,
                page_end: 0,
                segment_start,
                last_segment: end,
            }),
        })
    }

    /// Smallest and largest segment numbers on disk; `(0, 0)` when empty.
    pub fn segment_range(&self) -> Result<(u64, u64)> {
        scan_segments(&self.log_dir)
    }

    pub fn segment_reader(&self, seg: u64) -> Result<WalReader> {
        WalReader::open(segment_filename(&self.log_dir, seg))
    }

    /// Append one record, chunking across pages and rolling segments as
    /// needed. `flush` pushes the partial page to the OS immediately.
    pub fn log_record(&self, rec: &[u8], flush: bool) -> Result<()> {
        let max_record =
            (MAX_SEGMENT_SIZE / WAL_PAGE_SIZE) * (WAL_PAGE_SIZE - RECORD_HEADER_SIZE);
        if rec.len() > max_record {
            return Err(IndexError::CapacityExceeded(format!(
                "WAL record of {} bytes cannot fit a segment",
                rec.len()
            )));
        }

        let mut w = self.writer.lock();

        let pages_left =
            (MAX_SEGMENT_SIZE.saturating_sub(w.segment_start)) / WAL_PAGE_SIZE;
        let mut remaining = WAL_PAGE_SIZE - w.page_end;
        remaining += (WAL_PAGE_SIZE - RECORD_HEADER_SIZE) * pages_left.saturating_sub(1);
        if remaining < rec.len() {
            self.next_segment(&mut w)?;
        }

        let mut rec = rec;
        let mut chunk_type = CHUNK_NONE;

        while !rec.is_empty() {
            if WAL_PAGE_SIZE - w.page_end <= RECORD_HEADER_SIZE {
                flush_page(&mut w, true)?;
            }

            let chunk = rec
                .len()
                .min(WAL_PAGE_SIZE - w.page_end - RECORD_HEADER_SIZE);

            chunk_type = match chunk_type {
                CHUNK_NONE => {
                    if chunk == rec.len() {
                        CHUNK_FULL
                    } else {
                        CHUNK_FIRST
                    }
                }
                _ => {
                    if chunk == rec.len() {
                        CHUNK_LAST
                    } else {
                        CHUNK_MIDDLE
                    }
                }
            };

            let end = w.page_end;
            w.page[end] = chunk_type;
            w.page[end + 1..end + 3].copy_from_slice(&(chunk as u16).to_be_bytes());
            let crc = crc32fast::hash(&rec[..chunk]);
            w.page[end + 3..end + 7].copy_from_slice(&crc.to_le_bytes());
            w.page[end + 7..end + 7 + chunk].copy_from_slice(&rec[..chunk]);
            w.page_end = end + RECORD_HEADER_SIZE + chunk;

            rec = &rec[chunk..];

            if flush || WAL_PAGE_SIZE <= w.page_end + RECORD_HEADER_SIZE {
                flush_page(&mut w, false)?;
            }
        }
        Ok(())
    }

    /// Pad and close the current segment, open the next one and return the
    /// number of the segment just closed.
    pub fn close_segment(&self) -> Result<u64> {
        let mut w = self.writer.lock();
        let closed = w.last_segment;
        self.next_segment(&mut w)?;
        Ok(closed)
    }

    fn next_segment(&self, w: &mut Writer) -> Result<()> {
        if w.page_end > 0 {
            flush_page(w, true)?;
        }

        let next = w.last_segment + 1;
        create_segment(&self.log_dir, next)?;
        let (file, segment_start) = open_write_segment(&self.log_dir, next)?;
        w.file = file;
        w.segment_start = segment_start;
        w.page_start = 0;
        w.page_end = 0;
        w.last_segment = next;
        Ok(())
    }

    /// Replace `checkpoint.meta` atomically.
    pub fn write_checkpoint(&self, watermark: Tsid, segment: u64) -> Result<()> {
        let _w = self.writer.lock();

        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(&(segment as u32).to_le_bytes());
        buf[4..12].copy_from_slice(&watermark.to_le_bytes());
        let crc = crc32fast::hash(&buf[..12]);
        buf[12..].copy_from_slice(&crc.to_le_bytes());

        let tmp = self.checkpoint_path.with_extension("meta.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.checkpoint_path)?;
        Ok(())
    }

    /// Read the last checkpoint, defaulting to segment 1 / watermark 0
    /// when none exists.
    pub fn last_checkpoint(&self) -> Result<CheckpointStats> {
        if !self.checkpoint_path.exists() {
            return Ok(CheckpointStats {
                last_segment: 1,
                low_watermark: 0,
            });
        }

        let mut buf = [0u8; 16];
        let mut file = File::open(&self.checkpoint_path)?;
        file.read_exact(&mut buf)
            .map_err(|_| IndexError::corrupt("truncated checkpoint file"))?;

        let crc = crc32fast::hash(&buf[..12]);
        let stored = u32::from_le_bytes(buf[12..].try_into().unwrap());
        if crc != stored {
            return Err(IndexError::corrupt("checkpoint checksum mismatch"));
        }

        Ok(CheckpointStats {
            last_segment: u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64,
            low_watermark: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
        })
    }
}

fn scan_segments(dir: &Path) -> Result<(u64, u64)> {
    let mut min = u64::MAX;
    let mut max = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(seg) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            min = min.min(seg);
            max = max.max(seg);
        }
    }

    if max == 0 {
        Ok((0, 0))
    } else {
        Ok((min, max))
    }
}

fn create_segment(dir: &Path, seg: u64) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(segment_filename(dir, seg))?;
    Ok(())
}

/// Open a segment for appending, padding a torn tail to a page boundary.
fn open_write_segment(dir: &Path, seg: u64) -> Result<(File, usize)> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(segment_filename(dir, seg))?;

    let mut offset = file.seek(SeekFrom::End(0))? as usize;
    if offset % WAL_PAGE_SIZE != 0 {
        let pad = WAL_PAGE_SIZE - offset % WAL_PAGE_SIZE;
        file.write_all(&vec![0u8; pad])?;
        offset += pad;
    }
    Ok((file, offset))
}

fn flush_page(w: &mut Writer, mut reset: bool) -> Result<()> {
    if WAL_PAGE_SIZE <= w.page_end + RECORD_HEADER_SIZE {
        reset = true;
    }
    if reset {
        w.page_end = WAL_PAGE_SIZE;
    }

    let (start, end) = (w.page_start, w.page_end);
    w.file.write_all(&w.page[start..end])?;
    w.page_start = w.page_end;

    if reset {
        w.page.fill(0);
        w.page_start = 0;
        w.page_end = 0;
        w.segment_start += WAL_PAGE_SIZE;
    }
    Ok(())
}

/// Sequential reader over one segment. Reassembles chunked records and
/// silently stops at a truncated or corrupt tail.
pub struct WalReader {
    file: File,
    page: Box<[u8]>,
    page_offset: usize,
    eof: bool,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = Self {
            file,
            page: vec![0u8; WAL_PAGE_SIZE].into_boxed_slice(),
            page_offset: 0,
            eof: false,
        };
        reader.read_page()?;
        Ok(reader)
    }

    fn read_page(&mut self) -> Result<()> {
        self.page_offset = 0;
        let mut filled = 0;
        while filled < WAL_PAGE_SIZE {
            let n = self.file.read(&mut self.page[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.eof = filled == 0;
        if filled < WAL_PAGE_SIZE {
            self.page[filled..].fill(0);
        }
        Ok(())
    }

    /// The next complete record, or `None` at end of log.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }

        let mut record = Vec::new();
        loop {
            if self.page_offset + RECORD_HEADER_SIZE >= WAL_PAGE_SIZE {
                self.read_page()?;
                if self.eof {
                    return Ok(None);
                }
            }

            let chunk_type = self.page[self.page_offset];
            self.page_offset += 1;

            if chunk_type == CHUNK_NONE {
                self.page_offset = WAL_PAGE_SIZE;
                continue;
            }
            if chunk_type > CHUNK_LAST {
                // Garbage where a chunk header should be: torn tail.
                self.eof = true;
                return Ok(None);
            }

            let len = u16::from_be_bytes(
                self.page[self.page_offset..self.page_offset + 2]
                    .try_into()
                    .unwrap(),
            ) as usize;
            self.page_offset += 2;
            let crc = u32::from_le_bytes(
                self.page[self.page_offset..self.page_offset + 4]
                    .try_into()
                    .unwrap(),
            );
            self.page_offset += 4;

            if self.page_offset + len > WAL_PAGE_SIZE {
                self.eof = true;
                return Ok(None);
            }

            let payload = &self.page[self.page_offset..self.page_offset + len];
            if crc32fast::hash(payload) != crc {
                self.eof = true;
                return Ok(None);
            }

            record.extend_from_slice(payload);
            self.page_offset += len;

            if chunk_type == CHUNK_FULL || chunk_type == CHUNK_LAST {
                return Ok(Some(record));
            }
        }
    }
}

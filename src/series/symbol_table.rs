//! On-disk symbol table
//!
//! Append-only dictionary assigning a dense 32-bit reference to every
//! distinct label name and value. File layout:
//!
//! ```text
//! | magic (4) | len (4) bytes ... | len (4) bytes ... | ...
//! ```
//!
//! References are assigned in memory; `flush` appends everything past the
//! last flushed reference in bounded buffers and fsyncs. A reference is
//! therefore only durable after a flush, which the compaction path runs
//! before publishing any page that embeds references.

use crate::{IndexError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub type SymbolRef = u32;

const MAGIC: u32 = 0x53_59_4D_54; // "SYMT"

/// Flush buffer cap; symbols longer than this still flush, alone.
const FLUSH_BUF_SIZE: usize = 64 * 1024;

struct Symbols {
    list: Vec<String>,
    map: HashMap<String, SymbolRef>,
    last_flushed: usize,
}

pub struct SymbolTable {
    file: Mutex<File>,
    inner: RwLock<Symbols>,
}

impl SymbolTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let create = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut symbols = Symbols {
            list: Vec::new(),
            map: HashMap::new(),
            last_flushed: 0,
        };

        if create {
            file.write_all(&MAGIC.to_le_bytes())?;
        } else {
            Self::load(&mut file, &mut symbols)?;
        }

        Ok(Self {
            file: Mutex::new(file),
            inner: RwLock::new(symbols),
        })
    }

    fn load(file: &mut File, symbols: &mut Symbols) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| IndexError::corrupt("symbol table too short"))?;
        if u32::from_le_bytes(magic) != MAGIC {
            return Err(IndexError::corrupt("bad symbol table magic"));
        }

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            let mut bytes = vec![0u8; len];
            reader
                .read_exact(&mut bytes)
                .map_err(|_| IndexError::corrupt("truncated symbol entry"))?;
            let symbol = String::from_utf8(bytes)
                .map_err(|_| IndexError::corrupt("symbol is not valid UTF-8"))?;

            let idx = symbols.list.len() as SymbolRef;
            symbols.map.insert(symbol.clone(), idx);
            symbols.list.push(symbol);
        }

        symbols.last_flushed = symbols.list.len();
        Ok(())
    }

    /// Intern a symbol, returning its existing reference when present.
    pub fn add_symbol(&self, symbol: &str) -> SymbolRef {
        {
            let inner = self.inner.read();
            if let Some(&idx) = inner.map.get(symbol) {
                return idx;
            }
        }

        let mut inner = self.inner.write();
        if let Some(&idx) = inner.map.get(symbol) {
            return idx;
        }
        let idx = inner.list.len() as SymbolRef;
        inner.list.push(symbol.to_owned());
        inner.map.insert(symbol.to_owned(), idx);
        idx
    }

    /// Reverse lookup without interning.
    pub fn find_symbol(&self, symbol: &str) -> Option<SymbolRef> {
        self.inner.read().map.get(symbol).copied()
    }

    pub fn get_symbol(&self, r: SymbolRef) -> Result<String> {
        let inner = self.inner.read();
        inner
            .list
            .get(r as usize)
            .cloned()
            .ok_or_else(|| IndexError::corrupt(format!("symbol ref {} out of range", r)))
    }

    pub fn len(&self) -> usize {
        self.inner.read().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every unflushed symbol to the file and fsync.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.last_flushed == inner.list.len() {
            return Ok(());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::with_capacity(FLUSH_BUF_SIZE);
        for symbol in &inner.list[inner.last_flushed..] {
            if !buf.is_empty() && buf.len() + 4 + symbol.len() > FLUSH_BUF_SIZE {
                file.write_all(&buf)?;
                buf.clear();
            }
            buf.extend_from_slice(&(symbol.len() as u32).to_le_bytes());
            buf.extend_from_slice(symbol.as_bytes());
        }
        if !buf.is_empty() {
            file.write_all(&buf)?;
        }
        file.sync_all()?;

        inner.last_flushed = inner.list.len();
        Ok(())
    }
}

//! Index configuration
//!
//! Everything the server and its stores need to know about sizing, layout
//! and durability policy lives here so callers construct the whole stack
//! from one struct.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Checkpoint policy applied at the end of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointPolicy {
    /// Write `checkpoint.meta` after every successful compaction.
    Normal,
    /// Never write checkpoints; every restart replays the whole WAL.
    Disabled,
    /// Log what would have been checkpointed instead of writing it.
    /// Useful when validating replay behavior.
    Print,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy::Normal
    }
}

/// Persistence backend for the series store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesBackendKind {
    /// One fixed-slot file per TSID segment (`series/00000000`, ...).
    SegmentFile,
    /// Single B+tree file mapping TSID to an entry-file offset.
    BTree,
}

impl Default for SeriesBackendKind {
    fn default() -> Self {
        SeriesBackendKind::SegmentFile
    }
}

/// Configuration for an index directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Root directory; `index.db`, `symbol.tab`, `series/` and `wal/` are
    /// created beneath it.
    pub index_dir: PathBuf,

    /// Page cache capacity for the index tree, in pages.
    pub cache_size: usize,

    /// Series entry cache capacity (ignored when `full_cache` is set).
    pub series_cache_size: usize,

    /// Series slots per segment file.
    pub segment_size: usize,

    /// Disable sorted-list posting pages; every label uses bitmap pages.
    pub bitmap_only: bool,

    /// Never evict series entries from memory.
    pub full_cache: bool,

    pub checkpoint_policy: CheckpointPolicy,

    pub series_backend: SeriesBackendKind,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("tsidx-data"),
            cache_size: 1024,
            series_cache_size: 4096,
            segment_size: 4096,
            bitmap_only: false,
            full_cache: false,
            checkpoint_policy: CheckpointPolicy::default(),
            series_backend: SeriesBackendKind::default(),
        }
    }
}

impl IndexConfig {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ..Default::default()
        }
    }

    pub fn tree_file(&self) -> PathBuf {
        self.index_dir.join("index.db")
    }

    pub fn symbol_file(&self) -> PathBuf {
        self.index_dir.join("symbol.tab")
    }

    pub fn series_dir(&self) -> PathBuf {
        self.index_dir.join("series")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.index_dir.join("wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = IndexConfig::new("/tmp/idx");
        assert_eq!(config.tree_file(), PathBuf::from("/tmp/idx/index.db"));
        assert_eq!(config.symbol_file(), PathBuf::from("/tmp/idx/symbol.tab"));
        assert_eq!(config.wal_dir(), PathBuf::from("/tmp/idx/wal"));
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::Normal);
        assert!(!config.bitmap_only);
    }
}

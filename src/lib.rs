//! tsidx — inverted index for time-series identifiers
//!
//! Each series is one unique label set identified by a dense 64-bit TSID;
//! queries resolve a conjunction of label matchers intersected with a
//! timestamp window into a bitmap of matching TSIDs.
//!
//! ## Architecture
//! - Ingest layer: striped in-memory inverted index fed through a
//!   write-ahead log
//! - Persistence: copy-on-write B+tree over a fixed-size page cache,
//!   posting pages in bitmap or sorted-list layout
//! - Series layer: symbol-interned TSID ↔ label-set store with an LRU
//!   cache and fingerprint lookup
//! - Compaction: snapshots recent postings into the tree, flushes the
//!   series store and advances the WAL checkpoint
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use tsidx::{IndexConfig, IndexServer, Label, LabelMatcher, SeriesStore};
//!
//! # fn main() -> tsidx::Result<()> {
//! let config = IndexConfig::new("./index-data");
//! let series = Arc::new(SeriesStore::open(&config)?);
//! let server = IndexServer::open(&config, series)?;
//!
//! let labels = vec![Label::new("__name__", "up"), Label::new("job", "api")];
//! let (tsid, inserted) = server.add_series(1000, &labels)?;
//! assert!(inserted);
//!
//! let matchers = [LabelMatcher::equal("job", "api")];
//! let hits = server.resolve_label_matchers(&matchers, 0, 2000)?;
//! assert!(hits.contains(tsid));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod index;
pub mod labels;
pub mod series;
pub mod storage;
pub mod tree;
pub mod wal;

mod error;

pub use config::{CheckpointPolicy, IndexConfig, SeriesBackendKind};
pub use error::{IndexError, Result};
pub use index::mem_index::{LabeledPostings, MemIndex, MemIndexSnapshot};
pub use index::{IndexServer, IndexServerStats, IndexTree};
pub use labels::{Label, LabelMatcher, MatchOp, Tsid};
pub use series::{SeriesEntry, SeriesStore, SymbolRef};
pub use wal::records::SeriesRecord;
pub use wal::{Wal, WalReader};

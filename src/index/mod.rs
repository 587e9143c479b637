//! Indexing core: in-memory postings, the persistent index tree and the
//! coordinating server

pub mod index_tree;
pub mod mem_index;
pub mod server;

pub use index_tree::IndexTree;
pub use mem_index::{AddOutcome, LabeledPostings, MemIndex, MemIndexSnapshot};
pub use server::{IndexServer, IndexServerStats};

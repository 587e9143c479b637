//! Physical storage: the fixed-size page cache over a heap file

pub mod page_cache;

pub use page_cache::{Page, PageCache, PageCacheStats, PageId, DEFAULT_PAGE_SIZE};

//! Persistent label postings over the copy-on-write tree
//!
//! Compaction turns a mem-index snapshot into posting pages and tree
//! entries; queries scan the tree per matcher and fold per-segment page
//! buffers. Two page layouts share the 16-byte header
//! `name_ref(4) value_ref(4) end_ts(8)`:
//!
//! - **bitmap** (`end_ts` bit 63 clear): one bit per TSID of one segment,
//!   `postings_per_page = (page_size - 16) * 8` TSIDs per page.
//! - **sorted list** (bit 63 set): `(value_ref, tsid)` items spanning many
//!   values of one name, cheaper for high-cardinality labels.
//!
//! Posting pages are immutable once a committed root references them;
//! every change clones the page first. The tree key places the newest
//! segment first within `(name, value, timestamp)` runs, and sorted-list
//! keys (zero value field) sort before every bitmap key of their name.

use crate::index::mem_index::{LabeledPostings, MemIndexSnapshot};
use crate::labels::{Label, LabelMatcher, MatchOp, Tsid};
use crate::series::{SeriesStore, SymbolRef};
use crate::storage::page_cache::{Page, PageCache, PageId};
use crate::tree::item_page::{SortedListView, SortedListViewMut};
use crate::tree::key::{value_prefix, PostingKey, SORTED_LIST_FLAG};
use crate::tree::CowTree;
use crate::{IndexError, Result};
use roaring::RoaringTreemap;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub const TREE_FANOUT: usize = 150;

const PAGE_HEADER_SIZE: usize = 16;

/// Per-segment bitmap buffers produced by one matcher.
type SegmentBitmaps = BTreeMap<u32, Vec<u8>>;

struct TreeEntry {
    key: PostingKey,
    pid: PageId,
    updated: bool,
}

pub struct IndexTree {
    series: Arc<SeriesStore>,
    cache: Arc<PageCache>,
    tree: CowTree<PostingKey, PageId, TREE_FANOUT>,
    postings_per_page: u64,
    bitmap_only: bool,
}

fn read_header(buf: &[u8]) -> (SymbolRef, SymbolRef, u64) {
    let name_ref = u32::from_le_bytes(buf[..4].try_into().unwrap());
    let value_ref = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let end_ts = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    (name_ref, value_ref, end_ts)
}

fn write_header(buf: &mut [u8], name_ref: SymbolRef, value_ref: SymbolRef, end_ts: u64) {
    buf[..4].copy_from_slice(&name_ref.to_le_bytes());
    buf[4..8].copy_from_slice(&value_ref.to_le_bytes());
    buf[8..16].copy_from_slice(&end_ts.to_le_bytes());
}

impl IndexTree {
    pub fn open(
        path: impl AsRef<Path>,
        cache_size: usize,
        series: Arc<SeriesStore>,
        bitmap_only: bool,
    ) -> Result<Self> {
        let cache = Arc::new(PageCache::open(
            path,
            cache_size,
            crate::storage::page_cache::DEFAULT_PAGE_SIZE,
        )?);
        let tree = CowTree::open(Arc::clone(&cache))?;
        let postings_per_page = ((cache.page_size() - PAGE_HEADER_SIZE) * 8) as u64;

        Ok(Self {
            series,
            cache,
            tree,
            postings_per_page,
            bitmap_only,
        })
    }

    pub fn postings_per_page(&self) -> u64 {
        self.postings_per_page
    }

    fn segment_of(&self, tsid: Tsid) -> u32 {
        (tsid / self.postings_per_page) as u32
    }

    // ---------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------

    /// Persist a mem-index snapshot up to `limit`. The page cache and
    /// symbol table are flushed before the tree commit, so a published
    /// root never references a torn page or an unflushed symbol.
    pub fn write_postings(&self, limit: Tsid, snapshot: &MemIndexSnapshot) -> Result<()> {
        let mut entries = Vec::new();

        for (name, labeled) in snapshot {
            if !self.bitmap_only && self.sorted_list_cheaper(labeled) {
                self.write_sorted_postings(name, labeled, limit, &mut entries)?;
            } else {
                self.write_bitmap_postings(name, labeled, limit, &mut entries)?;
            }
        }

        if entries.is_empty() {
            return Ok(());
        }

        self.series.flush_symbols()?;
        self.cache.flush_all()?;

        let mut txn = self.tree.begin()?;
        for entry in &entries {
            if entry.updated {
                if !self.tree.update(entry.key, entry.pid, &mut txn)? {
                    self.tree.insert(entry.key, entry.pid, &mut txn)?;
                }
            } else {
                self.tree.insert(entry.key, entry.pid, &mut txn)?;
            }
        }
        self.tree.commit(txn)?;
        Ok(())
    }

    /// Layout cost estimate: bitmap pays one page per value, a sorted
    /// list pays 12 bytes per posting rounded up to whole pages. Ties go
    /// to the sorted list.
    fn sorted_list_cheaper(&self, labeled: &[LabeledPostings]) -> bool {
        let page = self.cache.page_size() as u64;
        let values = labeled.iter().filter(|e| !e.postings.is_empty()).count() as u64;
        if values == 0 {
            return false;
        }
        let bitmap_cost = values * page;
        let postings: u64 = labeled.iter().map(|e| e.postings.len()).sum();
        let sorted_cost = (postings * 12).div_ceil(page) * page;
        sorted_cost <= bitmap_cost
    }

    fn write_bitmap_postings(
        &self,
        name: &str,
        labeled: &[LabeledPostings],
        limit: Tsid,
        out: &mut Vec<TreeEntry>,
    ) -> Result<()> {
        for entry in labeled {
            let mut run: Vec<Tsid> = Vec::new();
            let mut run_seg: Option<u32> = None;

            for tsid in entry.postings.iter() {
                if tsid > limit {
                    break;
                }
                let seg = self.segment_of(tsid);
                if run_seg != Some(seg) {
                    if let Some(prev) = run_seg.take() {
                        out.push(self.write_bitmap_page(name, entry, prev, &run)?);
                        run.clear();
                    }
                    run_seg = Some(seg);
                }
                run.push(tsid);
            }

            if let Some(seg) = run_seg {
                out.push(self.write_bitmap_page(name, entry, seg, &run)?);
            }
        }
        Ok(())
    }

    /// Write one segment's bits. The `(name, value)` key range is scanned
    /// for an existing bitmap page of this segment — the mem index
    /// reassigns `min_timestamp` every generation, so the prior page sits
    /// under a different timestamp key and an exact lookup would miss it.
    /// A match is cloned and extended, and the tree entry keeps the
    /// existing key: one page per `(name, value, segment)` across
    /// compactions.
    fn write_bitmap_page(
        &self,
        name: &str,
        entry: &LabeledPostings,
        segment: u32,
        tsids: &[Tsid],
    ) -> Result<TreeEntry> {
        let range_start = PostingKey::name_value_start(name, &entry.value);

        let mut source: Option<(PostingKey, Arc<Page>, u64)> = None;
        let mut it = self.tree.iter_from(range_start)?;
        while let Some((key, pid)) = it.next_entry()? {
            if !key.same_name_value(&range_start) {
                break;
            }
            if key.is_sorted_list() || key.segment() != segment {
                continue;
            }

            let page = self.cache.fetch_page(pid)?;
            let (name_ref, value_ref, end_ts) = {
                let buf = page.read();
                read_header(&buf)
            };
            if end_ts & SORTED_LIST_FLAG != 0 {
                return Err(IndexError::corrupt(format!(
                    "sorted-list page {} under a bitmap key",
                    pid
                )));
            }
            if self.series.get_symbol(name_ref)? == name
                && self.series.get_symbol(value_ref)? == entry.value
            {
                // Keys order timestamp-ascending; keep the newest match.
                source = Some((key, page, end_ts));
            }
        }

        let new_page = self.cache.new_page()?;
        let updated = source.is_some();
        let key = match &source {
            Some((key, _, _)) => *key,
            None => PostingKey::bitmap(name, &entry.value, entry.min_timestamp, segment),
        };
        {
            let mut buf = new_page.write();
            match &source {
                Some((_, src, end_ts)) => {
                    buf.copy_from_slice(&src.read());
                    let merged = (*end_ts).max(entry.max_timestamp);
                    buf[8..16].copy_from_slice(&merged.to_le_bytes());
                }
                None => {
                    let name_ref = self.series.add_symbol(name);
                    let value_ref = self.series.add_symbol(&entry.value);
                    write_header(&mut buf, name_ref, value_ref, entry.max_timestamp);
                }
            }

            for &tsid in tsids {
                let bit = (tsid % self.postings_per_page) as usize;
                buf[PAGE_HEADER_SIZE + bit / 8] |= 1 << (bit % 8);
            }
        }
        new_page.mark_dirty();

        Ok(TreeEntry {
            key,
            pid: new_page.id(),
            updated,
        })
    }

    fn write_sorted_postings(
        &self,
        name: &str,
        labeled: &[LabeledPostings],
        limit: Tsid,
        out: &mut Vec<TreeEntry>,
    ) -> Result<()> {
        let mut ordered: Vec<&LabeledPostings> = labeled
            .iter()
            .filter(|e| !e.postings.is_empty())
            .collect();
        ordered.sort_by_key(|e| e.min_timestamp);
        if ordered.is_empty() {
            return Ok(());
        }

        // Continue the newest existing sorted page for this name.
        let mut newest: Option<(PostingKey, PageId)> = None;
        let start = PostingKey::name_start(name);
        let mut it = self.tree.iter_from(start)?;
        while let Some((key, pid)) = it.next_entry()? {
            if !key.same_name(&start) || !key.has_zero_value() {
                break;
            }
            if key.is_sorted_list()
                && newest.map_or(true, |(cur, _)| key.segment() > cur.segment())
            {
                newest = Some((key, pid));
            }
        }

        let name_ref = self.series.add_symbol(name);
        let mut cur: Option<(PostingKey, Arc<Page>, bool, u64)> = None;
        let mut next_ordinal = 0;

        if let Some((key, pid)) = newest {
            let src = self.cache.fetch_page(pid)?;
            let end_ts = {
                let buf = src.read();
                let (_, _, end_ts) = read_header(&buf);
                end_ts & !SORTED_LIST_FLAG
            };

            let clone = self.cache.new_page()?;
            clone.write().copy_from_slice(&src.read());
            clone.mark_dirty();
            next_ordinal = key.segment() + 1;
            cur = Some((key, clone, true, end_ts));
        }

        for entry in &ordered {
            let value_ref = self.series.add_symbol(&entry.value);

            for tsid in entry.postings.iter() {
                if tsid > limit {
                    break;
                }

                loop {
                    let (key, page, updated, max_ts) = match cur.take() {
                        Some(state) => state,
                        None => {
                            let page = self.cache.new_page()?;
                            {
                                let mut buf = page.write();
                                write_header(&mut buf, name_ref, 0, SORTED_LIST_FLAG);
                                SortedListViewMut::new(&mut buf[PAGE_HEADER_SIZE..]).init();
                            }
                            page.mark_dirty();
                            let key = PostingKey::sorted_list(
                                name,
                                entry.min_timestamp,
                                next_ordinal,
                            );
                            (key, page, false, 0)
                        }
                    };

                    let inserted = {
                        let mut buf = page.write();
                        let mut view = SortedListViewMut::new(&mut buf[PAGE_HEADER_SIZE..]);
                        if view.as_view().contains(value_ref, tsid) {
                            true
                        } else {
                            view.insert(value_ref, tsid)
                        }
                    };

                    if inserted {
                        page.mark_dirty();
                        cur = Some((key, page, updated, max_ts.max(entry.max_timestamp)));
                        break;
                    }

                    // Page full: seal it and start a fresh one.
                    self.seal_sorted_page(&key, &page, updated, max_ts, out);
                    next_ordinal = next_ordinal.max(key.segment() + 1);
                }
            }
        }

        if let Some((key, page, updated, max_ts)) = cur {
            self.seal_sorted_page(&key, &page, updated, max_ts, out);
        }
        Ok(())
    }

    fn seal_sorted_page(
        &self,
        key: &PostingKey,
        page: &Arc<Page>,
        updated: bool,
        max_ts: u64,
        out: &mut Vec<TreeEntry>,
    ) {
        {
            let mut buf = page.write();
            buf[8..16].copy_from_slice(&(max_ts | SORTED_LIST_FLAG).to_le_bytes());
        }
        page.mark_dirty();
        out.push(TreeEntry {
            key: *key,
            pid: page.id(),
            updated,
        });
    }

    // ---------------------------------------------------------------
    // Query path
    // ---------------------------------------------------------------

    /// Resolve a matcher conjunction over `[start, end)` into a TSID set.
    pub fn resolve_label_matchers(
        &self,
        matchers: &[LabelMatcher],
        start: u64,
        end: u64,
    ) -> Result<RoaringTreemap> {
        let mut acc: Option<SegmentBitmaps> = None;

        for matcher in matchers {
            let seg_mask: Option<HashSet<u32>> =
                acc.as_ref().map(|m| m.keys().copied().collect());

            let got = self.query_postings(matcher, start, end, seg_mask.as_ref())?;
            if got.is_empty() {
                return Ok(RoaringTreemap::new());
            }

            acc = Some(match acc {
                None => got,
                Some(mut prev) => {
                    let mut merged = SegmentBitmaps::new();
                    for (seg, buf) in got {
                        if let Some(mut held) = prev.remove(&seg) {
                            for (a, b) in held.iter_mut().zip(buf.iter()) {
                                *a &= b;
                            }
                            merged.insert(seg, held);
                        }
                    }
                    if merged.is_empty() {
                        return Ok(RoaringTreemap::new());
                    }
                    merged
                }
            });
        }

        let mut postings = RoaringTreemap::new();
        if let Some(acc) = acc {
            for (seg, buf) in acc {
                let base = seg as u64 * self.postings_per_page;
                for (i, &byte) in buf.iter().enumerate() {
                    if byte == 0 {
                        continue;
                    }
                    for bit in 0..8 {
                        if byte & (1 << bit) != 0 {
                            postings.insert(base + (i * 8 + bit) as u64);
                        }
                    }
                }
            }
        }
        Ok(postings)
    }

    /// One matcher's per-segment buffers. `seg_mask` skips segments a
    /// previous matcher already ruled out.
    fn query_postings(
        &self,
        matcher: &LabelMatcher,
        start: u64,
        end: u64,
        seg_mask: Option<&HashSet<u32>>,
    ) -> Result<SegmentBitmaps> {
        let mut bitmaps = SegmentBitmaps::new();
        let mut sorted_hits: Vec<Tsid> = Vec::new();

        if matcher.op == MatchOp::Eq {
            // Sorted pages can only contain an interned value.
            if let Some(value_ref) = self.series.find_symbol(&matcher.value) {
                self.scan_sorted_region(&matcher.name, start, end, |view| {
                    view.get_values(value_ref, &mut sorted_hits);
                    Ok(())
                })?;
            }

            let target = PostingKey::name_value_start(&matcher.name, &matcher.value);
            let mut it = self.tree.iter_from(target)?;
            while let Some((key, pid)) = it.next_entry()? {
                if !key.same_name_value(&target) {
                    break;
                }
                if key.is_sorted_list() {
                    continue;
                }
                self.visit_bitmap_page(matcher, key, pid, start, end, seg_mask, &mut bitmaps)?;
            }
        } else {
            let name_start = PostingKey::name_start(&matcher.name);
            let target_prefix = value_prefix(&matcher.value);
            let mut it = self.tree.iter_from(name_start)?;

            while let Some((key, pid)) = it.next_entry()? {
                if !key.same_name(&name_start) {
                    break;
                }

                if key.is_sorted_list() {
                    if !self.in_time_window(&key, pid, start, end)? {
                        continue;
                    }
                    self.collect_sorted_matches(matcher, pid, &mut sorted_hits)?;
                    continue;
                }

                // Fetchless pruning on the raw value prefix.
                match matcher.op {
                    MatchOp::Gt | MatchOp::Gte => {
                        if key.value_prefix() < &target_prefix[..] {
                            continue;
                        }
                    }
                    MatchOp::Lt | MatchOp::Lte => {
                        if key.value_prefix() > &target_prefix[..] {
                            break;
                        }
                    }
                    _ => {}
                }

                self.visit_bitmap_page(matcher, key, pid, start, end, seg_mask, &mut bitmaps)?;
            }
        }

        for tsid in sorted_hits {
            let seg = self.segment_of(tsid);
            if seg_mask.map_or(false, |mask| !mask.contains(&seg)) {
                continue;
            }
            let buf = bitmaps
                .entry(seg)
                .or_insert_with(|| vec![0u8; self.cache.page_size() - PAGE_HEADER_SIZE]);
            let bit = (tsid % self.postings_per_page) as usize;
            buf[bit / 8] |= 1 << (bit % 8);
        }

        Ok(bitmaps)
    }

    /// Walk the sorted-list pages of a name (they occupy the zero-value
    /// prefix of its key range).
    fn scan_sorted_region(
        &self,
        name: &str,
        start: u64,
        end: u64,
        mut visit: impl FnMut(&SortedListView<'_>) -> Result<()>,
    ) -> Result<()> {
        let name_start = PostingKey::name_start(name);
        let mut it = self.tree.iter_from(name_start)?;

        while let Some((key, pid)) = it.next_entry()? {
            if !key.same_name(&name_start) || !key.has_zero_value() {
                break;
            }
            if !key.is_sorted_list() {
                continue;
            }
            if !self.in_time_window(&key, pid, start, end)? {
                continue;
            }

            let page = self.cache.fetch_page(pid)?;
            let buf = page.read();
            let view = SortedListView::new(&buf[PAGE_HEADER_SIZE..]);
            visit(&view)?;
        }
        Ok(())
    }

    fn in_time_window(&self, key: &PostingKey, pid: PageId, start: u64, end: u64) -> Result<bool> {
        if key.timestamp() >= end {
            return Ok(false);
        }
        let page = self.cache.fetch_page(pid)?;
        let buf = page.read();
        let (_, _, end_ts) = read_header(&buf);
        Ok(end_ts & !SORTED_LIST_FLAG >= start)
    }

    fn collect_sorted_matches(
        &self,
        matcher: &LabelMatcher,
        pid: PageId,
        out: &mut Vec<Tsid>,
    ) -> Result<()> {
        let page = self.cache.fetch_page(pid)?;
        let buf = page.read();
        let view = SortedListView::new(&buf[PAGE_HEADER_SIZE..]);

        let mut decode_err = None;
        view.scan_values(
            |value_ref| match self.series.get_symbol(value_ref) {
                Ok(value) => matcher.matches_value(&value),
                Err(e) => {
                    decode_err = Some(e);
                    false
                }
            },
            out,
        );

        match decode_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// OR a bitmap page into its segment's buffer after the time-window
    /// check and the decoded-label filter.
    fn visit_bitmap_page(
        &self,
        matcher: &LabelMatcher,
        key: PostingKey,
        pid: PageId,
        start: u64,
        end: u64,
        seg_mask: Option<&HashSet<u32>>,
        bitmaps: &mut SegmentBitmaps,
    ) -> Result<()> {
        let segment = key.segment();
        if seg_mask.map_or(false, |mask| !mask.contains(&segment)) {
            return Ok(());
        }
        if key.timestamp() >= end {
            return Ok(());
        }

        let page = self.cache.fetch_page(pid)?;
        let buf = page.read();
        let (name_ref, value_ref, end_ts) = read_header(&buf);
        if end_ts & SORTED_LIST_FLAG != 0 {
            return Err(IndexError::corrupt(format!(
                "sorted-list page {} under a bitmap key",
                pid
            )));
        }
        if end_ts < start {
            return Ok(());
        }

        let label = Label {
            name: self.series.get_symbol(name_ref)?,
            value: self.series.get_symbol(value_ref)?,
        };
        if !matcher.matches(&label) {
            return Ok(());
        }

        let area = &buf[PAGE_HEADER_SIZE..];
        match bitmaps.get_mut(&segment) {
            Some(held) => {
                for (a, b) in held.iter_mut().zip(area.iter()) {
                    *a |= b;
                }
            }
            None => {
                bitmaps.insert(segment, area.to_vec());
            }
        }
        Ok(())
    }

    /// All values of a name, read from bitmap page headers. Values that
    /// only live in sorted-list pages are not enumerated here.
    pub fn label_values(&self, name: &str) -> Result<HashSet<String>> {
        let mut values = HashSet::new();
        let name_start = PostingKey::name_start(name);
        let mut it = self.tree.iter_from(name_start)?;

        while let Some((key, pid)) = it.next_entry()? {
            if !key.same_name(&name_start) {
                break;
            }
            if key.is_sorted_list() {
                continue;
            }

            let page = self.cache.fetch_page(pid)?;
            let buf = page.read();
            let (name_ref, value_ref, _) = read_header(&buf);
            if self.series.get_symbol(name_ref)? == name {
                values.insert(self.series.get_symbol(value_ref)?);
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, bitmap_only: bool) -> (Arc<SeriesStore>, IndexTree) {
        let config = IndexConfig::new(dir.path());
        let series = Arc::new(SeriesStore::open(&config).unwrap());
        let tree = IndexTree::open(
            config.tree_file(),
            config.cache_size,
            Arc::clone(&series),
            bitmap_only,
        )
        .unwrap();
        (series, tree)
    }

    fn posting(value: &str, tsids: &[Tsid], min_ts: u64, max_ts: u64) -> LabeledPostings {
        let mut postings = RoaringTreemap::new();
        for &t in tsids {
            postings.insert(t);
        }
        LabeledPostings {
            value: value.to_owned(),
            postings,
            min_timestamp: min_ts,
            max_timestamp: max_ts,
        }
    }

    fn eq(name: &str, value: &str) -> LabelMatcher {
        LabelMatcher::equal(name, value)
    }

    fn resolve(tree: &IndexTree, matchers: &[LabelMatcher]) -> Vec<Tsid> {
        tree.resolve_label_matchers(matchers, 0, u64::MAX)
            .unwrap()
            .iter()
            .collect()
    }

    #[test]
    fn test_equality_query() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert(
            "job".into(),
            vec![
                posting("api", &[1, 2, 3], 100, 200),
                posting("db", &[4], 100, 200),
            ],
        );
        tree.write_postings(10, &snapshot).unwrap();

        assert_eq!(resolve(&tree, &[eq("job", "api")]), vec![1, 2, 3]);
        assert_eq!(resolve(&tree, &[eq("job", "db")]), vec![4]);
        assert!(resolve(&tree, &[eq("job", "web")]).is_empty());
        assert!(resolve(&tree, &[eq("nope", "api")]).is_empty());
    }

    #[test]
    fn test_conjunction_intersects_segments() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert(
            "env".into(),
            vec![posting("prod", &[1, 2, 3, 4], 100, 200)],
        );
        snapshot.insert(
            "job".into(),
            vec![
                posting("api", &[1, 2], 100, 200),
                posting("db", &[3], 100, 200),
            ],
        );
        tree.write_postings(10, &snapshot).unwrap();

        assert_eq!(
            resolve(&tree, &[eq("env", "prod"), eq("job", "api")]),
            vec![1, 2]
        );
        assert_eq!(
            resolve(&tree, &[eq("job", "db"), eq("env", "prod")]),
            vec![3]
        );
        assert!(resolve(&tree, &[eq("env", "prod"), eq("job", "web")]).is_empty());
    }

    #[test]
    fn test_neq_and_regex_and_order() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert(
            "env".into(),
            vec![posting("prod", &[1, 2, 3], 100, 200)],
        );
        snapshot.insert(
            "job".into(),
            vec![
                posting("api", &[1], 100, 200),
                posting("db", &[2], 100, 200),
                posting("web", &[3], 100, 200),
            ],
        );
        tree.write_postings(10, &snapshot).unwrap();

        let neq = LabelMatcher::new(MatchOp::Neq, "job", "db").unwrap();
        assert_eq!(resolve(&tree, &[eq("env", "prod"), neq]), vec![1, 3]);

        let re = LabelMatcher::new(MatchOp::EqRegex, "job", "^(api|web)$").unwrap();
        assert_eq!(resolve(&tree, &[re]), vec![1, 3]);

        let gt = LabelMatcher::new(MatchOp::Gt, "job", "api").unwrap();
        assert_eq!(resolve(&tree, &[gt]), vec![2, 3]);

        let lte = LabelMatcher::new(MatchOp::Lte, "job", "db").unwrap();
        assert_eq!(resolve(&tree, &[lte]), vec![1, 2]);
    }

    #[test]
    fn test_cross_segment_bitmaps() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);
        let ppp = tree.postings_per_page();

        let tsids = [1, 2, ppp + 5, 2 * ppp + 9];
        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("foo".into(), vec![posting("bar", &tsids, 100, 200)]);
        tree.write_postings(3 * ppp, &snapshot).unwrap();

        assert_eq!(resolve(&tree, &[eq("foo", "bar")]), tsids.to_vec());
    }

    /// Count the tree entries under one `(name, value)` key range.
    fn count_entries(tree: &IndexTree, name: &str, value: &str) -> usize {
        let start = PostingKey::name_value_start(name, value);
        let mut it = tree.tree.iter_from(start).unwrap();
        let mut count = 0;
        while let Some((key, _)) = it.next_entry().unwrap() {
            if !key.same_name_value(&start) {
                break;
            }
            count += 1;
        }
        count
    }

    #[test]
    fn test_second_write_updates_existing_page() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("job".into(), vec![posting("api", &[1, 2], 100, 150)]);
        tree.write_postings(10, &snapshot).unwrap();

        // The next generation arrives with a different minimum timestamp,
        // as gc produces every cycle; the existing page must still grow.
        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("job".into(), vec![posting("api", &[3], 200, 250)]);
        tree.write_postings(10, &snapshot).unwrap();

        assert_eq!(resolve(&tree, &[eq("job", "api")]), vec![1, 2, 3]);
        // The merged page advanced its end timestamp.
        let got = tree
            .resolve_label_matchers(&[eq("job", "api")], 220, u64::MAX)
            .unwrap();
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        // One page per (name, value, segment), not one per generation.
        assert_eq!(count_entries(&tree, "job", "api"), 1);
    }

    #[test]
    fn test_time_window_filters_pages() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("job".into(), vec![posting("api", &[1], 100, 200)]);
        tree.write_postings(10, &snapshot).unwrap();

        // Window entirely before the page's key timestamp.
        let got = tree
            .resolve_label_matchers(&[eq("job", "api")], 0, 50)
            .unwrap();
        assert!(got.is_empty());

        // Window entirely after the page's end timestamp.
        let got = tree
            .resolve_label_matchers(&[eq("job", "api")], 300, 400)
            .unwrap();
        assert!(got.is_empty());

        // Overlapping window hits.
        let got = tree
            .resolve_label_matchers(&[eq("job", "api")], 150, 160)
            .unwrap();
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_sorted_list_layout() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, false);

        // Many single-posting values: the sorted list wins the estimate.
        let entries: Vec<LabeledPostings> = (0..50)
            .map(|i| posting(&format!("host-{:02}", i), &[i + 1], 100 + i, 200 + i))
            .collect();
        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("instance".into(), entries);
        tree.write_postings(1000, &snapshot).unwrap();

        // Equality resolves through the sorted page's binary search.
        assert_eq!(resolve(&tree, &[eq("instance", "host-42")]), vec![43]);
        assert!(resolve(&tree, &[eq("instance", "host-99")]).is_empty());

        // Non-equality ops scan the items.
        let re = LabelMatcher::new(MatchOp::EqRegex, "instance", "^host-0[0-4]$").unwrap();
        assert_eq!(resolve(&tree, &[re]), vec![1, 2, 3, 4, 5]);

        let neq = LabelMatcher::new(MatchOp::Neq, "instance", "host-00").unwrap();
        assert_eq!(resolve(&tree, &[neq]).len(), 49);

        // Sorted-only values are not enumerated by label_values.
        assert!(tree.label_values("instance").unwrap().is_empty());
    }

    #[test]
    fn test_sorted_list_continues_across_writes() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, false);

        let first: Vec<LabeledPostings> = (0..20)
            .map(|i| posting(&format!("a-{:02}", i), &[i + 1], 100, 150))
            .collect();
        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("instance".into(), first);
        tree.write_postings(1000, &snapshot).unwrap();

        let second: Vec<LabeledPostings> = (0..20)
            .map(|i| posting(&format!("b-{:02}", i), &[100 + i], 200, 250))
            .collect();
        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("instance".into(), second);
        tree.write_postings(1000, &snapshot).unwrap();

        assert_eq!(resolve(&tree, &[eq("instance", "a-05")]), vec![6]);
        assert_eq!(resolve(&tree, &[eq("instance", "b-05")]), vec![105]);
    }

    #[test]
    fn test_bitmap_only_disables_sorted_lists() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let entries: Vec<LabeledPostings> = (0..30)
            .map(|i| posting(&format!("host-{:02}", i), &[i + 1], 100, 200))
            .collect();
        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert("instance".into(), entries);
        tree.write_postings(1000, &snapshot).unwrap();

        // Every value got a bitmap page, so all are enumerable.
        assert_eq!(tree.label_values("instance").unwrap().len(), 30);
        assert_eq!(resolve(&tree, &[eq("instance", "host-07")]), vec![8]);
    }

    #[test]
    fn test_label_values_reads_headers() {
        let dir = TempDir::new().unwrap();
        let (_series, tree) = setup(&dir, true);

        let mut snapshot = MemIndexSnapshot::new();
        snapshot.insert(
            "job".into(),
            vec![
                posting("api", &[1], 100, 200),
                posting("db", &[2], 100, 200),
            ],
        );
        snapshot.insert("env".into(), vec![posting("prod", &[1], 100, 200)]);
        tree.write_postings(10, &snapshot).unwrap();

        let values = tree.label_values("job").unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains("api") && values.contains("db"));
        assert!(tree.label_values("missing").unwrap().is_empty());
    }
}

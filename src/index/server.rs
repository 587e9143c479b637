//! Index server: the public facade
//!
//! Owns the mem index, the index tree, the WAL and a shared handle to the
//! series store. Coordinates ingest (allocate TSID → mem index → series
//! cache → WAL batch), queries (series fast path, then mem ∪ tree) and
//! compaction (snapshot the mem index into the tree, flush the series
//! store, advance the WAL checkpoint, garbage-collect).
//!
//! One compaction runs at a time; `commit` may detach it onto a worker
//! thread, which is joined when the server shuts down.

use crate::config::{CheckpointPolicy, IndexConfig};
use crate::index::index_tree::IndexTree;
use crate::index::mem_index::{AddOutcome, MemIndex};
use crate::labels::{canonicalize, equality_matchers, fingerprint, Label, LabelMatcher, MatchOp, Tsid};
use crate::series::SeriesStore;
use crate::wal::records::{self, SeriesRecord, LRT_SERIES};
use crate::wal::Wal;
use crate::{IndexError, Result};
use parking_lot::Mutex;
use roaring::RoaringTreemap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

/// New TSIDs since the last compaction watermark before another one fires.
const COMPACTION_THRESHOLD: u64 = 50_000;

/// Locks serializing concurrent `add_series` calls for the same label
/// set (sharded by fingerprint).
const ADD_LOCK_SHARDS: usize = 16;

pub struct IndexServer {
    mem_index: MemIndex,
    index_tree: IndexTree,
    wal: Wal,
    series: Arc<SeriesStore>,

    add_locks: Vec<Mutex<()>>,
    id_counter: AtomicU64,
    last_compaction_wm: AtomicU64,
    last_compaction_timestamp: AtomicU64,
    compacting: AtomicBool,
    compaction_mutex: Mutex<()>,
    compaction_thread: Mutex<Option<JoinHandle<()>>>,
    /// Handle to ourselves for detaching compaction onto a thread.
    self_ref: Mutex<Weak<IndexServer>>,

    checkpoint_policy: CheckpointPolicy,
}

/// Snapshot of the server's compaction bookkeeping.
#[derive(Debug, Clone)]
pub struct IndexServerStats {
    pub current_tsid: Tsid,
    pub last_compaction_wm: Tsid,
    /// Wall-clock milliseconds of the last compaction start.
    pub last_compaction_timestamp: u64,
    pub compacting: bool,
}

/// Clears the compacting flag even when compaction errors out.
struct CompactingGuard<'a>(&'a AtomicBool);

impl Drop for CompactingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl IndexServer {
    /// Open the index directory and replay the WAL suffix past the last
    /// checkpoint.
    pub fn open(config: &IndexConfig, series: Arc<SeriesStore>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.index_dir)?;

        let index_tree = IndexTree::open(
            config.tree_file(),
            config.cache_size,
            Arc::clone(&series),
            config.bitmap_only,
        )?;
        let wal = Wal::open(config.wal_dir())?;

        let server = Arc::new(Self {
            mem_index: MemIndex::new(),
            index_tree,
            wal,
            series,
            add_locks: (0..ADD_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
            id_counter: AtomicU64::new(0),
            last_compaction_wm: AtomicU64::new(0),
            last_compaction_timestamp: AtomicU64::new(0),
            compacting: AtomicBool::new(false),
            compaction_mutex: Mutex::new(()),
            compaction_thread: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
            checkpoint_policy: config.checkpoint_policy,
        });

        *server.self_ref.lock() = Arc::downgrade(&server);
        server.replay_wal()?;
        Ok(server)
    }

    /// Largest TSID handed out so far.
    pub fn current_tsid(&self) -> Tsid {
        self.id_counter.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> IndexServerStats {
        IndexServerStats {
            current_tsid: self.current_tsid(),
            last_compaction_wm: self.last_compaction_wm.load(Ordering::Acquire),
            last_compaction_timestamp: self.last_compaction_timestamp.load(Ordering::Acquire),
            compacting: self.compacting.load(Ordering::Acquire),
        }
    }

    /// Add a series (or find the existing one). Returns the TSID and
    /// whether this call created it.
    pub fn add_series(&self, timestamp: u64, labels: &[Label]) -> Result<(Tsid, bool)> {
        let mut labels = labels.to_vec();
        canonicalize(&mut labels);

        if let Some(entry) = self.series.get_by_label_set(&labels) {
            return Ok((entry.tsid, false));
        }

        // Serialize racing inserts of the same set: two concurrent calls
        // must agree on one TSID with exactly one `inserted = true`.
        let shard = (fingerprint(&labels) as usize) % ADD_LOCK_SHARDS;
        let _add_guard = self.add_locks[shard].lock();

        let existing = self.exists_inner(&labels, true)?;
        if existing.len() > 1 {
            return Err(IndexError::NotUnique);
        }
        if let Some(tsid) = existing.min() {
            return Ok((tsid, false));
        }

        loop {
            let tsid = self.id_counter.fetch_add(1, Ordering::AcqRel) + 1;
            match self.mem_index.add(&labels, tsid, timestamp) {
                AddOutcome::BelowWatermark => continue,
                AddOutcome::Exists(found) => return Ok((found, false)),
                AddOutcome::Inserted => {
                    self.series.add(tsid, labels, true)?;
                    return Ok((tsid, true));
                }
            }
        }
    }

    /// All TSIDs carrying exactly this label set. A unique hit found only
    /// in the tree is cached back into the series store.
    pub fn exists(&self, labels: &[Label], skip_tree: bool) -> Result<RoaringTreemap> {
        let mut labels = labels.to_vec();
        canonicalize(&mut labels);
        self.exists_inner(&labels, skip_tree)
    }

    fn exists_inner(&self, labels: &[Label], skip_tree: bool) -> Result<RoaringTreemap> {
        if let Some(entry) = self.series.get_by_label_set(labels) {
            let mut out = RoaringTreemap::new();
            out.insert(entry.tsid);
            return Ok(out);
        }

        let matchers = equality_matchers(labels);
        let mem = self.mem_index.resolve_label_matchers(&matchers);
        if !mem.is_empty() || skip_tree {
            return Ok(mem);
        }

        let tree = self
            .index_tree
            .resolve_label_matchers(&matchers, 0, u64::MAX)?;
        if tree.len() == 1 {
            let tsid = tree.min().expect("non-empty");
            self.series.add(tsid, labels.to_vec(), false)?;
        }
        Ok(tree)
    }

    /// Resolve a matcher conjunction intersected with `[start, end)`.
    pub fn resolve_label_matchers(
        &self,
        matchers: &[LabelMatcher],
        start: u64,
        end: u64,
    ) -> Result<RoaringTreemap> {
        crate::labels::validate_matchers(matchers)?;
        if matchers.iter().all(|m| m.op == MatchOp::Neq) {
            return Ok(RoaringTreemap::new());
        }

        // All-equality fast path through the series fingerprint map.
        if matchers.iter().all(|m| m.op == MatchOp::Eq) {
            let mut labels: Vec<Label> = matchers
                .iter()
                .map(|m| Label::new(m.name.clone(), m.value.clone()))
                .collect();
            canonicalize(&mut labels);
            if let Some(entry) = self.series.get_by_label_set(&labels) {
                let mut out = RoaringTreemap::new();
                out.insert(entry.tsid);
                return Ok(out);
            }
        }

        let (mem, tree) = rayon::join(
            || self.mem_index.resolve_label_matchers(matchers),
            || self.index_tree.resolve_label_matchers(matchers, start, end),
        );
        let mut out = mem;
        out |= tree?;

        // A unique result is worth keeping warm in the series cache.
        if out.len() == 1 {
            let _ = self.series.get(out.min().expect("non-empty"))?;
        }
        Ok(out)
    }

    /// The label set of a TSID, if known.
    pub fn get_labels(&self, tsid: Tsid) -> Result<Option<Vec<Label>>> {
        Ok(self.series.get(tsid)?.map(|entry| entry.labels.clone()))
    }

    /// Union of mem-index and tree values for a label name.
    pub fn label_values(&self, name: &str) -> Result<HashSet<String>> {
        let mut values = self.mem_index.label_values(name);
        values.extend(self.index_tree.label_values(name)?);
        Ok(values)
    }

    /// Bump max-timestamp accounting for a sample on an existing series.
    pub fn touch(&self, labels: &[Label], tsid: Tsid, timestamp: u64) {
        let mut labels = labels.to_vec();
        canonicalize(&mut labels);
        self.mem_index.touch(&labels, tsid, timestamp);
    }

    /// Log a batch of created series to the WAL, mark their cache entries
    /// clean and maybe kick off a background compaction.
    pub fn commit(&self, batch: &[SeriesRecord]) -> Result<()> {
        if !batch.is_empty() {
            let record = records::serialize_series(batch);
            self.wal.log_record(&record, true)?;
            for series in batch {
                self.series.mark_clean(series.tsid);
            }
        }

        self.try_compact(false, true)?;
        Ok(())
    }

    /// Run a compaction now, synchronously.
    pub fn manual_compact(&self) -> Result<bool> {
        self.try_compact(true, false)
    }

    /// Wait for a detached compaction to finish.
    pub fn wait_for_compaction(&self) {
        if let Some(handle) = self.compaction_thread.lock().take() {
            // The last server handle can be dropped by the compaction
            // thread itself; joining it from there would deadlock.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn try_compact(&self, force: bool, detach: bool) -> Result<bool> {
        let current = self.current_tsid();
        if !force
            && current < self.last_compaction_wm.load(Ordering::Acquire) + COMPACTION_THRESHOLD
        {
            return Ok(false);
        }

        let _guard = self.compaction_mutex.lock();
        let current = self.current_tsid();
        if !force
            && current < self.last_compaction_wm.load(Ordering::Acquire) + COMPACTION_THRESHOLD
        {
            return Ok(false);
        }
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        self.last_compaction_wm.store(current, Ordering::Release);
        self.last_compaction_timestamp.store(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            Ordering::Release,
        );

        let detached = if detach {
            self.self_ref.lock().upgrade()
        } else {
            None
        };

        match detached {
            Some(server) => {
                let handle = std::thread::spawn(move || {
                    let guard = CompactingGuard(&server.compacting);
                    if let Err(e) = server.compact(current) {
                        tracing::error!("compaction failed: {}", e);
                    }
                    drop(guard);
                });

                let mut slot = self.compaction_thread.lock();
                if let Some(previous) = slot.replace(handle) {
                    let _ = previous.join();
                }
            }
            None => {
                let guard = CompactingGuard(&self.compacting);
                self.compact(current)?;
                drop(guard);
            }
        }
        Ok(true)
    }

    /// Snapshot the mem index up to `limit` into the tree, flush the
    /// series store, GC and checkpoint.
    fn compact(&self, limit: Tsid) -> Result<()> {
        tracing::info!(limit, "compaction started");

        let last_segment = self.wal.close_segment()?;
        self.mem_index.set_low_watermark(limit, true);

        loop {
            let (snapshot, _max_time) = self.mem_index.snapshot(limit);
            match self.index_tree.write_postings(limit, &snapshot) {
                Ok(()) => break,
                Err(IndexError::TransactionAborted) => {
                    tracing::warn!("tree commit raced, re-snapshotting");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        self.series.flush()?;
        self.mem_index.gc();

        match self.checkpoint_policy {
            CheckpointPolicy::Normal => {
                self.wal.write_checkpoint(limit, last_segment)?;
            }
            CheckpointPolicy::Print => {
                tracing::info!(
                    watermark = limit,
                    segment = last_segment,
                    "checkpoint suppressed by policy"
                );
            }
            CheckpointPolicy::Disabled => {}
        }

        tracing::info!(limit, "compaction finished");
        Ok(())
    }

    /// Rebuild the mem index and series cache from the WAL suffix past
    /// the last checkpoint.
    fn replay_wal(&self) -> Result<()> {
        let stats = self.wal.last_checkpoint()?;
        let (seg_start, seg_end) = self.wal.segment_range()?;
        let start = seg_start.max(stats.last_segment);
        let mut high = stats.low_watermark;

        for seg in start..=seg_end {
            let mut reader = match self.wal.segment_reader(seg) {
                Ok(reader) => reader,
                Err(IndexError::Io(_)) => continue,
                Err(e) => return Err(e),
            };

            while let Some(record) = reader.next_record()? {
                if records::record_type(&record) != LRT_SERIES {
                    continue;
                }
                let batch = match records::deserialize_series(&record) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(segment = seg, "dropping corrupt WAL record: {}", e);
                        break;
                    }
                };

                for series in batch {
                    if series.tsid <= stats.low_watermark {
                        continue;
                    }
                    let mut labels = series.labels;
                    canonicalize(&mut labels);
                    if self.exists_inner(&labels, false)?.is_empty() {
                        self.mem_index.add(&labels, series.tsid, series.timestamp);
                        self.series.add(series.tsid, labels, false)?;
                    }
                    high = high.max(series.tsid);
                }
            }
        }

        if high > stats.low_watermark {
            tracing::info!(
                from = stats.low_watermark,
                to = high,
                "replayed WAL series records"
            );
        }

        self.last_compaction_wm.store(high, Ordering::Release);
        self.mem_index.set_low_watermark(high, false);
        self.id_counter.store(high, Ordering::Release);
        Ok(())
    }
}

impl Drop for IndexServer {
    fn drop(&mut self) {
        self.wait_for_compaction();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_server(dir: &TempDir) -> (Arc<SeriesStore>, Arc<IndexServer>) {
        open_server_with(dir, IndexConfig::new(dir.path()))
    }

    fn open_server_with(
        _dir: &TempDir,
        config: IndexConfig,
    ) -> (Arc<SeriesStore>, Arc<IndexServer>) {
        let series = Arc::new(SeriesStore::open(&config).unwrap());
        let server = IndexServer::open(&config, Arc::clone(&series)).unwrap();
        (series, server)
    }

    fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
        pairs.iter().map(|&(n, v)| Label::new(n, v)).collect()
    }

    fn eq(name: &str, value: &str) -> LabelMatcher {
        LabelMatcher::equal(name, value)
    }

    fn to_records(added: &[(Tsid, u64, Vec<Label>)]) -> Vec<SeriesRecord> {
        added
            .iter()
            .map(|(tsid, t, lset)| SeriesRecord::new(*tsid, *t, lset.clone()))
            .collect()
    }

    #[test]
    fn test_unique_ingest() {
        let dir = TempDir::new().unwrap();
        let (_series, server) = open_server(&dir);

        let lset = labels(&[("__name__", "up"), ("job", "api")]);
        assert_eq!(server.add_series(1000, &lset).unwrap(), (1, true));

        // Permuted label order resolves to the same series.
        let permuted = labels(&[("job", "api"), ("__name__", "up")]);
        assert_eq!(server.add_series(1100, &permuted).unwrap(), (1, false));

        let got = server
            .resolve_label_matchers(&[eq("__name__", "up")], 0, 2000)
            .unwrap();
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_equality_plus_inequality() {
        let dir = TempDir::new().unwrap();
        let (_series, server) = open_server(&dir);

        let mut by_job = std::collections::HashMap::new();
        for job in ["api", "db", "web"] {
            let lset = labels(&[("job", job), ("env", "prod")]);
            let (tsid, inserted) = server.add_series(1000, &lset).unwrap();
            assert!(inserted);
            by_job.insert(job, tsid);
        }

        let neq = LabelMatcher::new(MatchOp::Neq, "job", "db").unwrap();
        let got = server
            .resolve_label_matchers(&[eq("env", "prod"), neq], 0, u64::MAX)
            .unwrap();
        let mut expected = vec![by_job["api"], by_job["web"]];
        expected.sort_unstable();
        assert_eq!(got.iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_get_labels_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (_series, server) = open_server(&dir);

        let lset = labels(&[("zeta", "1"), ("alpha", "2"), ("mid", "3")]);
        let (tsid, _) = server.add_series(10, &lset).unwrap();

        let mut expected = lset.clone();
        canonicalize(&mut expected);
        assert_eq!(server.get_labels(tsid).unwrap().unwrap(), expected);
        assert!(server.get_labels(9999).unwrap().is_none());
    }

    #[test]
    fn test_monotone_tsids_and_exists() {
        let dir = TempDir::new().unwrap();
        let (_series, server) = open_server(&dir);

        let mut last = 0;
        for i in 0..50 {
            let lset = labels(&[("n", &format!("{}", i))]);
            let (tsid, inserted) = server.add_series(1, &lset).unwrap();
            assert!(inserted);
            assert!(tsid > last, "TSIDs must be strictly monotonic");
            last = tsid;
        }
        assert_eq!(server.current_tsid(), last);

        let hit = server.exists(&labels(&[("n", "7")]), false).unwrap();
        assert_eq!(hit.len(), 1);
        let miss = server.exists(&labels(&[("n", "999")]), false).unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn test_label_values_union() {
        let dir = TempDir::new().unwrap();
        // Bitmap pages only: sorted-list pages are invisible to
        // label_values by design.
        let mut config = IndexConfig::new(dir.path());
        config.bitmap_only = true;
        let (_series, server) = open_server_with(&dir, config);

        for job in ["api", "db"] {
            server.add_series(1, &labels(&[("job", job)])).unwrap();
        }
        server.manual_compact().unwrap();
        // One more value after compaction lives only in the mem index.
        server.add_series(2, &labels(&[("job", "web")])).unwrap();

        let values = server.label_values("job").unwrap();
        assert_eq!(values.len(), 3);
        for v in ["api", "db", "web"] {
            assert!(values.contains(v), "missing value {}", v);
        }
    }

    #[test]
    fn test_wal_replay_restores_state() {
        let dir = TempDir::new().unwrap();
        let last;
        {
            let (_series, server) = open_server(&dir);
            let mut added = Vec::new();
            for i in 0..20 {
                let lset = labels(&[("job", "api"), ("instance", &format!("h{}", i))]);
                let (tsid, inserted) = server.add_series(100 + i, &lset).unwrap();
                assert!(inserted);
                added.push((tsid, 100 + i, lset));
            }
            server.commit(&to_records(&added)).unwrap();
            last = server.current_tsid();
            // No compaction: state survives only through the WAL.
        }

        let (_series, server) = open_server(&dir);
        assert_eq!(server.current_tsid(), last);

        let got = server
            .resolve_label_matchers(&[eq("job", "api")], 0, u64::MAX)
            .unwrap();
        assert_eq!(got.len(), 20);

        // The replayed series resolves to its original TSID.
        let lset = labels(&[("job", "api"), ("instance", "h3")]);
        let (tsid, inserted) = server.add_series(500, &lset).unwrap();
        assert!(!inserted);
        assert_eq!(tsid, 4);

        let lbls = server.get_labels(4).unwrap().unwrap();
        assert!(lbls.contains(&Label::new("instance", "h3")));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let dir = TempDir::new().unwrap();
        {
            let (_series, server) = open_server(&dir);
            let mut added = Vec::new();
            for i in 0..10 {
                let lset = labels(&[("k", &format!("{}", i))]);
                let (tsid, _) = server.add_series(i, &lset).unwrap();
                added.push((tsid, i, lset));
            }
            server.commit(&to_records(&added)).unwrap();
        }

        let snapshot_a = {
            let (_series, server) = open_server(&dir);
            let got = server
                .resolve_label_matchers(
                    &[LabelMatcher::new(MatchOp::EqRegex, "k", ".*").unwrap()],
                    0,
                    u64::MAX,
                )
                .unwrap();
            (server.current_tsid(), got.iter().collect::<Vec<_>>())
        };
        let snapshot_b = {
            let (_series, server) = open_server(&dir);
            let got = server
                .resolve_label_matchers(
                    &[LabelMatcher::new(MatchOp::EqRegex, "k", ".*").unwrap()],
                    0,
                    u64::MAX,
                )
                .unwrap();
            (server.current_tsid(), got.iter().collect::<Vec<_>>())
        };
        assert_eq!(snapshot_a, snapshot_b);
    }

    #[test]
    fn test_compaction_persists_through_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (_series, server) = open_server(&dir);
            let mut added = Vec::new();
            for i in 0..30 {
                let lset = labels(&[("job", "api"), ("i", &format!("{}", i))]);
                let (tsid, _) = server.add_series(1000 + i, &lset).unwrap();
                added.push((tsid, 1000 + i, lset));
            }
            server.commit(&to_records(&added)).unwrap();
            assert!(server.manual_compact().unwrap());

            // Queries work mid-flight after compaction.
            let got = server
                .resolve_label_matchers(&[eq("job", "api")], 0, u64::MAX)
                .unwrap();
            assert_eq!(got.len(), 30);
        }

        let (_series, server) = open_server(&dir);
        let got = server
            .resolve_label_matchers(&[eq("job", "api")], 0, u64::MAX)
            .unwrap();
        assert_eq!(got.len(), 30);
        assert_eq!(server.current_tsid(), 30);

        // Series store was flushed by the compaction.
        let lbls = server.get_labels(5).unwrap().unwrap();
        assert!(lbls.contains(&Label::new("job", "api")));
    }

    #[test]
    fn test_compaction_contention() {
        let dir = TempDir::new().unwrap();
        let (_series, server) = open_server(&dir);

        let writer = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || {
                let mut last = 0;
                for i in 0..300u64 {
                    let lset = labels(&[("series", &format!("s-{}", i))]);
                    let (tsid, inserted) = server.add_series(i, &lset).unwrap();
                    assert!(inserted);
                    assert!(tsid > last);
                    last = tsid;
                    server
                        .commit(&[SeriesRecord::new(tsid, i, lset)])
                        .unwrap();
                }
                last
            })
        };

        for _ in 0..5 {
            server.manual_compact().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let last = writer.join().unwrap();
        server.manual_compact().unwrap();

        // Nothing was lost across the interleaved compactions.
        let re = LabelMatcher::new(MatchOp::EqRegex, "series", "^s-.*").unwrap();
        let got = server
            .resolve_label_matchers(&[re], 0, u64::MAX)
            .unwrap();
        assert_eq!(got.len(), 300);
        assert_eq!(server.current_tsid(), last);
    }

    #[test]
    fn test_commit_marks_series_clean() {
        let dir = TempDir::new().unwrap();
        let (series, server) = open_server(&dir);

        let lset = labels(&[("job", "api")]);
        let (tsid, _) = server.add_series(1, &lset).unwrap();
        let mut canonical = lset.clone();
        canonicalize(&mut canonical);
        assert!(series.get_by_label_set(&canonical).unwrap().is_dirty());

        server
            .commit(&[SeriesRecord::new(tsid, 1, lset)])
            .unwrap();
        assert!(!series.get_by_label_set(&canonical).unwrap().is_dirty());
    }

    #[test]
    fn test_all_negative_matchers_resolve_empty() {
        let dir = TempDir::new().unwrap();
        let (_series, server) = open_server(&dir);
        server.add_series(1, &labels(&[("job", "api")])).unwrap();

        let neq = LabelMatcher::new(MatchOp::Neq, "job", "db").unwrap();
        let got = server.resolve_label_matchers(&[neq], 0, u64::MAX).unwrap();
        assert!(got.is_empty());
    }
}

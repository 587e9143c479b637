//! In-memory inverted index of recent postings
//!
//! Postings for series above the low watermark live here until compaction
//! snapshots them into the persistent tree. The map is striped 32 ways by
//! label name; one top-level lock guards the watermarks, per-stripe locks
//! guard map contents. Lock order: top level first, then stripe.
//!
//! Timestamp accounting per `(name, value)`:
//! - `min_timestamp`: smallest timestamp of the current in-memory
//!   generation; becomes the key timestamp of persisted posting pages.
//! - `next_timestamp`: smallest timestamp seen after the compaction
//!   watermark was armed; promoted to `min_timestamp` by `gc`.
//! - `max_timestamp`: largest timestamp seen, bumped lock-free by `touch`.

use crate::labels::{Label, LabelMatcher, MatchOp, Tsid};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_64;

pub const NUM_STRIPES: usize = 32;
const STRIPE_MASK: u64 = (NUM_STRIPES as u64) - 1;

const NO_LIMIT: Tsid = Tsid::MAX;

/// Postings plus timestamp bookkeeping for one `(name, value)`.
pub struct MemPostings {
    pub bitmap: RoaringTreemap,
    pub min_timestamp: u64,
    pub next_timestamp: u64,
    pub max_timestamp: AtomicU64,
}

impl MemPostings {
    fn new() -> Self {
        Self {
            bitmap: RoaringTreemap::new(),
            min_timestamp: u64::MAX,
            next_timestamp: u64::MAX,
            max_timestamp: AtomicU64::new(0),
        }
    }

    fn add(&mut self, tsid: Tsid, timestamp: u64, set_next: bool) {
        self.bitmap.insert(tsid);
        if set_next {
            self.next_timestamp = self.next_timestamp.min(timestamp);
        } else {
            self.min_timestamp = self.min_timestamp.min(timestamp);
        }
        self.max_timestamp.fetch_max(timestamp, Ordering::AcqRel);
    }

    fn touch(&self, timestamp: u64) {
        self.max_timestamp.fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// One snapshot entry: the postings of one value under a name.
#[derive(Debug, Clone)]
pub struct LabeledPostings {
    pub value: String,
    pub postings: RoaringTreemap,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
}

/// name → entries, as handed to the index tree by compaction.
pub type MemIndexSnapshot = HashMap<String, Vec<LabeledPostings>>;

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// TSID at or below the low watermark; caller retries with a fresh one.
    BelowWatermark,
    /// The label set already exists under this TSID.
    Exists(Tsid),
    Inserted,
}

type StripeMap = HashMap<String, HashMap<String, MemPostings>>;

#[repr(align(64))]
struct MemStripe {
    map: RwLock<StripeMap>,
}

impl MemStripe {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    fn add(&self, label: &Label, tsid: Tsid, timestamp: u64, set_next: bool) {
        let mut map = self.map.write();
        map.entry(label.name.clone())
            .or_default()
            .entry(label.value.clone())
            .or_insert_with(MemPostings::new)
            .add(tsid, timestamp, set_next);
    }

    fn touch(&self, label: &Label, timestamp: u64) -> bool {
        let map = self.map.read();
        if let Some(postings) = map.get(&label.name).and_then(|m| m.get(&label.value)) {
            postings.touch(timestamp);
            true
        } else {
            false
        }
    }

    fn contains(&self, label: &Label, tsid: Tsid) -> bool {
        let map = self.map.read();
        map.get(&label.name)
            .and_then(|m| m.get(&label.value))
            .map(|p| p.bitmap.contains(tsid))
            .unwrap_or(false)
    }

    /// Fold one matcher into `tsids`. `exclude` collects Neq exclusions
    /// when positive matchers exist; `first` marks the first positive
    /// matcher (assign instead of intersect).
    fn resolve_matcher(
        &self,
        matcher: &LabelMatcher,
        tsids: &mut RoaringTreemap,
        exclude: Option<&mut RoaringTreemap>,
        first: bool,
    ) {
        let map = self.map.read();

        match matcher.op {
            MatchOp::Eq => {
                let Some(postings) =
                    map.get(&matcher.name).and_then(|m| m.get(&matcher.value))
                else {
                    *tsids = RoaringTreemap::new();
                    return;
                };
                if first {
                    *tsids = postings.bitmap.clone();
                } else {
                    *tsids &= &postings.bitmap;
                }
            }
            MatchOp::Neq => {
                let Some(value_map) = map.get(&matcher.name) else {
                    return;
                };
                match exclude {
                    None => {
                        for (value, postings) in value_map {
                            if value != &matcher.value {
                                *tsids |= &postings.bitmap;
                            }
                        }
                    }
                    Some(exclude) => {
                        if let Some(postings) = value_map.get(&matcher.value) {
                            *exclude |= &postings.bitmap;
                        }
                    }
                }
            }
            _ => {
                let mut matched = RoaringTreemap::new();
                if let Some(value_map) = map.get(&matcher.name) {
                    for (value, postings) in value_map {
                        if matcher.matches_value(value) {
                            matched |= &postings.bitmap;
                        }
                    }
                }
                if first {
                    *tsids = matched;
                } else {
                    *tsids &= matched;
                }
            }
        }
    }

    fn label_values(&self, name: &str, out: &mut HashSet<String>) {
        let map = self.map.read();
        if let Some(value_map) = map.get(name) {
            out.extend(value_map.keys().cloned());
        }
    }

    /// Clone postings with minimum TSID ≤ limit into the snapshot.
    /// Returns the largest max timestamp seen.
    fn snapshot(&self, limit: Tsid, snapshot: &mut MemIndexSnapshot) -> u64 {
        let map = self.map.read();
        let mut max_time = 0;

        for (name, value_map) in map.iter() {
            let mut entries = Vec::new();
            for (value, postings) in value_map {
                if postings.bitmap.is_empty() {
                    continue;
                }
                if postings.bitmap.min().unwrap_or(Tsid::MAX) > limit {
                    continue;
                }

                let max_ts = postings.max_timestamp.load(Ordering::Acquire);
                entries.push(LabeledPostings {
                    value: value.clone(),
                    postings: postings.bitmap.clone(),
                    min_timestamp: postings.min_timestamp,
                    max_timestamp: max_ts,
                });
                max_time = max_time.max(max_ts);
            }
            if !entries.is_empty() {
                snapshot.insert(name.clone(), entries);
            }
        }
        max_time
    }

    fn gc(&self, low_watermark: Tsid) {
        let mut map = self.map.write();

        map.retain(|_, value_map| {
            value_map.retain(|_, postings| {
                postings.bitmap.remove_range(0..low_watermark);
                if postings.bitmap.is_empty() {
                    return false;
                }
                postings.min_timestamp = postings.next_timestamp;
                postings.next_timestamp = u64::MAX;
                true
            });
            !value_map.is_empty()
        });
    }
}

struct Watermarks {
    low_watermark: Tsid,
    current_limit: Tsid,
}

pub struct MemIndex {
    stripes: Vec<MemStripe>,
    state: RwLock<Watermarks>,
}

impl Default for MemIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemIndex {
    pub fn new() -> Self {
        Self {
            stripes: (0..NUM_STRIPES).map(|_| MemStripe::new()).collect(),
            state: RwLock::new(Watermarks {
                low_watermark: 0,
                current_limit: NO_LIMIT,
            }),
        }
    }

    fn stripe_for(&self, name: &str) -> &MemStripe {
        let hash = xxh3_64(name.as_bytes());
        &self.stripes[(hash & STRIPE_MASK) as usize]
    }

    /// Insert a new series. Labels must be in canonical order.
    pub fn add(&self, labels: &[Label], tsid: Tsid, timestamp: u64) -> AddOutcome {
        let state = self.state.read();

        if tsid <= state.low_watermark {
            return AddOutcome::BelowWatermark;
        }

        // Double-checked: a racing insert of the same set wins.
        let matchers = crate::labels::equality_matchers(labels);
        let existing = self.resolve_unsafe(&matchers);
        if let Some(found) = existing.min() {
            return AddOutcome::Exists(found);
        }

        let set_next = state.current_limit != NO_LIMIT && tsid > state.current_limit;
        for label in labels {
            self.stripe_for(&label.name).add(label, tsid, timestamp, set_next);
        }
        AddOutcome::Inserted
    }

    /// Bump the max timestamp of an existing series, inserting it when the
    /// first label is unknown.
    pub fn touch(&self, labels: &[Label], tsid: Tsid, timestamp: u64) {
        debug_assert!(!labels.is_empty());
        let _state = self.state.read();

        let first = &labels[0];
        if self.stripe_for(&first.name).contains(first, tsid) {
            for label in labels {
                self.stripe_for(&label.name).touch(label, timestamp);
            }
            return;
        }

        for label in labels {
            self.stripe_for(&label.name).add(label, tsid, timestamp, false);
        }
    }

    pub fn set_low_watermark(&self, wm: Tsid, force: bool) {
        let mut state = self.state.write();
        state.low_watermark = wm;
        if force {
            state.current_limit = wm;
        }
    }

    pub fn resolve_label_matchers(&self, matchers: &[LabelMatcher]) -> RoaringTreemap {
        let _state = self.state.read();
        self.resolve_unsafe(matchers)
    }

    fn resolve_unsafe(&self, matchers: &[LabelMatcher]) -> RoaringTreemap {
        let mut tsids = RoaringTreemap::new();
        let mut exclude = RoaringTreemap::new();
        let positive = matchers.iter().filter(|m| m.op != MatchOp::Neq).count();
        let mut first = true;

        for matcher in matchers {
            let stripe = self.stripe_for(&matcher.name);
            stripe.resolve_matcher(
                matcher,
                &mut tsids,
                if positive > 0 { Some(&mut exclude) } else { None },
                first,
            );

            if matcher.op != MatchOp::Neq {
                if tsids.is_empty() {
                    return RoaringTreemap::new();
                }
                first = false;
            }
        }

        if !exclude.is_empty() {
            tsids -= &exclude;
        }
        tsids
    }

    pub fn label_values(&self, name: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        self.stripe_for(name).label_values(name, &mut out);
        out
    }

    /// Snapshot every posting with minimum TSID ≤ `limit` and disarm the
    /// compaction limit. Returns the snapshot and the largest timestamp it
    /// covers.
    pub fn snapshot(&self, limit: Tsid) -> (MemIndexSnapshot, u64) {
        let mut state = self.state.write();
        let mut snapshot = MemIndexSnapshot::new();
        let mut max_time = 0;

        for stripe in &self.stripes {
            max_time = max_time.max(stripe.snapshot(limit, &mut snapshot));
        }

        state.current_limit = NO_LIMIT;
        (snapshot, max_time)
    }

    /// Drop all postings below the low watermark and promote the
    /// next-generation timestamps.
    pub fn gc(&self) {
        let state = self.state.read();
        for stripe in &self.stripes {
            stripe.gc(state.low_watermark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::canonicalize;

    fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
        let mut out: Vec<Label> = pairs.iter().map(|&(n, v)| Label::new(n, v)).collect();
        canonicalize(&mut out);
        out
    }

    fn eq(name: &str, value: &str) -> LabelMatcher {
        LabelMatcher::equal(name, value)
    }

    #[test]
    fn test_add_and_resolve_eq() {
        let index = MemIndex::new();
        assert_eq!(
            index.add(&labels(&[("job", "api"), ("env", "prod")]), 1, 100),
            AddOutcome::Inserted
        );
        assert_eq!(
            index.add(&labels(&[("job", "db"), ("env", "prod")]), 2, 110),
            AddOutcome::Inserted
        );

        let got = index.resolve_label_matchers(&[eq("env", "prod")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1, 2]);

        let got = index.resolve_label_matchers(&[eq("env", "prod"), eq("job", "api")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1]);

        let got = index.resolve_label_matchers(&[eq("job", "web")]);
        assert!(got.is_empty());
    }

    #[test]
    fn test_duplicate_add_reports_existing() {
        let index = MemIndex::new();
        let lset = labels(&[("job", "api")]);
        assert_eq!(index.add(&lset, 1, 100), AddOutcome::Inserted);
        assert_eq!(index.add(&lset, 2, 200), AddOutcome::Exists(1));
    }

    #[test]
    fn test_watermark_rejects_low_tsids() {
        let index = MemIndex::new();
        index.set_low_watermark(10, false);
        assert_eq!(
            index.add(&labels(&[("job", "api")]), 10, 100),
            AddOutcome::BelowWatermark
        );
        assert_eq!(
            index.add(&labels(&[("job", "api")]), 11, 100),
            AddOutcome::Inserted
        );
    }

    #[test]
    fn test_neq_with_positive_matcher() {
        let index = MemIndex::new();
        for (i, job) in ["api", "db", "web"].into_iter().enumerate() {
            index.add(&labels(&[("job", job), ("env", "prod")]), i as u64 + 1, 100);
        }

        let neq = LabelMatcher::new(MatchOp::Neq, "job", "db").unwrap();
        let got = index.resolve_label_matchers(&[eq("env", "prod"), neq]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_neq_alone_unions_other_values() {
        let index = MemIndex::new();
        for (i, job) in ["api", "db", "web"].into_iter().enumerate() {
            index.add(&labels(&[("job", job)]), i as u64 + 1, 100);
        }

        let neq = LabelMatcher::new(MatchOp::Neq, "job", "db").unwrap();
        let got = index.resolve_label_matchers(&[neq]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_regex_and_order_matchers() {
        let index = MemIndex::new();
        for (i, inst) in ["host-1", "host-2", "spare-9"].into_iter().enumerate() {
            index.add(&labels(&[("instance", inst)]), i as u64 + 1, 100);
        }

        let re = LabelMatcher::new(MatchOp::EqRegex, "instance", "^host-.*").unwrap();
        let got = index.resolve_label_matchers(&[re]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1, 2]);

        let gt = LabelMatcher::new(MatchOp::Gt, "instance", "host-1").unwrap();
        let got = index.resolve_label_matchers(&[gt]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_snapshot_respects_limit_and_next_accounting() {
        let index = MemIndex::new();
        index.add(&labels(&[("job", "api")]), 1, 100);

        // Arm the watermark; later postings count toward next_timestamp.
        index.set_low_watermark(1, true);
        index.add(&labels(&[("job", "api"), ("x", "y")]), 2, 50);

        let (snapshot, max_time) = index.snapshot(1);
        let entries = &snapshot["job"];
        assert_eq!(entries.len(), 1);
        // min stays at the pre-watermark generation's minimum.
        assert_eq!(entries[0].min_timestamp, 100);
        assert!(max_time >= 100);

        // A posting whose minimum TSID is above the limit is excluded.
        assert!(!snapshot.contains_key("x"));
    }

    #[test]
    fn test_gc_drops_persisted_postings() {
        let index = MemIndex::new();
        index.add(&labels(&[("job", "api"), ("i", "1")]), 1, 100);
        index.add(&labels(&[("job", "api"), ("i", "2")]), 2, 1_000);

        index.set_low_watermark(1, true);
        index.add(&labels(&[("job", "api"), ("i", "3")]), 3, 2_000);

        index.gc();

        // TSIDs < 1 dropped; 1, 2, 3 remain (gc keeps >= watermark).
        let got = index.resolve_label_matchers(&[eq("job", "api")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        index.set_low_watermark(3, false);
        index.gc();
        let got = index.resolve_label_matchers(&[eq("job", "api")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_touch_bumps_max_timestamp() {
        let index = MemIndex::new();
        let lset = labels(&[("job", "api")]);
        index.add(&lset, 1, 100);
        index.touch(&lset, 1, 500);

        let (snapshot, max_time) = index.snapshot(1);
        assert_eq!(max_time, 500);
        assert_eq!(snapshot["job"][0].max_timestamp, 500);

        // Touch of an unknown series falls back to insertion.
        let other = labels(&[("job", "db")]);
        index.touch(&other, 2, 300);
        let got = index.resolve_label_matchers(&[eq("job", "db")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_label_values() {
        let index = MemIndex::new();
        index.add(&labels(&[("job", "api")]), 1, 100);
        index.add(&labels(&[("job", "db")]), 2, 100);

        let values = index.label_values("job");
        assert_eq!(values.len(), 2);
        assert!(values.contains("api") && values.contains("db"));
        assert!(index.label_values("missing").is_empty());
    }
}

//! Labels, label sets and matchers
//!
//! A series is identified by its label set: a sequence of `name=value`
//! pairs kept sorted by name so that equal sets hash equally. Matchers are
//! the query-side counterpart; every matcher op compares against the label
//! *value*, the name selects the posting list.

use crate::{IndexError, Result};
use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

/// Time series identifier. TSID 0 is reserved.
pub type Tsid = u64;

/// Separator byte between label parts in the fingerprint stream.
const FINGERPRINT_SEP: u8 = 0xff;

/// One `name=value` tag pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Sort a label set into canonical (by-name) order.
pub fn canonicalize(labels: &mut [Label]) {
    labels.sort_by(|a, b| a.name.cmp(&b.name));
}

/// 64-bit fingerprint of a canonically ordered label set.
///
/// Hashes the byte stream `name 0xFF value 0xFF ...`; callers must pass the
/// set in canonical order for equal sets to collide.
pub fn fingerprint(labels: &[Label]) -> u64 {
    let mut buf = Vec::with_capacity(labels.len() * 16);
    for label in labels {
        buf.extend_from_slice(label.name.as_bytes());
        buf.push(FINGERPRINT_SEP);
        buf.extend_from_slice(label.value.as_bytes());
        buf.push(FINGERPRINT_SEP);
    }
    xxh3_64(&buf)
}

/// Matcher operators. Only `Neq` is a purely negative op; the server
/// requires at least one non-`Neq` matcher per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    EqRegex,
    NeqRegex,
}

/// One label matcher. Regex variants hold the compiled pattern.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub op: MatchOp,
    pub name: String,
    pub value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let regex = match op {
            MatchOp::EqRegex | MatchOp::NeqRegex => Some(Regex::new(&value)?),
            _ => None,
        };
        Ok(Self {
            op,
            name: name.into(),
            value,
            regex,
        })
    }

    /// Equality matcher; infallible.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: MatchOp::Eq,
            name: name.into(),
            value: value.into(),
            regex: None,
        }
    }

    /// Does `value` satisfy this matcher?
    pub fn matches_value(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Eq => value == self.value,
            MatchOp::Neq => value != self.value,
            MatchOp::Lt => value < self.value.as_str(),
            MatchOp::Lte => value <= self.value.as_str(),
            MatchOp::Gt => value > self.value.as_str(),
            MatchOp::Gte => value >= self.value.as_str(),
            MatchOp::EqRegex => self
                .regex
                .as_ref()
                .map(|re| re.is_match(value))
                .unwrap_or(false),
            MatchOp::NeqRegex => self
                .regex
                .as_ref()
                .map(|re| !re.is_match(value))
                .unwrap_or(false),
        }
    }

    /// Does `label` satisfy this matcher (name and value)?
    pub fn matches(&self, label: &Label) -> bool {
        label.name == self.name && self.matches_value(&label.value)
    }
}

/// Build all-equality matchers for an existence check on a label set.
pub fn equality_matchers(labels: &[Label]) -> Vec<LabelMatcher> {
    labels
        .iter()
        .map(|l| LabelMatcher::equal(l.name.clone(), l.value.clone()))
        .collect()
}

/// Reject the empty matcher set. All-negative (`Neq`-only) sets are legal
/// here; the server resolves those to the empty posting set instead.
pub fn validate_matchers(matchers: &[LabelMatcher]) -> Result<()> {
    if matchers.is_empty() {
        return Err(IndexError::corrupt("empty matcher set"));
    }
    Ok(())
}

//! Fixed-width tree keys and values
//!
//! The copy-on-write tree stores keys and values in fixed-width page slots,
//! so both sides reduce to a small codec trait plus `Ord`. Two keys exist:
//! the 22-byte posting key used by the index tree and plain `u64` used by
//! the B+tree series backend.
//!
//! Posting key layout (byte offsets):
//!
//! ```text
//! | name hash (4) | value prefix+hash (6) | end_ts BE (8) | segment BE (4) |
//! ```
//!
//! Ordering is lexicographic over `(name, value)`, then timestamp
//! ascending, then segment **descending** — a forward scan visits the
//! newest segment first for the same `(name, value, timestamp)`. The
//! timestamp and segment are stored big-endian so the first 18 bytes
//! compare as one memcmp. Bit 63 of the timestamp doubles as the page-type
//! flag (clear = bitmap, set = sorted list).

use std::cmp::Ordering;
use xxhash_rust::xxh3::xxh3_64;

pub const NAME_BYTES: usize = 4;
pub const VALUE_BYTES: usize = 6;
pub const VALUE_PREFIX_BYTES: usize = VALUE_BYTES - 2;
pub const SEG_BYTES: usize = 4;
pub const KEY_WIDTH: usize = NAME_BYTES + VALUE_BYTES + 8 + SEG_BYTES;

/// High bit of the timestamp field marks a sorted-list page.
pub const SORTED_LIST_FLAG: u64 = 1 << 63;

/// Fixed-width codec for tree keys.
pub trait TreeKey:
    Copy + Clone + Ord + Eq + Default + Send + Sync + std::fmt::Debug + 'static
{
    const WIDTH: usize;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

/// Fixed-width codec for tree values.
pub trait TreeValue:
    Copy + Clone + Eq + Default + Send + Sync + std::fmt::Debug + 'static
{
    const WIDTH: usize;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

impl TreeKey for u64 {
    const WIDTH: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }
}

impl TreeValue for u32 {
    const WIDTH: usize = 4;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().unwrap())
    }
}

impl TreeValue for u64 {
    const WIDTH: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }
}

/// The index-tree key tuple.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PostingKey {
    buf: [u8; KEY_WIDTH],
}

impl PostingKey {
    /// Key for a bitmap posting page.
    pub fn bitmap(name: &str, value: &str, timestamp: u64, segment: u32) -> Self {
        let mut key = Self::default();
        key.buf[..NAME_BYTES].copy_from_slice(&hash_name(name));
        key.buf[NAME_BYTES..NAME_BYTES + VALUE_BYTES].copy_from_slice(&hash_value(value));
        key.set_timestamp(timestamp & !SORTED_LIST_FLAG);
        key.set_segment(segment);
        key
    }

    /// Key for a sorted-list posting page. The value field stays zero (the
    /// page spans many values); `ordinal` numbers the pages of one name.
    pub fn sorted_list(name: &str, timestamp: u64, ordinal: u32) -> Self {
        let mut key = Self::default();
        key.buf[..NAME_BYTES].copy_from_slice(&hash_name(name));
        key.set_timestamp(timestamp | SORTED_LIST_FLAG);
        key.set_segment(ordinal);
        key
    }

    /// Smallest possible key of a name's range: zero value field, zero
    /// timestamp and the maximum segment (segments order descending).
    pub fn name_start(name: &str) -> Self {
        let mut key = Self::default();
        key.buf[..NAME_BYTES].copy_from_slice(&hash_name(name));
        key.set_segment(u32::MAX);
        key
    }

    /// Smallest possible key of an exact `(name, value)` range.
    pub fn name_value_start(name: &str, value: &str) -> Self {
        Self::bitmap(name, value, 0, u32::MAX)
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.buf[..NAME_BYTES]
    }

    pub fn value_bytes(&self) -> &[u8] {
        &self.buf[NAME_BYTES..NAME_BYTES + VALUE_BYTES]
    }

    /// Raw value prefix bytes (lexicographically comparable with the
    /// prefix of the real value string).
    pub fn value_prefix(&self) -> &[u8] {
        &self.buf[NAME_BYTES..NAME_BYTES + VALUE_PREFIX_BYTES]
    }

    /// Timestamp field including the page-type flag bit.
    pub fn timestamp_raw(&self) -> u64 {
        u64::from_be_bytes(
            self.buf[NAME_BYTES + VALUE_BYTES..NAME_BYTES + VALUE_BYTES + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// Timestamp with the flag bit masked off.
    pub fn timestamp(&self) -> u64 {
        self.timestamp_raw() & !SORTED_LIST_FLAG
    }

    pub fn segment(&self) -> u32 {
        u32::from_be_bytes(self.buf[KEY_WIDTH - SEG_BYTES..].try_into().unwrap())
    }

    pub fn is_sorted_list(&self) -> bool {
        self.timestamp_raw() & SORTED_LIST_FLAG != 0
    }

    pub fn set_timestamp(&mut self, ts: u64) {
        self.buf[NAME_BYTES + VALUE_BYTES..NAME_BYTES + VALUE_BYTES + 8]
            .copy_from_slice(&ts.to_be_bytes());
    }

    pub fn set_segment(&mut self, seg: u32) {
        self.buf[KEY_WIDTH - SEG_BYTES..].copy_from_slice(&seg.to_be_bytes());
    }

    pub fn same_name(&self, other: &Self) -> bool {
        self.name_bytes() == other.name_bytes()
    }

    pub fn same_name_value(&self, other: &Self) -> bool {
        self.buf[..NAME_BYTES + VALUE_BYTES] == other.buf[..NAME_BYTES + VALUE_BYTES]
    }

    /// True while the value field is still all zeros — the region where
    /// sorted-list keys live within a name's range.
    pub fn has_zero_value(&self) -> bool {
        self.value_bytes().iter().all(|&b| b == 0)
    }
}

impl Ord for PostingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // name + value + big-endian timestamp compare as raw bytes;
        // the segment field orders in reverse.
        match self.buf[..KEY_WIDTH - SEG_BYTES].cmp(&other.buf[..KEY_WIDTH - SEG_BYTES]) {
            Ordering::Equal => {
                other.buf[KEY_WIDTH - SEG_BYTES..].cmp(&self.buf[KEY_WIDTH - SEG_BYTES..])
            }
            ord => ord,
        }
    }
}

impl PartialOrd for PostingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TreeKey for PostingKey {
    const WIDTH: usize = KEY_WIDTH;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..KEY_WIDTH].copy_from_slice(&self.buf);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut key = Self::default();
        key.buf.copy_from_slice(&buf[..KEY_WIDTH]);
        key
    }
}

impl std::fmt::Debug for PostingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.buf {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// LSBs of the 64-bit name hash, big-endian so equal hashes are adjacent.
pub fn hash_name(name: &str) -> [u8; NAME_BYTES] {
    let h = xxh3_64(name.as_bytes());
    let mut out = [0u8; NAME_BYTES];
    for (j, slot) in out.iter_mut().enumerate() {
        *slot = (h >> ((NAME_BYTES - 1 - j) * 8)) as u8;
    }
    out
}

/// Value field: raw prefix bytes (zero padded) followed by two hash LSBs.
/// The prefix gives range scans locality, the hash keeps equality exact
/// enough to prune before the label is decoded.
pub fn hash_value(value: &str) -> [u8; VALUE_BYTES] {
    let mut out = [0u8; VALUE_BYTES];
    let bytes = value.as_bytes();
    let n = bytes.len().min(VALUE_PREFIX_BYTES);
    out[..n].copy_from_slice(&bytes[..n]);

    let h = xxh3_64(bytes);
    out[VALUE_BYTES - 2] = (h >> 8) as u8;
    out[VALUE_BYTES - 1] = h as u8;
    out
}

/// Prefix bytes of a value string, padded like the key field.
pub fn value_prefix(value: &str) -> [u8; VALUE_PREFIX_BYTES] {
    let mut out = [0u8; VALUE_PREFIX_BYTES];
    let bytes = value.as_bytes();
    let n = bytes.len().min(VALUE_PREFIX_BYTES);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_field_roundtrip() {
        let key = PostingKey::bitmap("job", "api", 12345, 7);
        assert_eq!(key.timestamp(), 12345);
        assert_eq!(key.segment(), 7);
        assert!(!key.is_sorted_list());
        assert_eq!(key.name_bytes(), &hash_name("job"));
        assert_eq!(key.value_bytes(), &hash_value("api"));

        let sorted = PostingKey::sorted_list("job", 99, 3);
        assert!(sorted.is_sorted_list());
        assert_eq!(sorted.timestamp(), 99);
        assert_eq!(sorted.segment(), 3);
        assert!(sorted.has_zero_value());
    }

    #[test]
    fn test_tuple_order() {
        // Timestamp ascending.
        let a = PostingKey::bitmap("job", "api", 10, 0);
        let b = PostingKey::bitmap("job", "api", 20, 0);
        assert!(a < b);

        // Segment descending at equal (name, value, ts).
        let s0 = PostingKey::bitmap("job", "api", 10, 0);
        let s1 = PostingKey::bitmap("job", "api", 10, 1);
        assert!(s1 < s0);

        // Name start sorts before every key of the name.
        let start = PostingKey::name_start("job");
        assert!(start <= a);
        assert!(start <= PostingKey::sorted_list("job", 0, u32::MAX));
    }

    #[test]
    fn test_sorted_keys_sort_within_zero_value_region() {
        // Sorted-list keys carry a zero value field and therefore precede
        // all bitmap keys of the same name whose value field is non-zero.
        let sorted = PostingKey::sorted_list("job", u64::MAX & !SORTED_LIST_FLAG, 0);
        let bitmap = PostingKey::bitmap("job", "api", 0, u32::MAX);
        assert!(sorted < bitmap);
    }

    #[test]
    fn test_value_prefix_compare() {
        let key = PostingKey::bitmap("job", "database", 0, 0);
        assert_eq!(key.value_prefix(), b"data");
        assert_eq!(&value_prefix("db"), b"db\0\0");
    }

    #[test]
    fn test_codec_roundtrip() {
        let key = PostingKey::bitmap("job", "api", 42, 5);
        let mut buf = [0u8; KEY_WIDTH];
        key.write_to(&mut buf);
        assert_eq!(PostingKey::read_from(&buf), key);

        let mut buf8 = [0u8; 8];
        TreeKey::write_to(&1234u64, &mut buf8);
        assert_eq!(<u64 as TreeKey>::read_from(&buf8), 1234);
    }
}

//! Sorted-list posting page layout
//!
//! A sorted-list page stores `(value_ref, tsid)` items behind a line
//! pointer array, the same shape as a slotted heap page:
//!
//! ```text
//! | lower (2) | upper (2) | line pointers ... -> | ... <- items |
//! ```
//!
//! Line pointers grow from the front, item bytes from the back; the page
//! is full when they would meet. Items are kept sorted ascending by
//! `(value_ref, tsid)`, which the binary search relies on. Item offsets
//! are 1-based.

use crate::labels::Tsid;
use crate::series::symbol_table::SymbolRef;

const P_LOWER: usize = 0;
const P_UPPER: usize = 2;
const P_POINTERS: usize = 4;
const LINE_POINTER_SIZE: usize = 4;

/// `value_ref(4) || tsid(8)`, little-endian.
pub const ITEM_SIZE: usize = 4 + 8;

pub const FIRST_ITEM_OFFSET: usize = 1;

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn lower(buf: &[u8]) -> usize {
    read_u16(buf, P_LOWER) as usize
}

fn upper(buf: &[u8]) -> usize {
    read_u16(buf, P_UPPER) as usize
}

fn item_count(buf: &[u8]) -> usize {
    let lo = lower(buf);
    if lo < P_POINTERS {
        0
    } else {
        (lo - P_POINTERS) / LINE_POINTER_SIZE
    }
}

fn item_at(buf: &[u8], offset: usize) -> (SymbolRef, Tsid) {
    debug_assert!(offset >= FIRST_ITEM_OFFSET && offset <= item_count(buf));
    let lp = P_POINTERS + (offset - 1) * LINE_POINTER_SIZE;
    let item_off = read_u16(buf, lp) as usize;
    let vref = u32::from_le_bytes(buf[item_off..item_off + 4].try_into().unwrap());
    let tsid = u64::from_le_bytes(buf[item_off + 4..item_off + 12].try_into().unwrap());
    (vref, tsid)
}

/// First 1-based offset whose item is `>= (key, tsid)` (or `count + 1`).
fn search(buf: &[u8], key: SymbolRef, tsid: Tsid) -> usize {
    let mut low = FIRST_ITEM_OFFSET;
    let mut high = item_count(buf) + 1;

    while low < high {
        let mid = (low + high) >> 1;
        let (mid_key, mid_tsid) = item_at(buf, mid);
        if (mid_key, mid_tsid) < (key, tsid) {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}

/// Read-only view over a sorted-list page's item area.
pub struct SortedListView<'a> {
    buf: &'a [u8],
}

impl<'a> SortedListView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn item_count(&self) -> usize {
        item_count(self.buf)
    }

    pub fn item(&self, offset: usize) -> (SymbolRef, Tsid) {
        item_at(self.buf, offset)
    }

    /// Exact-item membership test.
    pub fn contains(&self, key: SymbolRef, tsid: Tsid) -> bool {
        let i = search(self.buf, key, tsid);
        i <= self.item_count() && self.item(i) == (key, tsid)
    }

    /// All TSIDs stored under `key` (binary search, then forward walk).
    pub fn get_values(&self, key: SymbolRef, out: &mut Vec<Tsid>) {
        let count = self.item_count();
        if count == 0 {
            return;
        }
        let (first_key, _) = self.item(FIRST_ITEM_OFFSET);
        let (last_key, _) = self.item(count);
        if first_key > key || last_key < key {
            return;
        }

        let mut i = search(self.buf, key, 0);
        while i <= count {
            let (item_key, tsid) = self.item(i);
            if item_key != key {
                break;
            }
            out.push(tsid);
            i += 1;
        }
    }

    /// Walk every item, pushing TSIDs whose value ref passes `pred`. The
    /// predicate runs once per distinct ref (items are ref-sorted).
    pub fn scan_values(&self, mut pred: impl FnMut(SymbolRef) -> bool, out: &mut Vec<Tsid>) {
        let mut last: Option<(SymbolRef, bool)> = None;
        for i in FIRST_ITEM_OFFSET..=self.item_count() {
            let (vref, tsid) = self.item(i);
            let keep = match last {
                Some((prev, verdict)) if prev == vref => verdict,
                _ => {
                    let verdict = pred(vref);
                    last = Some((vref, verdict));
                    verdict
                }
            };
            if keep {
                out.push(tsid);
            }
        }
    }
}

/// Mutable view; adds initialization and sorted insert.
pub struct SortedListViewMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> SortedListViewMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Zero the area and reset the lower/upper pointers.
    pub fn init(&mut self) {
        self.buf.fill(0);
        write_u16(self.buf, P_LOWER, P_POINTERS as u16);
        write_u16(self.buf, P_UPPER, self.buf.len() as u16);
    }

    pub fn as_view(&self) -> SortedListView<'_> {
        SortedListView { buf: self.buf }
    }

    fn free_space(&self) -> usize {
        let size = upper(self.buf).saturating_sub(lower(self.buf));
        if size < LINE_POINTER_SIZE {
            0
        } else {
            size
        }
    }

    /// Insert one item at its sorted position. Returns `false` when the
    /// page cannot hold another item.
    pub fn insert(&mut self, key: SymbolRef, tsid: Tsid) -> bool {
        if self.free_space() < ITEM_SIZE + LINE_POINTER_SIZE {
            return false;
        }

        let target = search(self.buf, key, tsid);
        let count = item_count(self.buf);
        let new_upper = upper(self.buf) - ITEM_SIZE;

        // Shift line pointers right of the target.
        if target <= count {
            let start = P_POINTERS + (target - 1) * LINE_POINTER_SIZE;
            let end = P_POINTERS + count * LINE_POINTER_SIZE;
            self.buf.copy_within(start..end, start + LINE_POINTER_SIZE);
        }

        let lp = P_POINTERS + (target - 1) * LINE_POINTER_SIZE;
        write_u16(self.buf, lp, new_upper as u16);
        write_u16(self.buf, lp + 2, ITEM_SIZE as u16);

        self.buf[new_upper..new_upper + 4].copy_from_slice(&key.to_le_bytes());
        self.buf[new_upper + 4..new_upper + 12].copy_from_slice(&tsid.to_le_bytes());

        let new_lower = lower(self.buf) + LINE_POINTER_SIZE;
        write_u16(self.buf, P_LOWER, new_lower as u16);
        write_u16(self.buf, P_UPPER, new_upper as u16);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page(size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        SortedListViewMut::new(&mut buf).init();
        buf
    }

    #[test]
    fn test_insert_keeps_sorted_order() {
        let mut buf = fresh_page(512);
        let mut page = SortedListViewMut::new(&mut buf);

        assert!(page.insert(5, 100));
        assert!(page.insert(2, 50));
        assert!(page.insert(5, 10));
        assert!(page.insert(9, 1));

        let view = page.as_view();
        assert_eq!(view.item_count(), 4);
        let items: Vec<_> = (1..=4).map(|i| view.item(i)).collect();
        assert_eq!(items, vec![(2, 50), (5, 10), (5, 100), (9, 1)]);
    }

    #[test]
    fn test_get_values_binary_search() {
        let mut buf = fresh_page(4080);
        let mut page = SortedListViewMut::new(&mut buf);
        for tsid in [30u64, 10, 20] {
            assert!(page.insert(7, tsid));
        }
        assert!(page.insert(3, 1));
        assert!(page.insert(11, 2));

        let view = SortedListView::new(&buf);
        let mut out = Vec::new();
        view.get_values(7, &mut out);
        assert_eq!(out, vec![10, 20, 30]);

        out.clear();
        view.get_values(8, &mut out);
        assert!(out.is_empty());
        view.get_values(1, &mut out);
        assert!(out.is_empty());
        view.get_values(99, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_scan_values_with_predicate() {
        let mut buf = fresh_page(512);
        let mut page = SortedListViewMut::new(&mut buf);
        page.insert(1, 10);
        page.insert(2, 20);
        page.insert(2, 21);
        page.insert(3, 30);

        let view = SortedListView::new(&buf);
        let mut out = Vec::new();
        view.scan_values(|vref| vref != 2, &mut out);
        assert_eq!(out, vec![10, 30]);
    }

    #[test]
    fn test_page_fills_up() {
        let mut buf = fresh_page(4 + 10 * (ITEM_SIZE + LINE_POINTER_SIZE));
        let mut page = SortedListViewMut::new(&mut buf);
        for i in 0..10u64 {
            assert!(page.insert(1, i), "item {} should fit", i);
        }
        assert!(!page.insert(1, 10), "page should be full");
        assert_eq!(page.as_view().item_count(), 10);
    }
}

//! Free-list indices over tagged chunks: an unordered doubly-linked list for
//! V1, and an array of size-class bins of the same list for V2.

use crate::chunk::ChunkRef;
use crate::unit::BIN_COUNT;

/// One unordered, doubly-linked list of free chunks. Exposed only so
/// [`FreeIndex::lists`] can hand the checker a uniform view regardless of
/// whether the index behind it is a single list or many bins; its own
/// methods are crate-private.
#[derive(Clone, Copy)]
pub struct FreeList {
    head: Option<ChunkRef>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList { head: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<ChunkRef> {
        self.head
    }

    /// Insert `chunk` at the front. `chunk` must not already be linked into
    /// any list.
    pub(crate) fn push_front(&mut self, chunk: ChunkRef) {
        chunk.set_next_free(self.head);
        chunk.set_prev_free(None);
        if let Some(old_head) = self.head {
            old_head.set_prev_free(Some(chunk));
        }
        self.head = Some(chunk);
    }

    /// Unlink `chunk` from wherever it sits in this list.
    pub(crate) fn remove(&mut self, chunk: ChunkRef) {
        let prev = chunk.prev_free();
        let next = chunk.next_free();
        match prev {
            Some(p) => p.set_next_free(next),
            None => self.head = next,
        }
        if let Some(n) = next {
            n.set_prev_free(prev);
        }
        chunk.set_next_free(None);
        chunk.set_prev_free(None);
    }

    pub(crate) fn iter(&self) -> FreeListIter {
        FreeListIter(self.head)
    }

    pub(crate) fn find_fit(&self, required_units: usize) -> Option<ChunkRef> {
        self.iter().find(|c| c.units() >= required_units)
    }

    pub(crate) fn contains(&self, chunk: ChunkRef) -> bool {
        self.iter().any(|c| c == chunk)
    }
}

pub(crate) struct FreeListIter(Option<ChunkRef>);

impl Iterator for FreeListIter {
    type Item = ChunkRef;

    fn next(&mut self) -> Option<ChunkRef> {
        let current = self.0?;
        self.0 = current.next_free();
        Some(current)
    }
}

/// A free-chunk index an engine can search, insert into, and remove from,
/// abstracting over whether the underlying storage is one list (V1) or many
/// size-class bins (V2).
pub trait FreeIndex {
    fn new() -> Self;
    fn add(&mut self, chunk: ChunkRef);
    fn remove(&mut self, chunk: ChunkRef);
    fn search(&self, required_units: usize) -> Option<ChunkRef>;
    /// Every underlying list, for the invariant checker to traverse.
    fn lists(&self) -> &[FreeList];
    /// Whether `chunk` is present in the list its size maps to. For a single
    /// unordered list this is just membership; for bins it also confirms the
    /// chunk sits in the bin its size selects.
    fn contains_in_expected_list(&self, chunk: ChunkRef) -> bool;
}

/// V1's index: one unordered doubly-linked list, searched with plain
/// first-fit.
pub struct SingleList(FreeList);

impl FreeIndex for SingleList {
    fn new() -> Self {
        SingleList(FreeList::new())
    }

    fn add(&mut self, chunk: ChunkRef) {
        self.0.push_front(chunk);
    }

    fn remove(&mut self, chunk: ChunkRef) {
        self.0.remove(chunk);
    }

    fn search(&self, required_units: usize) -> Option<ChunkRef> {
        self.0.find_fit(required_units)
    }

    fn lists(&self) -> &[FreeList] {
        core::slice::from_ref(&self.0)
    }

    fn contains_in_expected_list(&self, chunk: ChunkRef) -> bool {
        self.0.contains(chunk)
    }
}

/// V2's index: [`BIN_COUNT`] size-class bins, each an unordered doubly-linked
/// list, keyed by `min(units, BIN_COUNT - 1)` with the last bin acting as an
/// overflow class for anything at or above that size.
pub struct Bins([FreeList; BIN_COUNT]);

impl Bins {
    fn bin_index(units: usize) -> usize {
        core::cmp::min(units, BIN_COUNT - 1)
    }
}

impl FreeIndex for Bins {
    fn new() -> Self {
        Bins(core::array::from_fn(|_| FreeList::new()))
    }

    fn add(&mut self, chunk: ChunkRef) {
        let idx = Self::bin_index(chunk.units());
        self.0[idx].push_front(chunk);
    }

    fn remove(&mut self, chunk: ChunkRef) {
        let idx = Self::bin_index(chunk.units());
        self.0[idx].remove(chunk);
    }

    fn search(&self, required_units: usize) -> Option<ChunkRef> {
        let start = Self::bin_index(required_units);
        for bin in &self.0[start..] {
            if let Some(chunk) = bin.find_fit(required_units) {
                return Some(chunk);
            }
        }
        None
    }

    fn lists(&self) -> &[FreeList] {
        &self.0
    }

    fn contains_in_expected_list(&self, chunk: ChunkRef) -> bool {
        let idx = Self::bin_index(chunk.units());
        self.0[idx].contains(chunk)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::unit::{units_to_bytes, Addr};
    use std::alloc::{alloc_zeroed, Layout};

    fn make_chunk(base: *mut u8, offset_units: usize, units: usize) -> ChunkRef {
        let addr = Addr::new(std::ptr::NonNull::new(base).unwrap()).unit_add(offset_units);
        let chunk = ChunkRef::new(addr);
        chunk.set_units(units);
        chunk
    }

    #[test]
    fn single_list_push_and_remove() {
        let layout = Layout::from_size_align(units_to_bytes(64), 16).unwrap();
        let base = unsafe { alloc_zeroed(layout) };

        let mut list = SingleList::new();
        let a = make_chunk(base, 0, 5);
        let b = make_chunk(base, 10, 8);
        list.add(a);
        list.add(b);

        assert_eq!(list.search(6), Some(b));
        list.remove(b);
        assert_eq!(list.search(6), None);
        assert!(list.contains_in_expected_list(a));
        assert!(!list.contains_in_expected_list(b));

        unsafe { std::alloc::dealloc(base, layout) };
    }

    #[test]
    fn bins_route_by_size_class_and_spill() {
        let layout = Layout::from_size_align(units_to_bytes(4096), 16).unwrap();
        let base = unsafe { alloc_zeroed(layout) };

        let mut bins = Bins::new();
        let small = make_chunk(base, 0, 5);
        let huge = make_chunk(base, 2000, BIN_COUNT + 50);
        bins.add(small);
        bins.add(huge);

        assert!(bins.lists()[5].contains(small));
        assert!(bins.lists()[BIN_COUNT - 1].contains(huge));
        assert!(bins.contains_in_expected_list(small));
        assert!(bins.contains_in_expected_list(huge));

        assert_eq!(bins.search(BIN_COUNT + 10), Some(huge));

        unsafe { std::alloc::dealloc(base, layout) };
    }
}

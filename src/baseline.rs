//! The baseline engine: header-only chunks, an address-ordered singly-linked
//! free list, and coalescing driven by tracking the previous chunk while
//! walking the list rather than by a stored footer.

use core::ptr::NonNull;

use crate::break_adapter::BreakAdapter;
use crate::unit::{units_to_bytes, Addr, MIN_UNITS_FROM_OS};

const HEADER_OVERHEAD_UNITS: usize = 1;

/// The minimum number of units any baseline chunk may contain.
pub const MIN_UNITS_BASELINE: usize = 2;

#[repr(C)]
struct Header {
    units: usize,
    next_free: Option<NonNull<u8>>,
}

static_assertions::const_assert!(core::mem::size_of::<Header>() <= crate::unit::UNIT_SIZE);

/// A handle to a baseline chunk. Unlike the tagged layout, baseline chunks
/// carry no stored status: whether one is free or in use is entirely a
/// function of free-list membership.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ChunkRef(Addr);

impl ChunkRef {
    fn new(addr: Addr) -> Self {
        ChunkRef(addr)
    }

    fn addr(self) -> Addr {
        self.0
    }

    fn header(self) -> *mut Header {
        self.0.as_ptr().cast()
    }

    fn units(self) -> usize {
        unsafe { (*self.header()).units }
    }

    fn set_units(self, units: usize) {
        unsafe {
            (*self.header()).units = units;
        }
    }

    fn next_free(self) -> Option<ChunkRef> {
        let ptr = unsafe { (*self.header()).next_free }?;
        Some(ChunkRef(Addr::new(ptr)))
    }

    fn set_next_free(self, next: Option<ChunkRef>) {
        unsafe {
            (*self.header()).next_free = next.map(|c| c.0.as_nonnull());
        }
    }

    fn to_payload(self) -> NonNull<u8> {
        self.0.unit_add(1).as_nonnull()
    }

    fn from_payload(payload: NonNull<u8>) -> Self {
        ChunkRef(Addr::new(payload).unit_sub(1))
    }

    fn next_in_memory(self, heap_end: Addr) -> Option<ChunkRef> {
        let next = self.0.unit_add(self.units());
        if next == heap_end {
            None
        } else {
            Some(ChunkRef(next))
        }
    }

    fn is_valid(self, heap_start: Addr, heap_end: Addr) -> bool {
        let addr = self.0.as_usize();
        if addr < heap_start.as_usize() || addr >= heap_end.as_usize() {
            return false;
        }
        let units = self.units();
        if units < MIN_UNITS_BASELINE {
            return false;
        }
        let end = self.0.unit_add(units).as_usize();
        end > heap_start.as_usize() && end <= heap_end.as_usize()
    }
}

const fn bytes_to_units(bytes: usize) -> usize {
    crate::unit::bytes_to_units(bytes, HEADER_OVERHEAD_UNITS, MIN_UNITS_BASELINE)
}

fn has_forward_cycle(head: Option<ChunkRef>) -> bool {
    let mut slow = head;
    let mut fast = head;
    loop {
        fast = match fast.and_then(|c| c.next_free()) {
            Some(c) => Some(c),
            None => return false,
        };
        if slow == fast {
            return true;
        }
        fast = match fast.and_then(|c| c.next_free()) {
            Some(c) => Some(c),
            None => return false,
        };
        slow = slow.and_then(|c| c.next_free());
        if slow == fast {
            return true;
        }
    }
}

/// An address-ordered, singly-linked list of free chunks.
struct OrderedList {
    head: Option<ChunkRef>,
}

impl OrderedList {
    const fn new() -> Self {
        OrderedList { head: None }
    }

    fn iter(&self) -> OrderedListIter {
        OrderedListIter(self.head)
    }
}

struct OrderedListIter(Option<ChunkRef>);

impl Iterator for OrderedListIter {
    type Item = ChunkRef;

    fn next(&mut self) -> Option<ChunkRef> {
        let current = self.0?;
        self.0 = current.next_free();
        Some(current)
    }
}

/// The baseline heap engine: a single header field per chunk, a strictly
/// address-ordered free list, and no stored per-chunk status.
pub struct BaselineHeap<A> {
    adapter: A,
    heap_start: Option<Addr>,
    heap_end: Option<Addr>,
    free_list: OrderedList,
}

impl<A: BreakAdapter> BaselineHeap<A> {
    pub fn new(adapter: A) -> Self {
        BaselineHeap {
            adapter,
            heap_start: None,
            heap_end: None,
            free_list: OrderedList::new(),
        }
    }

    fn ensure_init(&mut self) {
        if self.heap_start.is_none() {
            let brk = self.adapter.current_break();
            self.heap_start = Some(Addr::new(brk));
            self.heap_end = Some(Addr::new(brk));
        }
    }

    fn debug_check(&self, context: &str) {
        if cfg!(debug_assertions) {
            if let (Some(start), Some(end)) = (self.heap_start, self.heap_end) {
                if !self.is_valid(start, end) {
                    panic!("heap invariant violated at {context}");
                }
            }
        }
    }

    fn is_valid(&self, heap_start: Addr, heap_end: Addr) -> bool {
        if heap_start == heap_end {
            if self.free_list.head.is_none() {
                return true;
            }
            log::error!("baseline heap is empty but the free list is not");
            return false;
        }

        let mut cursor = Some(ChunkRef::new(heap_start));
        while let Some(chunk) = cursor {
            if !chunk.is_valid(heap_start, heap_end) {
                log::error!("baseline forward memory traversal found a bad chunk");
                return false;
            }
            cursor = chunk.next_in_memory(heap_end);
        }

        if has_forward_cycle(self.free_list.head) {
            log::error!("baseline free list has a cycle");
            return false;
        }

        let mut prev: Option<ChunkRef> = None;
        for chunk in self.free_list.iter() {
            if !chunk.is_valid(heap_start, heap_end) {
                log::error!("baseline free list contains a bad chunk");
                return false;
            }
            if let Some(p) = prev {
                if p.addr().as_usize() >= chunk.addr().as_usize() {
                    log::error!("baseline free list is not in ascending address order");
                    return false;
                }
                if p.next_in_memory(heap_end) == Some(chunk) {
                    log::error!("baseline free list has two adjacent free chunks");
                    return false;
                }
            }
            prev = Some(chunk);
        }
        true
    }

    /// Grow the arena, appending (or merging into) `prev`, the chunk the
    /// caller was about to link the new memory after.
    fn get_more_memory(&mut self, prev: Option<ChunkRef>, required_units: usize) -> Option<ChunkRef> {
        let units = core::cmp::max(required_units, MIN_UNITS_FROM_OS);
        let heap_end = self.heap_end.expect("get_more_memory called before ensure_init");
        let extra_bytes = units_to_bytes(units);
        let new_end_addr = (heap_end.as_ptr() as usize).checked_add(extra_bytes)?;
        let new_end_ptr = NonNull::new(new_end_addr as *mut u8)?;

        self.adapter.set_break(new_end_ptr).ok()?;

        let chunk = ChunkRef::new(heap_end);
        chunk.set_units(units);
        chunk.set_next_free(None);
        self.heap_end = Some(Addr::new(new_end_ptr));
        log::trace!("grew baseline heap by {units} units");

        match prev {
            None => self.free_list.head = Some(chunk),
            Some(p) => p.set_next_free(Some(chunk)),
        }

        if let Some(p) = prev {
            if p.next_in_memory(self.heap_end.unwrap()) == Some(chunk) {
                p.set_units(p.units() + units);
                p.set_next_free(None);
                return Some(p);
            }
        }
        Some(chunk)
    }

    /// Deliver `chunk`, found after `prev` in the free list, for
    /// `required_units`: splice the whole chunk out if it's close enough to
    /// the right size, otherwise shrink it and hand over the freshly split
    /// tail as the allocated piece (the opposite convention from the tagged
    /// engines, which keep the head and split off a free tail).
    fn use_chunk(&mut self, chunk: ChunkRef, prev: Option<ChunkRef>, required_units: usize) -> ChunkRef {
        let chunk_units = chunk.units();
        if chunk_units < required_units + MIN_UNITS_BASELINE {
            match prev {
                None => self.free_list.head = chunk.next_free(),
                Some(p) => p.set_next_free(chunk.next_free()),
            }
            chunk.set_next_free(None);
            chunk
        } else {
            chunk.set_units(chunk_units - required_units);
            let tail = chunk.next_in_memory(self.heap_end.unwrap()).unwrap();
            tail.set_units(required_units);
            log::trace!("split off a {required_units} unit tail for delivery");
            tail
        }
    }

    pub fn allocate(&mut self, nbytes: usize) -> Option<NonNull<u8>> {
        if nbytes == 0 {
            return None;
        }
        self.ensure_init();
        self.debug_check("allocate:entry");

        let units = bytes_to_units(nbytes);

        let mut prev_prev: Option<ChunkRef> = None;
        let mut prev: Option<ChunkRef> = None;
        let mut found: Option<ChunkRef> = None;
        let mut cursor = self.free_list.head;
        while let Some(c) = cursor {
            if c.units() >= units {
                found = Some(c);
                break;
            }
            prev_prev = prev;
            prev = Some(c);
            cursor = c.next_free();
        }

        let delivered = if let Some(c) = found {
            self.use_chunk(c, prev, units)
        } else {
            let Some(grown) = self.get_more_memory(prev, units) else {
                self.debug_check("allocate:exit (exhausted)");
                return None;
            };
            let effective_prev = if Some(grown) == prev { prev_prev } else { prev };
            self.use_chunk(grown, effective_prev, units)
        };

        self.debug_check("allocate:exit");
        Some(delivered.to_payload())
    }

    pub fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        self.debug_check("release:entry");

        let chunk = ChunkRef::from_payload(ptr);

        let mut prev: Option<ChunkRef> = None;
        let mut next = self.free_list.head;
        while let Some(n) = next {
            if n.addr().as_usize() >= chunk.addr().as_usize() {
                break;
            }
            prev = Some(n);
            next = n.next_free();
        }

        match prev {
            None => self.free_list.head = Some(chunk),
            Some(p) => p.set_next_free(Some(chunk)),
        }
        chunk.set_next_free(next);

        let mut chunk = chunk;
        if let Some(n) = next {
            if chunk.next_in_memory(self.heap_end.unwrap()) == Some(n) {
                chunk.set_units(chunk.units() + n.units());
                chunk.set_next_free(n.next_free());
                log::trace!("coalesced forward into a {} unit chunk", chunk.units());
            }
        }
        if let Some(p) = prev {
            if p.next_in_memory(self.heap_end.unwrap()) == Some(chunk) {
                p.set_units(p.units() + chunk.units());
                p.set_next_free(chunk.next_free());
                log::trace!("coalesced backward into a {} unit chunk", p.units());
            }
        }

        self.debug_check("release:exit");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::break_adapter::test_support::MockBreakAdapter;

    fn heap() -> BaselineHeap<MockBreakAdapter> {
        BaselineHeap::new(MockBreakAdapter::new(1 << 20))
    }

    #[test_log::test]
    fn lifo_alloc_and_free() {
        let mut heap = heap();
        let mut ptrs = Vec::new();
        for _ in 0..100 {
            ptrs.push(heap.allocate(24).unwrap());
        }
        while let Some(p) = ptrs.pop() {
            heap.release(Some(p));
        }
    }

    #[test_log::test]
    fn fifo_alloc_and_free() {
        let mut heap = heap();
        let mut ptrs = Vec::new();
        for _ in 0..100 {
            ptrs.push(heap.allocate(24).unwrap());
        }
        ptrs.reverse();
        for p in ptrs {
            heap.release(Some(p));
        }
    }

    #[test]
    fn release_of_none_is_a_no_op() {
        let mut heap = heap();
        heap.release(None);
        let p = heap.allocate(16).unwrap();
        heap.release(Some(p));
    }

    #[test]
    fn allocate_zero_bytes_returns_none() {
        let mut heap = heap();
        assert!(heap.allocate(0).is_none());
    }

    #[test]
    fn free_list_stays_ascending_after_random_order_release() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        let c = heap.allocate(16).unwrap();
        heap.release(Some(b));
        heap.release(Some(a));
        heap.release(Some(c));
    }

    #[test]
    fn content_survives_across_overlapping_allocations() {
        let mut heap = heap();
        let mut live = Vec::new();
        for i in 0..50u8 {
            let p = heap.allocate(16).unwrap();
            unsafe { p.as_ptr().write_bytes(i, 16) };
            live.push((p, i));
        }
        for (p, i) in &live {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 16) };
            assert!(bytes.iter().all(|&b| b == *i));
        }
        for (p, _) in live {
            heap.release(Some(p));
        }
    }

    #[derive(Clone, Copy, Debug)]
    enum Op {
        Alloc(usize),
        FreeOldest,
    }

    use proptest::prelude::*;

    fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![(1usize..512).prop_map(Op::Alloc), Just(Op::FreeOldest)],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn random_alloc_free_sequences_never_violate_invariants(ops in ops_strategy()) {
            let mut heap = heap();
            let mut live: Vec<NonNull<u8>> = Vec::new();
            for op in &ops {
                match *op {
                    Op::Alloc(n) => {
                        if let Some(p) = heap.allocate(n.max(1)) {
                            live.push(p);
                        }
                    }
                    Op::FreeOldest => {
                        if !live.is_empty() {
                            let p = live.remove(0);
                            heap.release(Some(p));
                        }
                    }
                }
            }
            for p in live {
                heap.release(Some(p));
            }
        }
    }
}

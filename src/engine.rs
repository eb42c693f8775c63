//! The tagged-chunk engine shared by V1 (unordered list) and V2 (binned
//! list): boundary-tag coalescing, split-on-allocate, and break-driven growth,
//! generic over which [`FreeIndex`] is used to find a fit.

use core::ptr::NonNull;

use crate::break_adapter::BreakAdapter;
use crate::checker;
use crate::chunk::{bytes_to_units, ChunkRef, ChunkStatus};
use crate::freelist::FreeIndex;
use crate::unit::{units_to_bytes, Addr, MIN_UNITS_FROM_OS, SPLIT_THRESHOLD};

/// A tagged-chunk heap engine. `A` supplies growable address space; `Idx`
/// supplies the free-chunk index (V1's single list or V2's bins).
pub struct TaggedHeap<A, Idx> {
    adapter: A,
    heap_start: Option<Addr>,
    heap_end: Option<Addr>,
    index: Idx,
}

impl<A: BreakAdapter, Idx: FreeIndex> TaggedHeap<A, Idx> {
    pub fn new(adapter: A) -> Self {
        TaggedHeap {
            adapter,
            heap_start: None,
            heap_end: None,
            index: Idx::new(),
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
                if !checker::is_valid(start, end, &self.index) {
                    panic!("heap invariant violated at {context}");
                }
            }
        }
    }

    /// Grow the arena by at least `required_units`, rounded up to
    /// [`MIN_UNITS_FROM_OS`]. Returns the new chunk, marked free but not yet
    /// inserted into the index, or `None` if the break adapter refused.
    fn grow(&mut self, required_units: usize) -> Option<ChunkRef> {
        let units = core::cmp::max(required_units, MIN_UNITS_FROM_OS);
        let heap_end = self.heap_end.expect("grow called before ensure_init");
        let extra_bytes = units_to_bytes(units);
        let new_end_addr = (heap_end.as_ptr() as usize).checked_add(extra_bytes)?;
        let new_end_ptr = NonNull::new(new_end_addr as *mut u8)?;

        self.adapter.set_break(new_end_ptr).ok()?;

        let chunk = ChunkRef::new(heap_end);
        chunk.set_units(units);
        chunk.set_next_free(None);
        chunk.set_prev_free(None);
        self.heap_end = Some(Addr::new(new_end_ptr));
        log::trace!("grew heap by {units} units");
        Some(chunk)
    }

    /// Merge `a` (lower address) and `b` (`a`'s immediate successor in
    /// memory), removing both from the index and leaving the merged, free
    /// chunk addressed at `a` back in the index.
    fn coalesce(&mut self, a: ChunkRef, b: ChunkRef) -> ChunkRef {
        self.index.remove(a);
        self.index.remove(b);
        let total = a.units() + b.units();
        a.set_units(total);
        a.set_status(ChunkStatus::Free);
        self.index.add(a);
        log::trace!("coalesced {} + {} units into {total}", total - b.units(), b.units());
        a
    }

    /// Deliver `chunk` (already removed from the index) for `required_units`:
    /// split off a free tail when the surplus justifies it, otherwise hand
    /// over the whole chunk.
    fn split_or_deliver(&mut self, chunk: ChunkRef, required_units: usize) -> ChunkRef {
        let surplus = chunk.units() - required_units;
        if surplus >= SPLIT_THRESHOLD {
            let tail_addr = chunk.addr().unit_add(required_units);
            let tail = ChunkRef::new(tail_addr);
            tail.set_units(surplus);
            tail.set_status(ChunkStatus::Free);
            tail.set_next_free(None);
            tail.set_prev_free(None);
            chunk.set_units(required_units);
            self.index.add(tail);
            log::trace!("split off a {} unit free tail", tail.units());
        }
        chunk.set_status(ChunkStatus::InUse);
        chunk
    }

    pub fn allocate(&mut self, nbytes: usize) -> Option<NonNull<u8>> {
        if nbytes == 0 {
            return None;
        }
        self.ensure_init();
        self.debug_check("allocate:entry");

        let units = bytes_to_units(nbytes);

        let chunk = match self.index.search(units) {
            Some(found) => {
                self.index.remove(found);
                found
            }
            None => {
                let Some(mut grown) = self.grow(units) else {
                    self.debug_check("allocate:exit (exhausted)");
                    return None;
                };
                grown.set_status(ChunkStatus::Free);
                self.index.add(grown);
                if let Some(prev) = grown.prev_in_memory(self.heap_start.unwrap()) {
                    if prev.status() == ChunkStatus::Free {
                        grown = self.coalesce(prev, grown);
                    }
                }
                self.index.remove(grown);
                grown
            }
        };

        let delivered = self.split_or_deliver(chunk, units);
        self.debug_check("allocate:exit");
        Some(delivered.to_payload())
    }

    pub fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        self.debug_check("release:entry");

        let mut chunk = ChunkRef::from_payload(ptr);
        chunk.set_status(ChunkStatus::Free);
        self.index.add(chunk);

        if let Some(next) = chunk.next_in_memory(self.heap_end.unwrap()) {
            if next.status() == ChunkStatus::Free {
                chunk = self.coalesce(chunk, next);
            }
        }
        if let Some(prev) = chunk.prev_in_memory(self.heap_start.unwrap()) {
            if prev.status() == ChunkStatus::Free {
                self.coalesce(prev, chunk);
            }
        }

        self.debug_check("release:exit");
    }
}

//! Process-wide singletons wrapping each engine in a spinlock, plus a
//! `GlobalAlloc` adapter over the default one.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::break_adapter::SbrkBreakAdapter;
use crate::engine::TaggedHeap;
use crate::freelist::SingleList;
use crate::unit::UNIT_SIZE;

/// The process-wide default: the V1 (unordered free list) tagged engine
/// backed by the real program break. Lazily initialized on first use.
static DEFAULT_HEAP: Mutex<Option<TaggedHeap<SbrkBreakAdapter, SingleList>>> = Mutex::new(None);

fn with_default_heap<R>(f: impl FnOnce(&mut TaggedHeap<SbrkBreakAdapter, SingleList>) -> R) -> R {
    let mut guard = DEFAULT_HEAP.lock();
    let heap = guard.get_or_insert_with(|| TaggedHeap::new(SbrkBreakAdapter::new()));
    f(heap)
}

/// Allocate `nbytes` from the process-wide default heap.
pub fn allocate(nbytes: usize) -> Option<NonNull<u8>> {
    with_default_heap(|heap| heap.allocate(nbytes))
}

/// Release a pointer previously returned by [`allocate`]. `None` is a no-op.
pub fn release(ptr: Option<NonNull<u8>>) {
    with_default_heap(|heap| heap.release(ptr))
}

/// A `#[global_allocator]`-compatible adapter over the process-wide default
/// heap. Alignment requests beyond the crate's natural unit size are not
/// supported, matching this allocator's scope.
pub struct GlobalAllocator;

unsafe impl GlobalAlloc for GlobalAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        debug_assert!(
            layout.align() <= UNIT_SIZE,
            "alignment beyond the natural unit size is not supported"
        );
        match allocate(layout.size()) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        release(NonNull::new(ptr));
    }
}

//! The external collaborator every engine grows through: an abstraction over
//! the process break, so the engines never call into libc directly and tests
//! never touch real process memory.

use core::ptr::NonNull;

/// Why a break adjustment was refused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakError {
    /// The adapter could not move the break to the requested address.
    Denied,
}

/// A source of growable, contiguous address space. Implementations must
/// return addresses that only ever increase between calls to
/// [`BreakAdapter::set_break`] -- the engines rely on this monotonicity to
/// treat "the heap" as a single growing arena starting at the first observed
/// break.
pub trait BreakAdapter {
    /// The current break, i.e. the address one past the end of the arena.
    fn current_break(&mut self) -> NonNull<u8>;

    /// Move the break to `new_break`, which must be at or beyond the current
    /// break. Returns [`BreakError::Denied`] if the underlying system refuses.
    fn set_break(&mut self, new_break: NonNull<u8>) -> Result<(), BreakError>;
}

/// The production [`BreakAdapter`]: grows the real process break via `sbrk`.
#[derive(Default)]
pub struct SbrkBreakAdapter {
    _private: (),
}

impl SbrkBreakAdapter {
    pub const fn new() -> Self {
        SbrkBreakAdapter { _private: () }
    }
}

impl BreakAdapter for SbrkBreakAdapter {
    fn current_break(&mut self) -> NonNull<u8> {
        // SAFETY: sbrk(0) only queries the break, it never mutates anything.
        let brk = unsafe { libc::sbrk(0) };
        NonNull::new(brk.cast()).expect("sbrk(0) returned a null program break")
    }

    fn set_break(&mut self, new_break: NonNull<u8>) -> Result<(), BreakError> {
        let current = self.current_break().as_ptr() as isize;
        let target = new_break.as_ptr() as isize;
        let increment = target - current;

        // SAFETY: we only ever grow the break by a positive increment derived
        // from a previously observed break, matching sbrk's documented use.
        let result = unsafe { libc::sbrk(increment) };
        if result as isize == -1 {
            Err(BreakError::Denied)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// An in-memory stand-in for the program break used by every test in this
    /// crate. Mimics `sbrk`'s never-shrinks growth contract over a
    /// heap-allocated buffer instead of real process memory.
    pub(crate) struct MockBreakAdapter {
        base: NonNull<u8>,
        capacity: usize,
        used: usize,
        layout: Layout,
    }

    impl MockBreakAdapter {
        pub(crate) fn new(capacity: usize) -> Self {
            let layout = Layout::from_size_align(capacity, 16).unwrap();
            // SAFETY: capacity is nonzero in every caller in this crate.
            let base = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(base).expect("mock break allocation failed");
            MockBreakAdapter {
                base,
                capacity,
                used: 0,
                layout,
            }
        }
    }

    impl Drop for MockBreakAdapter {
        fn drop(&mut self) {
            // SAFETY: base/layout were produced together in `new` and never
            // mutated afterward.
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    impl BreakAdapter for MockBreakAdapter {
        fn current_break(&mut self) -> NonNull<u8> {
            // SAFETY: `used` never exceeds `capacity`, so this stays in bounds.
            unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) }
        }

        fn set_break(&mut self, new_break: NonNull<u8>) -> Result<(), BreakError> {
            let offset = new_break.as_ptr() as usize - self.base.as_ptr() as usize;
            if offset > self.capacity {
                return Err(BreakError::Denied);
            }
            self.used = offset;
            Ok(())
        }
    }

    #[test]
    fn mock_break_grows_monotonically() {
        let mut adapter = MockBreakAdapter::new(4096);
        let start = adapter.current_break();
        let grown = NonNull::new(unsafe { start.as_ptr().add(256) }).unwrap();
        adapter.set_break(grown).unwrap();
        assert_eq!(adapter.current_break(), grown);
    }

    #[test]
    fn mock_break_denies_growth_past_capacity() {
        let mut adapter = MockBreakAdapter::new(64);
        let start = adapter.current_break();
        let too_far = NonNull::new(unsafe { start.as_ptr().add(128) }).unwrap();
        assert_eq!(adapter.set_break(too_far), Err(BreakError::Denied));
    }
}

//! Address arithmetic and the byte/unit conversion shared by every heap
//! variant. All three engines measure chunks in units of a fixed size rather
//! than raw bytes, mirroring the allocator this crate is modeled on.

use core::ptr::NonNull;

/// A record sized and aligned like the largest header/footer layout in the
/// crate. Never constructed; it exists purely to pin down [`UNIT_SIZE`].
#[repr(C)]
pub(crate) struct UnitSlot {
    _a: usize,
    _b: usize,
    _c: usize,
}

/// Number of bytes in one addressing unit.
pub const UNIT_SIZE: usize = core::mem::size_of::<UnitSlot>();

static_assertions::const_assert!(UNIT_SIZE >= core::mem::size_of::<usize>() * 2);

/// Minimum number of units requested from the break adapter whenever the
/// heap needs to grow.
pub const MIN_UNITS_FROM_OS: usize = 512;

/// Minimum surplus, in units, that justifies splitting a chunk on allocation
/// in the tagged (V1/V2) engines.
pub const SPLIT_THRESHOLD: usize = 3;

/// Number of size-class bins in the V2 binned free-list index.
pub const BIN_COUNT: usize = 1024;

/// Convert a byte count requested by a caller into a unit count, rounding the
/// payload up to a whole number of units, adding `header_units` of bookkeeping
/// overhead, and enforcing `min_units` as a floor.
pub(crate) const fn bytes_to_units(bytes: usize, header_units: usize, min_units: usize) -> usize {
    let payload_units = (bytes + UNIT_SIZE - 1) / UNIT_SIZE;
    let units = payload_units + header_units;
    if units < min_units {
        min_units
    } else {
        units
    }
}

pub(crate) const fn units_to_bytes(units: usize) -> usize {
    units * UNIT_SIZE
}

/// A validated, non-null address somewhere in the managed heap arena. Plain
/// pointer arithmetic, wrapped so every offset is expressed in units rather
/// than bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Addr(NonNull<u8>);

impl Addr {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Addr(ptr)
    }

    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub(crate) fn as_nonnull(self) -> NonNull<u8> {
        self.0
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn unit_add(self, units: usize) -> Self {
        // SAFETY: callers only ever offset within an arena the adapter has
        // already committed, so the result never overflows the address space.
        let raw = unsafe { self.0.as_ptr().add(units_to_bytes(units)) };
        Addr(unsafe { NonNull::new_unchecked(raw) })
    }

    pub(crate) fn unit_sub(self, units: usize) -> Self {
        let raw = unsafe { self.0.as_ptr().sub(units_to_bytes(units)) };
        Addr(unsafe { NonNull::new_unchecked(raw) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes_to_units_rounds_up_and_adds_overhead() {
        assert_eq!(bytes_to_units(1, 2, 3), 3);
        assert_eq!(bytes_to_units(UNIT_SIZE, 2, 3), 1 + 2);
        assert_eq!(bytes_to_units(UNIT_SIZE + 1, 2, 3), 2 + 2);
    }

    #[test]
    fn bytes_to_units_enforces_minimum() {
        assert_eq!(bytes_to_units(1, 1, 2), 2);
    }

    #[test]
    fn addr_unit_add_and_sub_round_trip() {
        let mut buf = [0u8; 256];
        let base = Addr::new(NonNull::new(buf.as_mut_ptr()).unwrap());
        let moved = base.unit_add(5).unit_sub(5);
        assert_eq!(base, moved);
    }
}

//! Debug assertion macros for ring protocol invariants.
//!
//! Only active in debug builds (`debug_assert!`), so there is zero overhead
//! in release builds. The counters these check are owned half by the kernel,
//! so a violation means either a protocol bug here or a hostile counterpart —
//! both worth catching early in development.

/// Assert that a ring position is inside the ring.
///
/// **Invariant**: `pos < capacity`. Positions advance modulo the capacity,
/// so a position at or past it can only come from a corrupted counter.
macro_rules! debug_assert_pos_in_ring {
    ($pos:expr, $capacity:expr) => {
        debug_assert!(
            $pos < $capacity,
            "ring position {} outside ring of {} slots",
            $pos,
            $capacity
        )
    };
}

/// Assert that a ring is not being constructed degenerate.
///
/// **Invariant**: `capacity >= 2`. One slot is always sacrificed to tell
/// full from empty, so a one-slot ring can never carry a record.
macro_rules! debug_assert_usable_capacity {
    ($capacity:expr) => {
        debug_assert!(
            $capacity >= 2,
            "ring of {} slots cannot carry records",
            $capacity
        )
    };
}

pub(crate) use debug_assert_pos_in_ring;
pub(crate) use debug_assert_usable_capacity;

use crate::invariants::{debug_assert_pos_in_ring, debug_assert_usable_capacity};
use crate::Backoff;
use bytemuck::Pod;
use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Both rings are classic SPSC rings, with the twist that the counterpart is
// the kernel driver and the counters live in kernel-shared mappings:
//
// ## Command ring (kernel produces, worker consumes)
//
// - `tail` lives in the `cmdb` mapping; the kernel advances it with a
//   release store after filling the slot. We load it with Acquire, which
//   publishes the slot contents to us.
// - `head` is worker-private. The kernel never reads it (flow control is
//   credit-based through the UIO notification fds), so the initial value is
//   seeded from `cellc.cmdb_head` at attach time and advances locally.
//
// ## Ack ring (worker produces, kernel consumes)
//
// - `head` lives in the `cellc` mapping; the kernel advances it after
//   consuming an ack. We load it with Acquire to learn about freed slots.
// - `tail` lives in the `cmdb_ack` mapping and belongs to us: slot write
//   first, then a Release store of the advanced tail publishes the ack.
//
// ## Full/empty convention
//
// `head == tail` is empty; `head == (tail + 1) % capacity` is full for the
// producer. Positions are wrapped indices, not free-running sequence
// numbers, because that is the driver's convention for these regions.
//
// Slot memory is written/read between the fences with volatile accesses:
// the compiler must not invent, elide or tear accesses to memory the kernel
// writes concurrently.
//
// =============================================================================

/// Consumer side of the kernel→user command ring.
///
/// `T` is the command record type; it must be [`Pod`] because the slots are
/// raw shared memory.
pub struct Popper<T: Pod> {
    /// Consumer position. Worker-private, see the module banner.
    head: CachePadded<AtomicU32>,
    /// Producer position inside the `cmdb` mapping (kernel-written).
    tail: NonNull<AtomicU32>,
    /// First slot of the record array inside the `cmdb` mapping.
    slots: NonNull<T>,
    capacity: u32,
    _not_send: PhantomData<*const ()>,
}

impl<T: Pod> Popper<T> {
    /// Constructs a popper over a mapped command ring.
    ///
    /// # Safety
    ///
    /// - `tail` must point at the ring's producer counter and `slots` at an
    ///   array of at least `capacity` records, both inside a mapping that
    ///   **outlives** the popper; keep the mapping handle alongside it.
    /// - No other consumer may exist for this ring.
    /// - `head_init` must be the consumer position published by the driver
    ///   at attach time (`cellc.cmdb_head`).
    pub unsafe fn new(
        tail: NonNull<u32>,
        slots: NonNull<T>,
        capacity: u32,
        head_init: u32,
    ) -> Self {
        debug_assert_usable_capacity!(capacity);
        debug_assert_pos_in_ring!(head_init, capacity);
        Self {
            head: CachePadded::new(AtomicU32::new(head_init)),
            tail: tail.cast(),
            slots,
            capacity,
            _not_send: PhantomData,
        }
    }

    /// Ring capacity in records (one slot is sacrificed to the full/empty
    /// convention).
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pops one command record, or `None` if the ring is momentarily empty.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: `tail` points into the live mapping per the constructor
        // contract; the kernel writes it with release semantics.
        let tail = unsafe { self.tail.as_ref() }.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        debug_assert_pos_in_ring!(head, self.capacity);

        // SAFETY: `head != tail`, so the slot at `head` was fully written by
        // the kernel before its release store of `tail`; the Acquire load
        // above synchronizes with that store. Volatile because the memory is
        // shared with the kernel.
        let record = unsafe { self.slots.as_ptr().add(head as usize).read_volatile() };

        self.head
            .store((head + 1) % self.capacity, Ordering::Release);
        Some(record)
    }

    /// Pops one command record, spin-yielding while the ring is empty.
    ///
    /// Use only when a credit guarantees a record is in flight (the event
    /// loop has read a new-command count from the UIO fd); otherwise this
    /// spins until the kernel produces something.
    pub fn pop_spin(&self) -> T {
        let mut backoff = Backoff::new();
        loop {
            if let Some(record) = self.pop() {
                return record;
            }
            backoff.snooze();
        }
    }
}

/// Producer side of the user→kernel ack ring.
pub struct Pusher<T: Pod> {
    /// Consumer position inside the `cellc` mapping (kernel-written).
    head: NonNull<AtomicU32>,
    /// Producer position inside the `cmdb_ack` mapping (worker-written,
    /// kernel-read).
    tail: NonNull<AtomicU32>,
    /// First slot of the record array inside the `cmdb_ack` mapping.
    slots: NonNull<T>,
    capacity: u32,
    _not_send: PhantomData<*const ()>,
}

impl<T: Pod> Pusher<T> {
    /// Constructs a pusher over a mapped ack ring.
    ///
    /// # Safety
    ///
    /// - `head` must point at the kernel-owned consumer counter, `tail` at
    ///   the worker-owned producer counter, and `slots` at an array of at
    ///   least `capacity` records; all three must live inside mappings that
    ///   **outlive** the pusher.
    /// - No other producer may exist for this ring.
    pub unsafe fn new(
        head: NonNull<u32>,
        tail: NonNull<u32>,
        slots: NonNull<T>,
        capacity: u32,
    ) -> Self {
        debug_assert_usable_capacity!(capacity);
        Self {
            head: head.cast(),
            tail: tail.cast(),
            slots,
            capacity,
            _not_send: PhantomData,
        }
    }

    /// Ring capacity in records.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pushes one ack record. Returns `false` if the ring is full.
    pub fn push(&self, record: T) -> bool {
        // SAFETY: both counters point into live mappings per the constructor
        // contract. Our own tail has a single writer (us), Relaxed is enough
        // to read it back.
        let tail = unsafe { self.tail.as_ref() }.load(Ordering::Relaxed);
        let next = (tail + 1) % self.capacity;
        let head = unsafe { self.head.as_ref() }.load(Ordering::Acquire);
        if next == head {
            return false;
        }
        debug_assert_pos_in_ring!(tail, self.capacity);

        // SAFETY: the slot at `tail` is free: the kernel consumes strictly
        // before `head`, and `next != head` above. Volatile for the same
        // reason as in `Popper::pop`.
        unsafe { self.slots.as_ptr().add(tail as usize).write_volatile(record) };

        // Publishes the slot write to the kernel.
        unsafe { self.tail.as_ref() }.store(next, Ordering::Release);
        true
    }

    /// Pushes one ack record, spin-yielding while the ring is full.
    ///
    /// The ack ring has as many slots as there can be commands in flight, so
    /// fullness is transient by construction and waiting it out is safe.
    pub fn push_spin(&self, record: T) {
        let mut backoff = Backoff::new();
        while !self.push(record) {
            backoff.snooze();
        }
    }
}

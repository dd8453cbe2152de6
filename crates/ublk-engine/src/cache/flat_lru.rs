//! Flat approximate-LRU index: a sorted vector with a refcount surrogate
//! instead of a recency list.
//!
//! Each slot carries a `refs` counter; touching a slot increments every
//! *younger* counter (those strictly below the touched one) and zeroes the
//! touched slot. The relative order of all other slots is preserved, the
//! maximum counter marks the least-recently-used slot, and the whole index
//! stays one contiguous array, with no pointer chasing. Touch costs O(L),
//! which is the deliberate trade for small fixed capacities.
//!
//! Invalid slots keep their key (so the vector stays sorted without
//! shifting) and carry `refs == capacity`, which makes them preferential
//! eviction victims and excludes them from lookups.

use crate::buf::IoBuf;

struct Slot {
    key: u64,
    refs: usize,
    data: Option<IoBuf>,
}

/// Fixed-capacity mapping from chunk id to an owned chunk buffer with
/// approximate-LRU eviction.
pub struct FlatLru {
    len_max: usize,
    item_sz: usize,
    slots: Vec<Slot>,
}

impl FlatLru {
    /// Index of `len_max` items of `item_sz` bytes each.
    pub fn new(len_max: usize, item_sz: usize) -> Self {
        assert!(len_max > 0);
        assert!(item_sz > 0);
        Self {
            len_max,
            item_sz,
            slots: Vec::with_capacity(len_max),
        }
    }

    #[inline]
    pub fn len_max(&self) -> usize {
        self.len_max
    }

    #[inline]
    pub fn item_sz(&self) -> usize {
        self.item_sz
    }

    fn is_valid(&self, index: usize) -> bool {
        self.slots[index].refs != self.len_max
    }

    /// Binary search for `key`; the flag is set only for a *valid* exact hit.
    fn lower_bound_find(&self, key: u64) -> (usize, bool) {
        let index = self.slots.partition_point(|slot| slot.key < key);
        let exact =
            index < self.slots.len() && self.slots[index].key == key && self.is_valid(index);
        (index, exact)
    }

    /// Marks `index` most recently used.
    fn touch(&mut self, index: usize) {
        let pivot = self.slots[index].refs;
        for slot in &mut self.slots {
            if slot.refs < pivot {
                slot.refs += 1;
            }
        }
        self.slots[index].refs = 0;
    }

    /// The eviction victim: maximal `refs`, first invalid slot short-circuits,
    /// lowest index breaks ties.
    fn evict_index_find(&self) -> usize {
        let mut victim = 0;
        if self.is_valid(victim) {
            for index in 1..self.slots.len() {
                if self.slots[victim].refs < self.slots[index].refs {
                    victim = index;
                    if !self.is_valid(victim) {
                        break;
                    }
                }
            }
        }
        victim
    }

    /// Looks `key` up; a hit is touched and returns a view of the cached
    /// bytes.
    pub fn find(&mut self, key: u64) -> Option<IoBuf> {
        let (index, exact) = self.lower_bound_find(key);
        if !exact {
            return None;
        }
        self.touch(index);
        self.slots[index].data.clone()
    }

    /// `true` iff `key` maps to a valid slot. Does not touch.
    pub fn exists(&self, key: u64) -> bool {
        self.lower_bound_find(key).1
    }

    /// Installs `(key, data)`, touching the slot. Returns the displaced
    /// buffer: the previous value on an exact hit, or the evicted entry
    /// when the index was full.
    pub fn update(&mut self, key: u64, data: IoBuf) -> Option<(u64, IoBuf)> {
        debug_assert_eq!(data.len(), self.item_sz);
        let mut data = Some(data);

        let (mut index, exact) = self.lower_bound_find(key);
        let mut reuse_in_place = true;

        if !exact {
            if index >= self.slots.len() || self.is_valid(index) {
                if self.slots.len() >= self.len_max {
                    // Full: rotate the victim slot to the insertion point so
                    // the vector stays sorted without shifting everything.
                    let victim = self.evict_index_find();
                    if victim < index {
                        self.slots[victim..index].rotate_left(1);
                        index -= 1;
                    } else if victim > index {
                        self.slots[index..=victim].rotate_right(1);
                    }
                } else {
                    self.slots.insert(
                        index,
                        Slot {
                            key,
                            refs: self.len_max,
                            data: data.take(),
                        },
                    );
                    reuse_in_place = false;
                }
            }
            // Otherwise the slot at `index` is invalid: overwrite it in
            // place. Sort order holds because its key already sits between
            // the neighbours.
        }

        let displaced = if reuse_in_place {
            let slot = &mut self.slots[index];
            let old_key = std::mem::replace(&mut slot.key, key);
            let old_data = std::mem::replace(&mut slot.data, data.take());
            old_data.map(|buf| (old_key, buf))
        } else {
            None
        };

        self.touch(index);

        debug_assert!(self.slots.windows(2).all(|w| w[0].key < w[1].key));
        displaced
    }

    /// Logically removes `key`; the slot stays for ordering and is the
    /// preferred reuse target.
    pub fn invalidate(&mut self, key: u64) {
        if let (index, true) = self.lower_bound_find(key) {
            self.slots[index].refs = self.len_max;
            self.slots[index].data = None;
        }
    }

    /// Invalidates every key in the half-open range `[lo, hi)`.
    pub fn invalidate_range(&mut self, lo: u64, hi: u64) {
        debug_assert!(lo < hi);
        let first = self.slots.partition_point(|slot| slot.key < lo);
        let last = first + self.slots[first..].partition_point(|slot| slot.key < hi);
        for slot in &mut self.slots[first..last] {
            slot.refs = self.len_max;
            slot.data = None;
        }
    }

    #[cfg(test)]
    fn refs_of(&self, key: u64) -> Option<usize> {
        let index = self.slots.partition_point(|slot| slot.key < key);
        (index < self.slots.len() && self.slots[index].key == key)
            .then(|| self.slots[index].refs)
    }
}

//! Shared byte buffers for the request graph.
//!
//! Every query in the engine carries a view into some byte storage: the
//! kernel-shared cell arena, a pool chunk, a cache slot, or a plain heap
//! allocation. Subqueries slice their parent's view, caches hold whole-chunk
//! views, and parity paths read one region of a stripe buffer while writing
//! another. Views must therefore be cheap to clone, must keep their storage
//! alive, and cannot be expressed as borrowed slices.
//!
//! # Aliasing invariant
//!
//! The engine is single-threaded per device and completers run inline, so
//! accesses through overlapping views never race in time. What the type
//! system cannot see is *which* views overlap; the accessors therefore go
//! through raw pointers, and the code observes one rule: a slice obtained
//! from a view is used and dropped within the expression or statement that
//! obtained it, never held across a call back into the engine. All accessors
//! on [`IoBuf`] are shaped so this falls out naturally (copy in, copy out,
//! scoped closures).

use std::any::Any;
use std::ptr::NonNull;
use std::rc::Rc;

/// Keep-alive handle for the bytes an [`IoBuf`] points into.
///
/// The storage is only dropped when the last view over it goes away; pool
/// chunks use their storage's `Drop` to return themselves to the free list.
pub trait BufStorage: Any {}

struct HeapStorage {
    // Box address is stable; views hold raw pointers into it.
    mem: Box<[u8]>,
}

impl BufStorage for HeapStorage {}

/// Foreign storage: memory owned elsewhere (a kernel-shared mapping), kept
/// alive by an opaque owner handle.
struct ForeignStorage {
    _owner: Rc<dyn Any>,
}

impl BufStorage for ForeignStorage {}

/// A cheaply-cloneable view into reference-counted byte storage.
#[derive(Clone)]
pub struct IoBuf {
    storage: Rc<dyn BufStorage>,
    ptr: NonNull<u8>,
    len: usize,
}

impl IoBuf {
    /// Allocates `len` zeroed bytes on the heap and returns the whole-buffer
    /// view.
    pub fn alloc(len: usize) -> Self {
        Self::from_boxed(vec![0u8; len].into_boxed_slice())
    }

    /// Wraps an owned allocation.
    pub fn from_boxed(mem: Box<[u8]>) -> Self {
        let len = mem.len();
        let storage = Rc::new(HeapStorage { mem });
        // Pointer taken after the box has its final address inside the Rc.
        let ptr = NonNull::new(storage.mem.as_ptr().cast_mut()).expect("box is non-null");
        Self { storage, ptr, len }
    }

    /// Wraps a vector (tests and one-off staging buffers).
    pub fn from_vec(mem: Vec<u8>) -> Self {
        Self::from_boxed(mem.into_boxed_slice())
    }

    /// Builds a view over memory owned elsewhere.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and writable for as long as `owner`
    /// (or any clone of a view made from this one) is alive, and must not be
    /// freed by anything other than `owner`'s drop.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, owner: Rc<dyn Any>) -> Self {
        Self {
            storage: Rc::new(ForeignStorage { _owner: owner }),
            ptr,
            len,
        }
    }

    /// Builds a view from custom storage exposing its bytes at `ptr`.
    pub(crate) fn from_storage(storage: Rc<dyn BufStorage>, ptr: NonNull<u8>, len: usize) -> Self {
        Self { storage, ptr, len }
    }

    /// View length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-view of `len` bytes starting at `off`. Panics when the range
    /// escapes this view.
    pub fn slice(&self, off: usize, len: usize) -> Self {
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.len),
            "slice [{off}, +{len}) escapes buffer of {}",
            self.len
        );
        // SAFETY: in-bounds offset of a live allocation.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(off)) };
        Self {
            storage: Rc::clone(&self.storage),
            ptr,
            len,
        }
    }

    /// Runs `f` over the view's bytes.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        // SAFETY: live storage; see the module aliasing invariant.
        f(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) })
    }

    /// Runs `f` over the view's bytes mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        // SAFETY: live storage; see the module aliasing invariant.
        f(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Copies the whole view out into `dst`. Lengths must match.
    pub fn copy_to(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.len);
        self.with(|src| dst.copy_from_slice(src));
    }

    /// Copies `src` over the whole view. Lengths must match.
    pub fn copy_from(&self, src: &[u8]) {
        assert_eq!(src.len(), self.len);
        self.with_mut(|dst| dst.copy_from_slice(src));
    }

    /// Copies another view of the same length over this one.
    pub fn copy_from_buf(&self, src: &IoBuf) {
        assert_eq!(src.len, self.len);
        // SAFETY: both views are live; `copy` tolerates overlap.
        unsafe {
            std::ptr::copy(src.ptr.as_ptr(), self.ptr.as_ptr(), self.len);
        }
    }

    /// Zeroes the view.
    pub fn fill_zero(&self) {
        self.with_mut(|dst| dst.fill(0));
    }

    /// Snapshot of the view's bytes (test helper, and staging copies).
    pub fn to_vec(&self) -> Vec<u8> {
        self.with(<[u8]>::to_vec)
    }

    /// `true` when both views window the same storage allocation.
    pub fn same_storage(&self, other: &IoBuf) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }
}

impl std::fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_views_share_storage() {
        let buf = IoBuf::from_vec((0..32u8).collect());
        let head = buf.slice(0, 16);
        let tail = buf.slice(16, 16);
        assert!(head.same_storage(&tail));
        assert_eq!(head.to_vec(), (0..16u8).collect::<Vec<_>>());
        assert_eq!(tail.to_vec(), (16..32u8).collect::<Vec<_>>());
    }

    #[test]
    fn writes_through_a_view_are_seen_by_siblings() {
        let buf = IoBuf::alloc(8);
        let view = buf.slice(4, 4);
        view.copy_from(&[1, 2, 3, 4]);
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn storage_outlives_the_original_handle() {
        let view = {
            let buf = IoBuf::from_vec(vec![7; 16]);
            buf.slice(8, 8)
        };
        assert_eq!(view.to_vec(), vec![7; 8]);
    }

    #[test]
    #[should_panic(expected = "escapes buffer")]
    fn out_of_bounds_slice_panics() {
        let buf = IoBuf::alloc(8);
        let _ = buf.slice(4, 8);
    }

    #[test]
    fn copy_from_buf_between_allocations() {
        let a = IoBuf::from_vec(vec![9; 8]);
        let b = IoBuf::alloc(8);
        b.copy_from_buf(&a);
        assert_eq!(b.to_vec(), vec![9; 8]);
    }
}

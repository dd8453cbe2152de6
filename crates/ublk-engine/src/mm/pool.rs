//! Fixed-size chunk pool with a LIFO free list.
//!
//! Chunks are handed out as [`IoBuf`]s; when the last view over a chunk
//! drops, the chunk pushes itself back onto the pool's free list instead of
//! returning to the system. The pool therefore never shrinks: memory is
//! retired only when the pool itself (and every outstanding chunk) is gone.
//!
//! Allocation strategy, chosen once at construction:
//! - below the page size: aligned, zeroed heap allocation;
//! - at 2 MiB and above: anonymous private mapping with an explicit 2 MiB
//!   huge-page request, silently retried without the request when no huge
//!   pages are available;
//! - in between: plain anonymous private mapping.

use crate::buf::{BufStorage, IoBuf};
use crate::mm::page_size;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

const HUGEPAGE_SZ: usize = 2 * 1024 * 1024;
const MAP_HUGE_2MB: libc::c_int = 21 << libc::MAP_HUGE_SHIFT;

/// One allocation owned by the pool machinery.
pub struct RawChunk {
    ptr: NonNull<u8>,
    len: usize,
    kind: ChunkKind,
}

enum ChunkKind {
    Heap { layout: Layout },
    Mapped,
}

impl RawChunk {
    /// Zeroed heap allocation with the given alignment.
    pub fn heap(len: usize, align: usize) -> Self {
        let align = align.max(std::mem::align_of::<libc::max_align_t>());
        let layout = Layout::from_size_align(len, align).expect("chunk layout");
        // SAFETY: non-zero size, valid layout.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self {
            ptr,
            len,
            kind: ChunkKind::Heap { layout },
        }
    }

    /// Anonymous private mapping; `huge` asks for 2 MiB pages.
    fn mapped(len: usize, huge: bool) -> Option<Self> {
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | if huge { libc::MAP_HUGETLB | MAP_HUGE_2MB } else { 0 };
        // SAFETY: anonymous mapping, no fd involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
            kind: ChunkKind::Mapped,
        })
    }

    fn release(self) {
        match self.kind {
            // SAFETY: allocated with exactly this layout in `heap`.
            ChunkKind::Heap { layout } => unsafe { dealloc(self.ptr.as_ptr(), layout) },
            // SAFETY: a live mapping of exactly this length.
            ChunkKind::Mapped => unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            },
        }
    }
}

/// Allocation source used when the free list is empty.
pub(crate) type Generator = Box<dyn Fn() -> RawChunk>;

fn bytes_generator(alignment: usize, chunk_sz: usize) -> Generator {
    if chunk_sz < page_size() {
        Box::new(move || RawChunk::heap(chunk_sz, alignment))
    } else if chunk_sz >= HUGEPAGE_SZ {
        Box::new(move || {
            // The huge-page request is a hint: retry without it rather than
            // surfacing an error.
            RawChunk::mapped(chunk_sz, true)
                .or_else(|| RawChunk::mapped(chunk_sz, false))
                .expect("anonymous mapping failed")
        })
    } else {
        Box::new(move || RawChunk::mapped(chunk_sz, false).expect("anonymous mapping failed"))
    }
}

struct PoolInner {
    chunk_sz: usize,
    generator: Generator,
    free: RefCell<Vec<RawChunk>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for chunk in self.free.get_mut().drain(..) {
            chunk.release();
        }
    }
}

/// Per-target pool of fixed-size aligned buffers.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Rc<PoolInner>,
}

/// Storage of a checked-out chunk: returns itself to the pool on final drop,
/// or to the system if the pool is already gone.
struct ChunkStorage {
    chunk: Option<RawChunk>,
    pool: Weak<PoolInner>,
}

impl BufStorage for ChunkStorage {}

impl Drop for ChunkStorage {
    fn drop(&mut self) {
        let chunk = self.chunk.take().expect("chunk present until drop");
        match self.pool.upgrade() {
            Some(pool) => pool.free.borrow_mut().push(chunk),
            None => chunk.release(),
        }
    }
}

impl ChunkPool {
    /// Pool of `chunk_sz`-byte buffers with at least `alignment` alignment.
    pub fn new(alignment: usize, chunk_sz: usize) -> Self {
        assert!(alignment.is_power_of_two());
        assert!(chunk_sz > 0);
        Self::with_generator(chunk_sz, bytes_generator(alignment, chunk_sz))
    }

    /// Pool with a caller-supplied allocation source.
    pub fn with_generator(chunk_sz: usize, generator: Generator) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                chunk_sz,
                generator,
                free: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Chunk size in bytes.
    #[inline]
    pub fn chunk_sz(&self) -> usize {
        self.inner.chunk_sz
    }

    /// Number of chunks currently parked on the free list.
    pub fn free_chunks(&self) -> usize {
        self.inner.free.borrow().len()
    }

    /// Checks a chunk out: pops the free list, or allocates a fresh one.
    pub fn get(&self) -> IoBuf {
        let chunk = self
            .inner
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| (self.inner.generator)());
        let ptr = chunk.ptr;
        let len = chunk.len;
        let storage = Rc::new(ChunkStorage {
            chunk: Some(chunk),
            pool: Rc::downgrade(&self.inner),
        });
        IoBuf::from_storage(storage, ptr, len)
    }
}

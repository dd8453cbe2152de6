//! Memory management: aligned chunk allocation and the per-target pool.

mod pool;

pub use pool::{ChunkPool, RawChunk};

use std::sync::OnceLock;

/// Cached system page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf is always safe to call.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(sz).expect("page size")
    })
}

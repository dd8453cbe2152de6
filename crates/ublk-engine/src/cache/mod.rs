//! Read-through chunk caching over a wrapped handler.
//!
//! Two variants share one read path and one index:
//!
//! - [`RwiHandler`], write-invalidate: writes go straight to the leaf and
//!   knock the covered chunks out of the cache;
//! - [`RwtHandler`], write-through: writes populate the cache and are
//!   serialized per chunk, at most one leaf-facing write per chunk at a
//!   time.
//!
//! The read path coalesces concurrent misses per chunk under a read bit:
//! the first miss issues one chunk-sized leaf read, later arrivals park on
//! a pending list and are filled from that read's buffer when it lands.

mod flat_lru;
mod rwi;
mod rwt;

pub use flat_lru::FlatLru;
pub use rwi::RwiHandler;
pub use rwt::RwtHandler;

use crate::buf::IoBuf;
use crate::bitset::RwBitSemaphore;
use crate::error::IoResult;
use crate::handler::RwHandler;
use crate::mm::ChunkPool;
use crate::query::ReadQuery;
use crate::SECTOR_SZ;
use std::cell::RefCell;
use std::rc::Rc;

/// Wraps `inner` with a chunk cache of `cache_len` chunks of `chunk_sz`
/// bytes; `write_through` selects [`RwtHandler`] over [`RwiHandler`].
pub fn cached(
    inner: Rc<dyn RwHandler>,
    cache_len: usize,
    chunk_sz: usize,
    write_through: bool,
) -> Rc<dyn RwHandler> {
    let cache = FlatLru::new(cache_len, chunk_sz);
    let pool = ChunkPool::new(SECTOR_SZ as usize, chunk_sz);
    if write_through {
        Rc::new(RwtHandler::new(cache, pool, inner))
    } else {
        Rc::new(RwiHandler::new(cache, pool, inner))
    }
}

/// A read piece that arrived while its chunk was already being fetched.
struct PendingRead {
    chunk_id: u64,
    chunk_off: usize,
    dst: IoBuf,
    rq: Rc<ReadQuery>,
}

/// State shared by both cache variants: the index, the chunk pool, the
/// per-chunk read/write bits and the parked read pieces.
pub(crate) struct CacheCore {
    cache: RefCell<FlatLru>,
    pool: ChunkPool,
    locks: RefCell<RwBitSemaphore>,
    pending_reads: RefCell<Vec<PendingRead>>,
}

impl CacheCore {
    fn new(cache: FlatLru, pool: ChunkPool) -> Self {
        debug_assert_eq!(cache.item_sz(), pool.chunk_sz());
        Self {
            cache: RefCell::new(cache),
            pool,
            locks: RefCell::new(RwBitSemaphore::new()),
            pending_reads: RefCell::new(Vec::new()),
        }
    }

    fn item_sz(&self) -> u64 {
        self.cache.borrow().item_sz() as u64
    }

    /// The shared read path: split per chunk, serve hits from the index,
    /// coalesce misses under the chunk's read bit.
    fn submit_read(
        self: &Rc<Self>,
        inner: &Rc<dyn RwHandler>,
        rq: Rc<ReadQuery>,
    ) -> IoResult {
        let item_sz = self.item_sz();
        let total = rq.buf().len();

        self.locks
            .borrow_mut()
            .extend((rq.offset() + total as u64).div_ceil(item_sz) as usize);

        let mut chunk_id = rq.offset() / item_sz;
        let mut chunk_off = (rq.offset() % item_sz) as usize;
        let mut rb = 0usize;

        while rb < total {
            let piece_len = ((item_sz as usize) - chunk_off).min(total - rb);
            let dst = rq.buf().slice(rb, piece_len);

            let cached = self.cache.borrow_mut().find(chunk_id);
            if let Some(chunk) = cached {
                dst.copy_from_buf(&chunk.slice(chunk_off, piece_len));
            } else if self.locks.borrow_mut().try_read_lock(chunk_id as usize) {
                let chunk_buf = self.pool.get();
                let chunk_rq = ReadQuery::with_completer(chunk_buf.clone(), chunk_id * item_sz, {
                    let core = Rc::clone(self);
                    let rq = Rc::clone(&rq);
                    move |chunk_rq| {
                        core.chunk_read_done(chunk_id, chunk_off, &dst, &rq, &chunk_buf, chunk_rq);
                    }
                });
                inner.submit_read(chunk_rq)?;
            } else {
                // Another read of this chunk is in flight; park the piece.
                self.pending_reads.borrow_mut().push(PendingRead {
                    chunk_id,
                    chunk_off,
                    dst,
                    rq: Rc::clone(&rq),
                });
            }

            chunk_id += 1;
            chunk_off = 0;
            rb += piece_len;
        }

        Ok(())
    }

    /// Completer of the one in-flight read per chunk: fill the initiator,
    /// install the chunk, fill everything that parked meanwhile, release
    /// the read bit. Parked readers observe the error as well; they must
    /// complete either way.
    fn chunk_read_done(
        &self,
        chunk_id: u64,
        chunk_off: usize,
        dst: &IoBuf,
        rq: &Rc<ReadQuery>,
        chunk_buf: &IoBuf,
        chunk_rq: &ReadQuery,
    ) {
        let result = chunk_rq.err();
        match result {
            None => {
                dst.copy_from_buf(&chunk_buf.slice(chunk_off, dst.len()));
                let mut cache = self.cache.borrow_mut();
                if !cache.exists(chunk_id) {
                    cache.update(chunk_id, chunk_buf.clone());
                }
            }
            Some(err) => rq.set_err(err),
        }

        let parked: Vec<PendingRead> = {
            let mut pending = self.pending_reads.borrow_mut();
            let mut parked = Vec::new();
            let mut index = 0;
            while index < pending.len() {
                if pending[index].chunk_id == chunk_id {
                    parked.push(pending.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            parked
        };
        for piece in parked {
            match result {
                None => piece
                    .dst
                    .copy_from_buf(&chunk_buf.slice(piece.chunk_off, piece.dst.len())),
                Some(err) => piece.rq.set_err(err),
            }
        }

        self.locks.borrow_mut().read_unlock(chunk_id as usize);
    }
}

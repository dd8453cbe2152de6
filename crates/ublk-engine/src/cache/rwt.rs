//! Read-through, write-through cache variant with per-chunk write
//! serialization.

use crate::cache::{CacheCore, FlatLru};
use crate::error::IoResult;
use crate::handler::RwHandler;
use crate::mm::ChunkPool;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Write-through: every write populates the cache and goes to the leaf, and
/// writes are serialized per chunk: at most one leaf-facing write per chunk
/// is in flight, later ones park on a FIFO and are resubmitted by the
/// current holder's completer.
pub struct RwtHandler {
    state: Rc<RwtState>,
}

struct RwtState {
    core: Rc<CacheCore>,
    inner: Rc<dyn RwHandler>,
    /// Sub-writes that arrived while their chunk's write bit was held.
    pending: RefCell<Vec<(u64, Rc<WriteQuery>)>>,
    /// Chunks whose serialization chain is ready to advance.
    agenda: RefCell<VecDeque<u64>>,
    draining: Cell<bool>,
}

impl RwtHandler {
    pub fn new(cache: FlatLru, pool: ChunkPool, inner: Rc<dyn RwHandler>) -> Self {
        Self {
            state: Rc::new(RwtState {
                core: Rc::new(CacheCore::new(cache, pool)),
                inner,
                pending: RefCell::new(Vec::new()),
                agenda: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
            }),
        }
    }
}

impl RwHandler for RwtHandler {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        self.state.core.submit_read(&self.state.inner, rq)
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        self.state.submit_write(wq)
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        self.state.inner.submit_flush(fq)
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        self.state.inner.submit_discard(dq)
    }
}

impl RwtState {
    fn submit_write(self: &Rc<Self>, wq: Rc<WriteQuery>) -> IoResult {
        let item_sz = self.core.item_sz();
        let total = wq.buf().len();

        self.core
            .locks
            .borrow_mut()
            .extend((wq.offset() + total as u64).div_ceil(item_sz) as usize);

        let mut chunk_id = wq.offset() / item_sz;
        let mut chunk_off = (wq.offset() % item_sz) as usize;
        let mut wb = 0usize;

        while wb < total {
            let piece_len = ((item_sz as usize) - chunk_off).min(total - wb);

            let chunk_wq = wq.subquery(wb, piece_len, wq.offset() + wb as u64, {
                let state = Rc::clone(self);
                let parent = Rc::clone(&wq);
                move |chunk_wq| {
                    if let Some(err) = chunk_wq.err() {
                        state.core.cache.borrow_mut().invalidate(chunk_id);
                        parent.set_err(err);
                    }
                    state.continue_chunk(chunk_id);
                }
            });

            if self.core.locks.borrow_mut().try_write_lock(chunk_id as usize) {
                self.process(chunk_wq)?;
            } else {
                self.pending.borrow_mut().push((chunk_id, chunk_wq));
            }

            chunk_id += 1;
            chunk_off = 0;
            wb += piece_len;
        }

        Ok(())
    }

    /// Runs one sub-write that holds its chunk's write bit.
    fn process(self: &Rc<Self>, wq: Rc<WriteQuery>) -> IoResult {
        let item_sz = self.core.item_sz();
        let chunk_id = wq.offset() / item_sz;
        let chunk_off = (wq.offset() % item_sz) as usize;
        let len = wq.buf().len();

        if len >= item_sz as usize {
            // Full-chunk write: the payload becomes the new cached chunk.
            debug_assert_eq!(chunk_off, 0);
            debug_assert_eq!(len, item_sz as usize);
            let chunk = self.core.pool.get();
            chunk.copy_from_buf(wq.buf());
            self.core.cache.borrow_mut().update(chunk_id, chunk);
            return self.forward(chunk_id, wq);
        }

        let cached = self.core.cache.borrow_mut().find(chunk_id);
        if let Some(chunk) = cached {
            // Partial write into a cached chunk: patch in place, pass through.
            chunk.slice(chunk_off, len).copy_from_buf(wq.buf());
            return self.forward(chunk_id, wq);
        }

        // Partial write into an uncached chunk: read-modify-write.
        let chunk = self.core.pool.get();
        let rmw_rq = ReadQuery::with_completer(chunk.clone(), chunk_id * item_sz, {
            let state = Rc::clone(self);
            move |rmw_rq| {
                if let Some(err) = rmw_rq.err() {
                    // Dropping `wq` runs its serialization completer, which
                    // invalidates the chunk and advances the chain.
                    wq.set_err(err);
                    return;
                }
                chunk.slice(chunk_off, len).copy_from_buf(wq.buf());
                state.core.cache.borrow_mut().update(chunk_id, chunk.clone());
                let _ = state.forward(chunk_id, wq);
            }
        });
        self.inner.submit_read(rmw_rq)
    }

    fn forward(&self, chunk_id: u64, wq: Rc<WriteQuery>) -> IoResult {
        let res = self.inner.submit_write(wq);
        if res.is_err() {
            self.core.cache.borrow_mut().invalidate(chunk_id);
        }
        res
    }

    /// Advances the serialization chain of `chunk_id`: resubmit the next
    /// parked write, or release the write bit.
    ///
    /// A flat agenda loop instead of recursion: leaves that complete inline
    /// re-enter this function from inside `process`, and a long parked chain
    /// must not become a call chain.
    fn continue_chunk(self: &Rc<Self>, chunk_id: u64) {
        self.agenda.borrow_mut().push_back(chunk_id);
        if self.draining.get() {
            return;
        }
        self.draining.set(true);
        loop {
            let Some(cid) = self.agenda.borrow_mut().pop_front() else {
                break;
            };
            let next = {
                let mut pending = self.pending.borrow_mut();
                pending
                    .iter()
                    .position(|(id, _)| *id == cid)
                    .map(|index| pending.remove(index).1)
            };
            match next {
                Some(wq) => {
                    // Errors ride the query's completer; nothing to do here.
                    let _ = self.process(wq);
                }
                None => self.core.locks.borrow_mut().write_unlock(cid as usize),
            }
        }
        self.draining.set(false);
    }
}

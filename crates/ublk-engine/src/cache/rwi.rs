//! Read-through, write-invalidate cache variant.

use crate::cache::{CacheCore, FlatLru};
use crate::error::IoResult;
use crate::handler::RwHandler;
use crate::mm::ChunkPool;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::rc::Rc;

/// Write-invalidate: the write is forwarded to the leaf in one piece and the
/// covered chunk range is invalidated when it completes, unconditionally,
/// so a partially-applied leaf write can never leave stale chunks behind.
pub struct RwiHandler {
    core: Rc<CacheCore>,
    inner: Rc<dyn RwHandler>,
}

impl RwiHandler {
    pub fn new(cache: FlatLru, pool: ChunkPool, inner: Rc<dyn RwHandler>) -> Self {
        Self {
            core: Rc::new(CacheCore::new(cache, pool)),
            inner,
        }
    }
}

impl RwHandler for RwiHandler {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        self.core.submit_read(&self.inner, rq)
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        let item_sz = self.core.item_sz();
        let chunk_lo = wq.offset() / item_sz;
        let chunk_hi = (wq.offset() + wq.buf().len() as u64).div_ceil(item_sz);

        let len = wq.buf().len();
        let offset = wq.offset();
        let forwarded = wq.subquery(0, len, offset, {
            let core = Rc::clone(&self.core);
            let wq = Rc::clone(&wq);
            move |leaf_wq| {
                core.cache.borrow_mut().invalidate_range(chunk_lo, chunk_hi);
                if let Some(err) = leaf_wq.err() {
                    wq.set_err(err);
                }
            }
        });
        self.inner.submit_write(forwarded)
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        self.inner.submit_flush(fq)
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        self.inner.submit_discard(dq)
    }
}

//! The parity write acceptor: per-stripe serialization, RMW or full-stripe
//! writes, parity computation and coherence bookkeeping.
//!
//! Every stripe-touching write holds the stripe's lock bit from submission
//! until its terminal completer has run; writes that find the bit taken park
//! on a FIFO and are resubmitted by the current holder. A stripe's
//! coherence bit says its on-leaf parity strip equals the XOR of its data
//! strips; the bit is cleared on every failure path and set again only by a
//! write that recomputed parity in full.
//!
//! Three write shapes:
//! - **full stripe**: parity is the XOR of the payload, one write per leaf;
//! - **partial, coherent**: read the overwritten slice and the parity
//!   strip, fold `old ^ new` into the parity window, write both back
//!   (touches `2·strip + len` bytes instead of the whole stripe);
//! - **partial, incoherent**: read the whole data portion, overlay the
//!   payload, recompute parity from scratch, write payload and parity.

use crate::bitset::{BitLocker, DynBitset};
use crate::buf::IoBuf;
use crate::error::IoResult;
use crate::handler::RwHandler;
use crate::mm::ChunkPool;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use crate::raidsp::backend::{Backend, ParityMap};
use crate::raidsp::parity;
use crate::SECTOR_SZ;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub struct Acceptor {
    state: Rc<AcceptorState>,
}

struct AcceptorState {
    be: Backend,
    locks: RefCell<BitLocker>,
    coherence: RefCell<DynBitset>,
    /// Whole-stripe staging buffers (data strips + parity strip).
    stripe_pool: ChunkPool,
    /// Parity-strip staging buffers for full-stripe writes.
    parity_pool: ChunkPool,
    /// Stripe sub-writes that arrived while their stripe was locked.
    pending: RefCell<Vec<(u64, Rc<WriteQuery>)>>,
    /// Stripes whose serialization chain is ready to advance.
    agenda: RefCell<VecDeque<u64>>,
    draining: Cell<bool>,
}

impl Acceptor {
    pub fn new(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>, parity_map: ParityMap) -> Self {
        let be = Backend::new(strip_sz, hs, parity_map);
        let stripe_sz = be.cfg().stripe_sz as usize;
        Self {
            state: Rc::new(AcceptorState {
                be,
                locks: RefCell::new(BitLocker::new()),
                coherence: RefCell::new(DynBitset::new()),
                stripe_pool: ChunkPool::new(SECTOR_SZ as usize, stripe_sz),
                parity_pool: ChunkPool::new(SECTOR_SZ as usize, strip_sz as usize),
                pending: RefCell::new(Vec::new()),
                agenda: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
            }),
        }
    }

    /// `true` iff the on-leaf parity of `stripe_id` is known to match its
    /// data strips.
    pub fn is_stripe_parity_coherent(&self, stripe_id: u64) -> bool {
        let coherence = self.state.coherence.borrow();
        (stripe_id as usize) < coherence.len() && coherence.get(stripe_id as usize)
    }
}

impl RwHandler for Acceptor {
    /// Reads bypass parity entirely: translate into the data-skip-parity
    /// view and fan out.
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        let sds = self.state.be.cfg().stripe_data_sz;
        let len = rq.buf().len();
        let sub = rq.chained(0, len, rq.offset() % sds);
        self.state.be.data_read(rq.offset() / sds, sub)
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        self.state.submit_write(wq)
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        self.state.be.flush(&fq)
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        dq.set_err(crate::error::IoError::Unsupported);
        Err(crate::error::IoError::Unsupported)
    }
}

impl AcceptorState {
    fn submit_write(self: &Rc<Self>, wq: Rc<WriteQuery>) -> IoResult {
        assert!(!wq.buf().is_empty());
        let sds = self.be.cfg().stripe_data_sz;
        let total = wq.buf().len();

        let stripes = (wq.offset() + total as u64).div_ceil(sds) as usize;
        self.locks.borrow_mut().extend(stripes);
        self.coherence.borrow_mut().extend(stripes);

        let mut stripe_id = wq.offset() / sds;
        let mut stripe_off = wq.offset() % sds;
        let mut wb = 0usize;

        while wb < total {
            let piece_len = ((sds - stripe_off) as usize).min(total - wb);

            // The sub-write is stripe-relative; its completer advances the
            // stripe's serialization chain.
            let sub = wq.subquery(wb, piece_len, stripe_off, {
                let state = Rc::clone(self);
                let parent = Rc::clone(&wq);
                move |sub| {
                    if let Some(err) = sub.err() {
                        parent.set_err(err);
                    }
                    state.continue_stripe(stripe_id);
                }
            });

            if self.locks.borrow_mut().try_lock(stripe_id as usize) {
                self.process_stripe(stripe_id, sub)?;
            } else {
                self.pending.borrow_mut().push((stripe_id, sub));
            }

            stripe_id += 1;
            stripe_off = 0;
            wb += piece_len;
        }

        Ok(())
    }

    /// Runs one stripe sub-write that holds its stripe's lock bit.
    /// `wq.offset()` is relative to the stripe's data portion.
    fn process_stripe(self: &Rc<Self>, stripe_id: u64, wq: Rc<WriteQuery>) -> IoResult {
        let cfg = *self.be.cfg();
        debug_assert!(wq.offset() + wq.buf().len() as u64 <= cfg.stripe_data_sz);

        if wq.buf().len() as u64 == cfg.stripe_data_sz {
            debug_assert_eq!(wq.offset(), 0);
            return self.full_stripe_write(stripe_id, wq);
        }

        if self.coherence.borrow().get(stripe_id as usize) {
            self.partial_coherent_write(stripe_id, wq)
        } else {
            self.partial_incoherent_write(stripe_id, wq)
        }
    }

    /// Full-stripe write: parity is the XOR of the payload strips.
    fn full_stripe_write(self: &Rc<Self>, stripe_id: u64, wq: Rc<WriteQuery>) -> IoResult {
        let parity_buf = self.parity_pool.get();
        parity::parity_renew(wq.buf(), &parity_buf);

        let wqp = WriteQuery::with_completer(parity_buf.clone(), 0, {
            let wq = Rc::clone(&wq);
            move |p| {
                if let Some(err) = p.err() {
                    wq.set_err(err);
                }
            }
        });

        self.stripe_write_dispatch(stripe_id, wq, wqp)
    }

    /// Fast RMW: the stripe's parity is coherent, so the new parity is
    /// `old_parity ^ (old_data ^ new_data)` over the overwritten window.
    fn partial_coherent_write(self: &Rc<Self>, stripe_id: u64, wq: Rc<WriteQuery>) -> IoResult {
        let cfg = *self.be.cfg();
        let stripe_buf = self.stripe_pool.get();
        let old_slice = stripe_buf
            .slice(0, cfg.stripe_data_sz as usize)
            .slice(wq.offset() as usize, wq.buf().len());
        let parity_view = stripe_buf.slice(cfg.stripe_data_sz as usize, cfg.strip_sz as usize);

        let wq_offset = wq.offset();
        let rqd = ReadQuery::with_completer(old_slice.clone(), wq_offset, {
            let state = Rc::clone(self);
            move |rqd| {
                if let Some(err) = rqd.err() {
                    wq.set_err(err);
                    return;
                }
                state.coherent_parity_phase(stripe_id, wq, old_slice, parity_view);
            }
        });
        self.be.data_read(stripe_id, rqd)
    }

    /// Second phase of the fast RMW: the old data slice has landed; read the
    /// parity strip, fold the delta in, write both back.
    fn coherent_parity_phase(
        self: &Rc<Self>,
        stripe_id: u64,
        wq: Rc<WriteQuery>,
        old_slice: IoBuf,
        parity_view: IoBuf,
    ) {
        let strip_sz = self.be.cfg().strip_sz;
        let rqp = ReadQuery::with_completer(parity_view.clone(), 0, {
            let state = Rc::clone(self);
            move |rqp| {
                if let Some(err) = rqp.err() {
                    wq.set_err(err);
                    return;
                }

                // old_slice := old ^ new, then fold the delta into the
                // parity window at the data offset modulo the strip size.
                parity::xor_into(wq.buf(), &old_slice);
                parity::parity_to(&old_slice, &parity_view, (wq.offset() % strip_sz) as usize);

                let wqp = WriteQuery::with_completer(parity_view.clone(), 0, {
                    let wq = Rc::clone(&wq);
                    move |p| {
                        if let Some(err) = p.err() {
                            wq.set_err(err);
                        }
                    }
                });
                let _ = state.coherent_stripe_write(stripe_id, wq, wqp);
            }
        });
        // A synchronous rejection reaches `wq` through the query chain.
        let _ = self.be.parity_read(stripe_id, rqp);
    }

    /// Repair path: the parity strip cannot be trusted, so rebuild it from
    /// the whole data portion with the payload overlaid.
    fn partial_incoherent_write(self: &Rc<Self>, stripe_id: u64, wq: Rc<WriteQuery>) -> IoResult {
        let cfg = *self.be.cfg();
        let stripe_buf = self.stripe_pool.get();
        let data_view = stripe_buf.slice(0, cfg.stripe_data_sz as usize);
        let parity_view = stripe_buf.slice(cfg.stripe_data_sz as usize, cfg.strip_sz as usize);

        let rqd = ReadQuery::with_completer(data_view.clone(), 0, {
            let state = Rc::clone(self);
            move |rqd| {
                if let Some(err) = rqd.err() {
                    wq.set_err(err);
                    return;
                }

                data_view
                    .slice(wq.offset() as usize, wq.buf().len())
                    .copy_from_buf(wq.buf());
                parity::parity_renew(&data_view, &parity_view);

                let new_wqd = WriteQuery::with_completer(wq.buf().clone(), wq.offset(), {
                    let wq = Rc::clone(&wq);
                    move |q| {
                        if let Some(err) = q.err() {
                            wq.set_err(err);
                        }
                    }
                });
                let new_wqp = WriteQuery::with_completer(parity_view.clone(), 0, {
                    let wq = Rc::clone(&wq);
                    move |q| {
                        if let Some(err) = q.err() {
                            wq.set_err(err);
                        }
                    }
                });
                let _ = state.incoherent_stripe_write(stripe_id, new_wqd, new_wqp);
            }
        });
        self.be.data_read(stripe_id, rqd)
    }

    fn stripe_write_dispatch(
        self: &Rc<Self>,
        stripe_id: u64,
        wqd: Rc<WriteQuery>,
        wqp: Rc<WriteQuery>,
    ) -> IoResult {
        if self.coherence.borrow().get(stripe_id as usize) {
            self.coherent_stripe_write(stripe_id, wqd, wqp)
        } else {
            self.incoherent_stripe_write(stripe_id, wqd, wqp)
        }
    }

    /// Submits a write that preserves coherence by construction; any leaf
    /// error clears the stripe's bit.
    fn coherent_stripe_write(
        self: &Rc<Self>,
        stripe_id: u64,
        wqd: Rc<WriteQuery>,
        wqp: Rc<WriteQuery>,
    ) -> IoResult {
        let wrap = |q: &Rc<WriteQuery>| {
            let state = Rc::clone(self);
            let parent = Rc::clone(q);
            WriteQuery::with_completer(q.buf().clone(), q.offset(), move |done| {
                if let Some(err) = done.err() {
                    parent.set_err(err);
                    state.coherence.borrow_mut().set(stripe_id as usize, false);
                }
            })
        };
        let new_wqd = wrap(&wqd);
        let new_wqp = wrap(&wqp);
        drop((wqd, wqp));
        self.be.stripe_write(stripe_id, new_wqd, new_wqp)
    }

    /// Submits a write that recomputed parity in full; the stripe becomes
    /// coherent iff both the data and the parity writes succeed.
    fn incoherent_stripe_write(
        self: &Rc<Self>,
        stripe_id: u64,
        wqd: Rc<WriteQuery>,
        wqp: Rc<WriteQuery>,
    ) -> IoResult {
        let guard = Rc::new(CoherenceGuard {
            state: Rc::clone(self),
            stripe_id,
            wqd: Rc::clone(&wqd),
            wqp: Rc::clone(&wqp),
        });

        let wrap = |q: &Rc<WriteQuery>| {
            let guard = Rc::clone(&guard);
            let parent = Rc::clone(q);
            WriteQuery::with_completer(q.buf().clone(), q.offset(), move |done| {
                if let Some(err) = done.err() {
                    parent.set_err(err);
                }
                drop(guard);
            })
        };
        let new_wqd = wrap(&wqd);
        let new_wqp = wrap(&wqp);
        drop((guard, wqd, wqp));
        self.be.stripe_write(stripe_id, new_wqd, new_wqp)
    }

    /// Advances the serialization chain of `stripe_id`: resubmit the next
    /// parked write or release the stripe bit. A flat agenda loop: inline
    /// completions re-enter from inside `process_stripe` and must not grow
    /// the stack.
    fn continue_stripe(self: &Rc<Self>, stripe_id: u64) {
        self.agenda.borrow_mut().push_back(stripe_id);
        if self.draining.get() {
            return;
        }
        self.draining.set(true);
        loop {
            let Some(sid) = self.agenda.borrow_mut().pop_front() else {
                break;
            };
            let next = {
                let mut pending = self.pending.borrow_mut();
                pending
                    .iter()
                    .position(|(id, _)| *id == sid)
                    .map(|index| pending.remove(index).1)
            };
            match next {
                Some(wq) => {
                    let _ = self.process_stripe(sid, wq);
                }
                None => self.locks.borrow_mut().unlock(sid as usize),
            }
        }
        self.draining.set(false);
    }
}

/// Records the outcome of a full-parity write once both halves are done:
/// the stripe is coherent iff neither half failed.
struct CoherenceGuard {
    state: Rc<AcceptorState>,
    stripe_id: u64,
    wqd: Rc<WriteQuery>,
    wqp: Rc<WriteQuery>,
}

impl Drop for CoherenceGuard {
    fn drop(&mut self) {
        let ok = self.wqd.err().is_none() && self.wqp.err().is_none();
        self.state
            .coherence
            .borrow_mut()
            .set(self.stripe_id as usize, ok);
    }
}

//! Test doubles for exercising handler stacks.
//!
//! [`MockLeaf`] is an in-memory leaf that records every submission and can
//! hold completions back, so tests can observe serialization order, park
//! queries behind locks, and inject failures at precise points.

use crate::buf::IoBuf;
use crate::error::{IoError, IoResult};
use crate::handler::RwHandler;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

enum Parked {
    Read(Rc<ReadQuery>),
    Write(Rc<WriteQuery>),
}

/// An instrumented in-memory leaf handler.
pub struct MockLeaf {
    mem: RefCell<Vec<u8>>,
    reads: RefCell<Vec<(u64, usize)>>,
    writes: RefCell<Vec<(u64, usize)>>,
    flushes: Cell<usize>,
    discards: RefCell<Vec<(u64, u64)>>,
    defer: Cell<bool>,
    parked: RefCell<VecDeque<Parked>>,
    fail_mode: Cell<Option<IoError>>,
}

impl MockLeaf {
    /// Zeroed leaf of `size` bytes.
    pub fn new(size: usize) -> Rc<Self> {
        Rc::new(Self {
            mem: RefCell::new(vec![0; size]),
            reads: RefCell::new(Vec::new()),
            writes: RefCell::new(Vec::new()),
            flushes: Cell::new(0),
            discards: RefCell::new(Vec::new()),
            defer: Cell::new(false),
            parked: RefCell::new(VecDeque::new()),
            fail_mode: Cell::new(None),
        })
    }

    /// Leaf pre-filled with a deterministic byte pattern; pair with
    /// [`MockLeaf::expected`] in assertions.
    pub fn with_pattern(size: usize) -> Rc<Self> {
        let leaf = Self::new(size);
        leaf.mem
            .borrow_mut()
            .iter_mut()
            .enumerate()
            .for_each(|(i, byte)| *byte = Self::pattern(i));
        leaf
    }

    fn pattern(i: usize) -> u8 {
        (i as u8) ^ ((i >> 8) as u8)
    }

    /// The pattern bytes a read of `[offset, offset+len)` should return.
    pub fn expected(&self, offset: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| Self::pattern(offset as usize + i))
            .collect()
    }

    /// From now on, completions wait for [`complete_next`](Self::complete_next)
    /// / [`complete_all`](Self::complete_all).
    pub fn defer_completions(&self) {
        self.defer.set(true);
    }

    /// From now on, every submission completes with `err`.
    pub fn fail_with(&self, err: IoError) {
        self.fail_mode.set(Some(err));
    }

    /// Clears [`fail_with`](Self::fail_with).
    pub fn heal(&self) {
        self.fail_mode.set(None);
    }

    /// Completes the oldest held-back submission.
    pub fn complete_next(&self) {
        let op = self.parked.borrow_mut().pop_front().expect("a parked op");
        self.perform(op);
    }

    /// Fails the oldest held-back submission with `err`.
    pub fn fail_next(&self, err: IoError) {
        let op = self.parked.borrow_mut().pop_front().expect("a parked op");
        match op {
            Parked::Read(rq) => rq.set_err(err),
            Parked::Write(wq) => wq.set_err(err),
        }
    }

    /// Completes everything held back, including submissions triggered by
    /// those completions.
    pub fn complete_all(&self) {
        loop {
            let Some(op) = self.parked.borrow_mut().pop_front() else {
                break;
            };
            self.perform(op);
        }
    }

    /// Fails everything held back with `err`.
    pub fn fail_all(&self, err: IoError) {
        loop {
            let Some(op) = self.parked.borrow_mut().pop_front() else {
                break;
            };
            match op {
                Parked::Read(rq) => rq.set_err(err),
                Parked::Write(wq) => wq.set_err(err),
            }
        }
    }

    /// `(offset, len)` of every read submitted so far.
    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.reads.borrow().clone()
    }

    /// `(offset, len)` of every write submitted so far.
    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.writes.borrow().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }

    pub fn discards(&self) -> Vec<(u64, u64)> {
        self.discards.borrow().clone()
    }

    /// Snapshot of the leaf's bytes.
    pub fn mem(&self) -> Vec<u8> {
        self.mem.borrow().clone()
    }

    /// Number of submissions currently held back.
    pub fn parked(&self) -> usize {
        self.parked.borrow().len()
    }

    fn perform(&self, op: Parked) {
        match op {
            Parked::Read(rq) => {
                let offset = rq.offset() as usize;
                let len = rq.buf().len();
                let mem = self.mem.borrow();
                match offset.checked_add(len).and_then(|end| mem.get(offset..end)) {
                    Some(src) => rq.buf().copy_from(src),
                    None => rq.set_err(IoError::OutOfBounds),
                }
            }
            Parked::Write(wq) => {
                let offset = wq.offset() as usize;
                let len = wq.buf().len();
                let mut mem = self.mem.borrow_mut();
                match offset
                    .checked_add(len)
                    .and_then(|end| mem.get_mut(offset..end))
                {
                    Some(dst) => wq.buf().copy_to(dst),
                    None => wq.set_err(IoError::OutOfBounds),
                }
            }
        }
    }

    fn accept(&self, op: Parked) -> IoResult {
        if let Some(err) = self.fail_mode.get() {
            match &op {
                Parked::Read(rq) => rq.set_err(err),
                Parked::Write(wq) => wq.set_err(err),
            }
            return Ok(());
        }
        if self.defer.get() {
            self.parked.borrow_mut().push_back(op);
        } else {
            self.perform(op);
        }
        Ok(())
    }
}

impl RwHandler for MockLeaf {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        self.reads.borrow_mut().push((rq.offset(), rq.buf().len()));
        self.accept(Parked::Read(rq))
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        self.writes.borrow_mut().push((wq.offset(), wq.buf().len()));
        self.accept(Parked::Write(wq))
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        self.flushes.set(self.flushes.get() + 1);
        if let Some(err) = self.fail_mode.get() {
            fq.set_err(err);
        }
        Ok(())
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        self.discards.borrow_mut().push((dq.offset(), dq.len()));
        Ok(())
    }
}

/// Fills an [`IoBuf`]-shaped payload with one byte (test shorthand).
pub fn payload(byte: u8, len: usize) -> IoBuf {
    IoBuf::from_vec(vec![byte; len])
}

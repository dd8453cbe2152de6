//! Reference-counted I/O queries with fire-once completers.
//!
//! A query is the unit of work handed between layers: a buffer view, a
//! device offset, a first-error-wins error slot, and a completer. The
//! completer fires exactly once, when the last `Rc` reference drops. A
//! parent query therefore stays pending as long as any subquery's completer
//! still holds it, and "all children done" needs no counting.
//!
//! Subqueries slice the parent's buffer and, in the common case, propagate
//! their error into the parent ([`ReadQuery::chained`] and friends). Layers
//! that need bookkeeping at completion time wrap a query with their own
//! completer instead.

use crate::buf::IoBuf;
use crate::error::IoError;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

/// Marker for read queries (the buffer is filled by the handler).
pub enum ReadMarker {}
/// Marker for write queries (the buffer is consumed by the handler).
pub enum WriteMarker {}

/// A read query carries a mutable destination view.
pub type ReadQuery = Query<ReadMarker>;
/// A write query carries an immutable payload view.
pub type WriteQuery = Query<WriteMarker>;

/// Shared shape of read and write queries. See the module docs.
pub struct Query<M> {
    buf: IoBuf,
    offset: u64,
    err: Cell<Option<IoError>>,
    #[allow(clippy::type_complexity)]
    completer: RefCell<Option<Box<dyn FnOnce(&Query<M>)>>>,
    _direction: PhantomData<M>,
}

impl<M: 'static> Query<M> {
    /// Creates a query with no completer (fire-and-forget).
    pub fn new(buf: IoBuf, offset: u64) -> Rc<Self> {
        assert!(!buf.is_empty());
        Rc::new(Self {
            buf,
            offset,
            err: Cell::new(None),
            completer: RefCell::new(None),
            _direction: PhantomData,
        })
    }

    /// Creates a query whose completer fires when the last reference drops.
    pub fn with_completer(
        buf: IoBuf,
        offset: u64,
        completer: impl FnOnce(&Query<M>) + 'static,
    ) -> Rc<Self> {
        assert!(!buf.is_empty());
        Rc::new(Self {
            buf,
            offset,
            err: Cell::new(None),
            completer: RefCell::new(Some(Box::new(completer))),
            _direction: PhantomData,
        })
    }

    /// Child query over `len` bytes of this query's buffer at `buf_off`,
    /// targeting device offset `offset`, with an explicit completer.
    pub fn subquery(
        self: &Rc<Self>,
        buf_off: usize,
        len: usize,
        offset: u64,
        completer: impl FnOnce(&Query<M>) + 'static,
    ) -> Rc<Self> {
        Self::with_completer(self.buf.slice(buf_off, len), offset, completer)
    }

    /// Child query that propagates its error into this one.
    ///
    /// The child's completer holds a reference to the parent, keeping the
    /// parent pending until every chained child has completed.
    pub fn chained(self: &Rc<Self>, buf_off: usize, len: usize, offset: u64) -> Rc<Self> {
        let parent = Rc::clone(self);
        self.subquery(buf_off, len, offset, move |child| {
            if let Some(err) = child.err() {
                parent.set_err(err);
            }
        })
    }

    /// The buffer view of this query.
    #[inline]
    pub fn buf(&self) -> &IoBuf {
        &self.buf
    }

    /// Absolute device offset of this query.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The error observed so far, if any.
    #[inline]
    pub fn err(&self) -> Option<IoError> {
        self.err.get()
    }

    /// Records an error. The first observed error wins; later ones are
    /// dropped.
    pub fn set_err(&self, err: IoError) {
        if self.err.get().is_none() {
            self.err.set(Some(err));
        }
    }
}

impl<M> Drop for Query<M> {
    fn drop(&mut self) {
        if let Some(completer) = self.completer.borrow_mut().take() {
            completer(self);
        }
    }
}

/// A flush query: no payload, only a completion.
pub struct FlushQuery {
    err: Cell<Option<IoError>>,
    #[allow(clippy::type_complexity)]
    completer: RefCell<Option<Box<dyn FnOnce(&FlushQuery)>>>,
}

impl FlushQuery {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            err: Cell::new(None),
            completer: RefCell::new(None),
        })
    }

    pub fn with_completer(completer: impl FnOnce(&FlushQuery) + 'static) -> Rc<Self> {
        Rc::new(Self {
            err: Cell::new(None),
            completer: RefCell::new(Some(Box::new(completer))),
        })
    }

    /// Child flush propagating its error into this one.
    pub fn chained(self: &Rc<Self>) -> Rc<Self> {
        let parent = Rc::clone(self);
        Self::with_completer(move |child| {
            if let Some(err) = child.err() {
                parent.set_err(err);
            }
        })
    }

    #[inline]
    pub fn err(&self) -> Option<IoError> {
        self.err.get()
    }

    pub fn set_err(&self, err: IoError) {
        if self.err.get().is_none() {
            self.err.set(Some(err));
        }
    }
}

impl Drop for FlushQuery {
    fn drop(&mut self) {
        if let Some(completer) = self.completer.borrow_mut().take() {
            completer(self);
        }
    }
}

/// A discard query: a device range and a completion.
pub struct DiscardQuery {
    offset: u64,
    len: u64,
    err: Cell<Option<IoError>>,
    #[allow(clippy::type_complexity)]
    completer: RefCell<Option<Box<dyn FnOnce(&DiscardQuery)>>>,
}

impl DiscardQuery {
    pub fn new(offset: u64, len: u64) -> Rc<Self> {
        Rc::new(Self {
            offset,
            len,
            err: Cell::new(None),
            completer: RefCell::new(None),
        })
    }

    pub fn with_completer(
        offset: u64,
        len: u64,
        completer: impl FnOnce(&DiscardQuery) + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            offset,
            len,
            err: Cell::new(None),
            completer: RefCell::new(Some(Box::new(completer))),
        })
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn err(&self) -> Option<IoError> {
        self.err.get()
    }

    pub fn set_err(&self, err: IoError) {
        if self.err.get().is_none() {
            self.err.set(Some(err));
        }
    }
}

impl Drop for DiscardQuery {
    fn drop(&mut self) {
        if let Some(completer) = self.completer.borrow_mut().take() {
            completer(self);
        }
    }
}

//! The per-target online/offline state machine.
//!
//! Two states, one one-way transition. A target goes offline when a
//! dispatcher rejects a request synchronously or when any subquery completer
//! observes a leaf error and raises [`Fsm::fail`]; once offline, every
//! request is answered with `EIO` until the process restarts.
//!
//! Events are process-queued: a `fail` raised from a completer while a
//! request is still being dispatched settles only after the dispatch
//! finishes, so the in-flight request observes a consistent state.

use crate::error::{IoError, IoResult};
use crate::handler::RwHandler;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::cell::Cell;
use std::rc::Rc;

/// State of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Online,
    Offline,
}

/// The state machine itself. Shared with completers via `Rc`.
pub struct Fsm {
    state: Cell<TargetState>,
    dispatching: Cell<bool>,
    deferred_fail: Cell<bool>,
}

impl Fsm {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(TargetState::Online),
            dispatching: Cell::new(false),
            deferred_fail: Cell::new(false),
        })
    }

    #[inline]
    pub fn state(&self) -> TargetState {
        self.state.get()
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.state.get() == TargetState::Online
    }

    /// The `fail` event. Immediate when idle; deferred to the end of the
    /// current dispatch otherwise.
    pub fn fail(&self) {
        if self.dispatching.get() {
            self.deferred_fail.set(true);
        } else {
            self.go_offline();
        }
    }

    /// Runs one dispatch with deferred `fail` delivery.
    fn dispatch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.dispatching.set(true);
        let result = f();
        self.dispatching.set(false);
        if self.deferred_fail.take() {
            self.go_offline();
        }
        result
    }

    fn go_offline(&self) {
        if self.state.replace(TargetState::Offline) == TargetState::Online {
            log::warn!("target going offline after a leaf failure");
        }
    }
}

/// An FSM-gated target: wraps a dispatcher backend and routes every request
/// through the state machine.
///
/// Reads and writes get a top-level subquery whose completer raises `fail`
/// on any propagated error; flush and discard are gated by state but raise
/// no events.
pub struct Gated<B: RwHandler> {
    backend: Rc<B>,
    fsm: Rc<Fsm>,
}

impl<B: RwHandler> Gated<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Rc::new(backend),
            fsm: Fsm::new(),
        }
    }

    pub fn state(&self) -> TargetState {
        self.fsm.state()
    }

    pub fn is_online(&self) -> bool {
        self.fsm.is_online()
    }

    /// The wrapped dispatcher (used by targets that expose extra queries,
    /// e.g. stripe coherence).
    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }
}

impl<B: RwHandler> RwHandler for Gated<B> {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        if !self.fsm.is_online() {
            rq.set_err(IoError::Offline);
            return Err(IoError::Offline);
        }

        let fsm = Rc::clone(&self.fsm);
        let parent = Rc::clone(&rq);
        let guarded = rq.subquery(0, rq.buf().len(), rq.offset(), move |q| {
            if let Some(err) = q.err() {
                parent.set_err(err);
                fsm.fail();
            }
        });

        let res = self.fsm.dispatch(|| self.backend.submit_read(guarded));
        if let Err(err) = res {
            rq.set_err(err);
            self.fsm.fail();
        }
        res
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        if !self.fsm.is_online() {
            wq.set_err(IoError::Offline);
            return Err(IoError::Offline);
        }

        let fsm = Rc::clone(&self.fsm);
        let parent = Rc::clone(&wq);
        let guarded = wq.subquery(0, wq.buf().len(), wq.offset(), move |q| {
            if let Some(err) = q.err() {
                parent.set_err(err);
                fsm.fail();
            }
        });

        let res = self.fsm.dispatch(|| self.backend.submit_write(guarded));
        if let Err(err) = res {
            wq.set_err(err);
            self.fsm.fail();
        }
        res
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        if !self.fsm.is_online() {
            fq.set_err(IoError::Offline);
            return Err(IoError::Offline);
        }
        self.backend.submit_flush(fq)
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        if !self.fsm.is_online() {
            dq.set_err(IoError::Offline);
            return Err(IoError::Offline);
        }
        self.backend.submit_discard(dq)
    }
}
